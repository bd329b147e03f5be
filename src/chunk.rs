//! Markdown-section chunker.
//!
//! Splits document bodies that exceed a target size along markdown section
//! boundaries so a single large document does not dominate retrieval, then
//! merges undersized neighbors back together. Heading lines inside fenced
//! code blocks are not treated as boundaries.
//!
//! Each chunk receives a SHA-256 hash of its text for staleness detection
//! and a 64-bit simhash for near-duplicate lookups.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Chunk;

/// Split `text` into chunks on markdown section boundaries.
///
/// Sections are merged greedily up to `target_bytes`; sections smaller than
/// `min_bytes` never stand alone. A section larger than `target_bytes` is
/// split again on paragraph boundaries. Returns chunks with contiguous
/// indices starting at 0; every document yields at least one chunk.
pub fn chunk_markdown(
    document_id: &str,
    parent_title: &str,
    text: &str,
    target_bytes: usize,
    min_bytes: usize,
) -> Vec<Chunk> {
    if text.len() <= target_bytes {
        return vec![make_chunk(document_id, parent_title, 0, text.trim())];
    }

    let sections = split_sections(text);

    // Greedy merge: grow the buffer until the next section would push it
    // past the target, but never flush a buffer below the minimum.
    let mut pieces: Vec<String> = Vec::new();
    let mut buf = String::new();
    for section in &sections {
        let section = section.trim();
        if section.is_empty() {
            continue;
        }
        if !buf.is_empty() && buf.len() + section.len() + 2 > target_bytes && buf.len() >= min_bytes
        {
            pieces.push(std::mem::take(&mut buf));
        }
        if !buf.is_empty() {
            buf.push_str("\n\n");
        }
        buf.push_str(section);

        if buf.len() > target_bytes {
            for part in split_oversized(&buf, target_bytes) {
                pieces.push(part);
            }
            buf.clear();
        }
    }
    if !buf.is_empty() {
        // A trailing fragment below the minimum folds into the last piece.
        if buf.len() < min_bytes {
            if let Some(last) = pieces.last_mut() {
                last.push_str("\n\n");
                last.push_str(&buf);
            } else {
                pieces.push(buf);
            }
        } else {
            pieces.push(buf);
        }
    }

    if pieces.is_empty() {
        return vec![make_chunk(document_id, parent_title, 0, text.trim())];
    }

    pieces
        .iter()
        .enumerate()
        .map(|(i, piece)| make_chunk(document_id, parent_title, i as i64, piece.trim()))
        .collect()
}

/// Split markdown into sections at heading lines, skipping fenced code.
fn split_sections(text: &str) -> Vec<String> {
    let mut sections: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_fence = false;

    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
        }

        if !in_fence && is_heading(trimmed) && !current.trim().is_empty() {
            sections.push(std::mem::take(&mut current));
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        sections.push(current);
    }
    sections
}

fn is_heading(line: &str) -> bool {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    (1..=6).contains(&hashes) && line[hashes..].starts_with(' ')
}

/// Split a section that exceeds the target on paragraph boundaries,
/// hard-splitting any paragraph that is itself oversized.
fn split_oversized(section: &str, target_bytes: usize) -> Vec<String> {
    let mut parts = Vec::new();
    let mut buf = String::new();

    for para in section.split("\n\n") {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }
        if !buf.is_empty() && buf.len() + para.len() + 2 > target_bytes {
            parts.push(std::mem::take(&mut buf));
        }
        if para.len() > target_bytes {
            if !buf.is_empty() {
                parts.push(std::mem::take(&mut buf));
            }
            let mut rest = para;
            while rest.len() > target_bytes {
                let cut = floor_char_boundary(rest, target_bytes);
                let split_at = rest[..cut]
                    .rfind('\n')
                    .or_else(|| rest[..cut].rfind(' '))
                    .map(|pos| pos + 1)
                    .unwrap_or(cut);
                parts.push(rest[..split_at].trim().to_string());
                rest = &rest[split_at..];
            }
            if !rest.trim().is_empty() {
                buf.push_str(rest.trim());
            }
        } else {
            if !buf.is_empty() {
                buf.push_str("\n\n");
            }
            buf.push_str(para);
        }
    }
    if !buf.is_empty() {
        parts.push(buf);
    }
    parts
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn make_chunk(document_id: &str, parent_title: &str, index: i64, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        parent_title: parent_title.to_string(),
        text: text.to_string(),
        hash,
        simhash: simhash64(text) as i64,
    }
}

/// Content hash over normalized text (trimmed, LF line endings).
pub fn content_hash(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n");
    let mut hasher = Sha256::new();
    hasher.update(normalized.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// 64-bit simhash over whitespace tokens.
///
/// Near-duplicate texts land within a small Hamming distance; the store
/// uses equality of the full hash as a cheap first-pass duplicate probe.
pub fn simhash64(text: &str) -> u64 {
    let mut weights = [0i64; 64];
    for token in text.split_whitespace() {
        let mut hasher = Sha256::new();
        hasher.update(token.to_ascii_lowercase().as_bytes());
        let digest = hasher.finalize();
        let mut h = [0u8; 8];
        h.copy_from_slice(&digest[..8]);
        let h = u64::from_le_bytes(h);
        for (bit, weight) in weights.iter_mut().enumerate() {
            if h >> bit & 1 == 1 {
                *weight += 1;
            } else {
                *weight -= 1;
            }
        }
    }
    let mut out = 0u64;
    for (bit, weight) in weights.iter().enumerate() {
        if *weight > 0 {
            out |= 1 << bit;
        }
    }
    out
}

/// Hamming distance between two simhashes.
pub fn simhash_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(heading: &str, lines: usize) -> String {
        let mut s = format!("## {heading}\n\n");
        for i in 0..lines {
            s.push_str(&format!("Sentence {i} about {heading} internals.\n"));
        }
        s
    }

    #[test]
    fn test_small_document_single_chunk() {
        let chunks = chunk_markdown("d1", "t", "# Title\n\nShort body.", 3072, 512);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].parent_title, "t");
    }

    #[test]
    fn test_large_document_splits_on_headings() {
        let text = format!(
            "{}{}{}{}",
            section("alpha", 40),
            section("beta", 40),
            section("gamma", 40),
            section("delta", 40)
        );
        let chunks = chunk_markdown("d1", "t", &text, 2048, 256);
        assert!(chunks.len() > 1, "expected a split, got {}", chunks.len());
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
        }
        // Every chunk should start at a section boundary.
        assert!(chunks.iter().all(|c| c.text.starts_with("##")));
    }

    #[test]
    fn test_small_neighbors_merge() {
        let mut text = String::new();
        for i in 0..30 {
            text.push_str(&format!("## h{i}\n\ntiny\n\n"));
        }
        let chunks = chunk_markdown("d1", "t", &text, 200, 100);
        // 30 tiny sections must not produce 30 chunks.
        assert!(chunks.len() < 30);
    }

    #[test]
    fn test_heading_inside_fence_is_not_a_boundary() {
        let mut text = String::from("## real\n\n```\n# not a heading\ncode\n```\n\n");
        text.push_str(&section("next", 80));
        let chunks = chunk_markdown("d1", "t", &text, 1024, 64);
        assert!(chunks
            .iter()
            .all(|c| !c.text.trim_start().starts_with("# not a heading")));
    }

    #[test]
    fn test_deterministic_hashes() {
        let text = section("alpha", 100);
        let a = chunk_markdown("d1", "t", &text, 1024, 128);
        let b = chunk_markdown("d1", "t", &text, 1024, 128);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.hash, y.hash);
            assert_eq!(x.simhash, y.simhash);
        }
    }

    #[test]
    fn test_content_hash_normalizes_line_endings() {
        assert_eq!(content_hash("a\r\nb"), content_hash("a\nb"));
        assert_eq!(content_hash("  a\nb  "), content_hash("a\nb"));
    }

    #[test]
    fn test_simhash_near_duplicates_are_close() {
        let a = "The quick brown fox jumps over the lazy dog near the river bank today";
        let b = "The quick brown fox jumps over the lazy dog near the river bank yesterday";
        let c = "Completely unrelated text about database write ahead logging internals";
        let d_ab = simhash_distance(simhash64(a), simhash64(b));
        let d_ac = simhash_distance(simhash64(a), simhash64(c));
        assert!(d_ab < d_ac, "near-dup {d_ab} should beat unrelated {d_ac}");
    }

    #[test]
    fn test_oversized_paragraph_hard_split() {
        let long_para = "word ".repeat(2000);
        let chunks = chunk_markdown("d1", "t", &long_para, 1024, 128);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.text.len() <= 1024 + 8));
    }
}
