//! Core data models used throughout the harness.
//!
//! These types represent the documents, chunks, and search hits that flow
//! through the ingestion and retrieval pipeline, plus the records exchanged
//! with the kernel and the callback server.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// An ingestable unit of text before chunking.
#[derive(Debug, Clone)]
pub struct IngestDoc {
    /// Logical name: a URL for fetched docs, a path or identifier otherwise.
    pub title: String,
    /// Coarse bucket (source type or library name).
    pub label: String,
    /// Markdown body.
    pub text: String,
    /// Free-form metadata; well-known keys: `thread`, `source`, `library`,
    /// `url`, `markdown_source`.
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Optional thread namespace, also mirrored into metadata.
    pub thread: Option<String>,
}

impl IngestDoc {
    pub fn new(title: impl Into<String>, label: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            label: label.into(),
            text: text.into(),
            metadata: serde_json::Map::new(),
            thread: None,
        }
    }
}

/// A chunk of a document's body text, the unit of retrieval.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub parent_title: String,
    pub text: String,
    pub hash: String,
    pub simhash: i64,
}

/// A ranked hit returned by the knowledge store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub label: String,
    pub text: String,
    pub score: f64,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub chunk_index: i64,
}

/// Summary returned by `status()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStatus {
    pub doc_count: i64,
    pub chunk_count: i64,
    pub size_bytes: u64,
    pub labels: Vec<LabelCount>,
    pub threads: Vec<String>,
}

/// Per-label document count in a status report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelCount {
    pub label: String,
    pub doc_count: i64,
}

/// One entry of the ingestion timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub title: String,
    pub label: String,
    pub ingested_at: i64,
}

/// Which cascade tier produced a fetched markdown body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkdownSource {
    /// Content negotiation: the origin honored `Accept: text/markdown`.
    Negotiated,
    /// The HTML→markdown proxy produced the body.
    MarkdownNew,
    /// Local HTML conversion.
    Html2text,
}

impl MarkdownSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarkdownSource::Negotiated => "negotiated",
            MarkdownSource::MarkdownNew => "markdown_new",
            MarkdownSource::Html2text => "html2text",
        }
    }
}

/// Sidecar metadata written next to each cached raw document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchMeta {
    pub url: String,
    pub fetched_at: i64,
    pub content_hash: String,
    pub size_bytes: u64,
    pub markdown_source: MarkdownSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub markdown_tokens: Option<u64>,
}

/// Result of a single `fetch` operation, cache hits included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchOutcome {
    pub url: String,
    pub from_cache: bool,
    pub markdown_source: MarkdownSource,
    pub size_bytes: u64,
    pub chunks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub markdown_tokens: Option<u64>,
}

/// Manifest written next to each kernel snapshot file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub session_id: String,
    pub saved_at: i64,
    pub schema_version: u32,
}

/// Cumulative sub-model usage counters kept by the callback server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub calls_by_model: HashMap<String, u64>,
}

impl UsageSnapshot {
    /// Counter difference `self - earlier`, used to report per-run usage.
    pub fn diff(&self, earlier: &UsageSnapshot) -> UsageSnapshot {
        let mut calls_by_model = HashMap::new();
        for (model, count) in &self.calls_by_model {
            let before = earlier.calls_by_model.get(model).copied().unwrap_or(0);
            if *count > before {
                calls_by_model.insert(model.clone(), count - before);
            }
        }
        UsageSnapshot {
            calls: self.calls.saturating_sub(earlier.calls),
            input_tokens: self.input_tokens.saturating_sub(earlier.input_tokens),
            output_tokens: self.output_tokens.saturating_sub(earlier.output_tokens),
            calls_by_model,
        }
    }
}

/// One turn of a sub-agent trajectory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "turn", rename_all = "snake_case")]
pub enum TrajectoryTurn {
    /// The main model was consulted; `reply` is its raw answer.
    ModelCall { reply: String },
    /// Code was sent to the kernel.
    KernelExecution { code: String },
    /// The kernel answered; output is truncated to the configured cap.
    KernelOutput { stdout: String, stderr: String },
    /// Terminal turn carrying the structured result.
    Submission { outputs: serde_json::Value },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markdown_source_wire_names() {
        assert_eq!(
            serde_json::to_string(&MarkdownSource::Negotiated).unwrap(),
            "\"negotiated\""
        );
        assert_eq!(
            serde_json::to_string(&MarkdownSource::MarkdownNew).unwrap(),
            "\"markdown_new\""
        );
        assert_eq!(
            serde_json::to_string(&MarkdownSource::Html2text).unwrap(),
            "\"html2text\""
        );
    }

    #[test]
    fn test_usage_diff() {
        let mut before = UsageSnapshot::default();
        before.calls = 2;
        before.input_tokens = 100;
        before.calls_by_model.insert("mini".into(), 2);

        let mut after = before.clone();
        after.calls = 5;
        after.input_tokens = 250;
        after.output_tokens = 40;
        *after.calls_by_model.get_mut("mini").unwrap() = 4;
        after.calls_by_model.insert("large".into(), 1);

        let diff = after.diff(&before);
        assert_eq!(diff.calls, 3);
        assert_eq!(diff.input_tokens, 150);
        assert_eq!(diff.output_tokens, 40);
        assert_eq!(diff.calls_by_model.get("mini"), Some(&2));
        assert_eq!(diff.calls_by_model.get("large"), Some(&1));
    }

    #[test]
    fn test_fetch_meta_optional_tokens_omitted() {
        let meta = FetchMeta {
            url: "https://example.com/doc".into(),
            fetched_at: 1_700_000_000,
            content_hash: "abc".into(),
            size_bytes: 10,
            markdown_source: MarkdownSource::Negotiated,
            markdown_tokens: None,
        };
        let json = serde_json::to_string(&meta).unwrap();
        assert!(!json.contains("markdown_tokens"));
    }
}
