//! Per-project knowledge store with hybrid retrieval.
//!
//! One instance per project, handed out by [`crate::project::ProjectRegistry`].
//! The store owns the project's SQLite index (WAL mode) and serializes its
//! writes behind an async lock; searches read the pool concurrently and are
//! permitted to miss in-flight chunks.
//!
//! # Retrieval
//!
//! - **Lexical** — FTS5 BM25 over chunk text and parent titles.
//! - **Vector** — cosine similarity over stored chunk embeddings.
//! - **Hybrid** — reciprocal-rank fusion of both candidate lists, then a
//!   re-weighting pass: chunk-length normalization, configured label
//!   priors, and a small boost when a query token matches the document's
//!   keyword index. Near-identical hits (simhash distance ≤ 3) collapse to
//!   the better-scored one.
//!
//! Thread and label filters are applied post-retrieval because the
//! underlying indexes carry no pre-filters.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::chunk::{chunk_markdown, content_hash, simhash_distance};
use crate::config::Config;
use crate::db;
use crate::embedding::{self, EmbeddingProvider};
use crate::llm::LlmProvider;
use crate::migrate;
use crate::models::{IngestDoc, LabelCount, SearchHit, StoreStatus, TimelineEntry};
use crate::project::ProjectPaths;

/// Simhash Hamming distance at or under which two hits are near-identical.
const NEAR_DUP_DISTANCE: u32 = 3;

/// Keywords kept per document in the coarse entity index.
const KEYWORDS_PER_DOC: usize = 10;

/// Retrieval mode selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Lexical,
    Vector,
    Hybrid,
}

impl SearchMode {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "lexical" => Ok(SearchMode::Lexical),
            "vector" => Ok(SearchMode::Vector),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => bail!(
                "Unknown search mode: {}. Use lexical, vector, or hybrid.",
                other
            ),
        }
    }
}

/// Outcome of a single-document ingest.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IngestReport {
    pub title: String,
    pub chunks: usize,
    pub duplicate: bool,
}

/// Answer produced by [`KnowledgeStore::ask`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct AskResponse {
    pub question: String,
    /// Synthesized answer; absent in context-only mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    /// Rendered context block with `[n]` citations.
    pub context: String,
    pub hits: Vec<SearchHit>,
}

/// A project-scoped index over ingested documents.
pub struct KnowledgeStore {
    config: Arc<Config>,
    project_id: String,
    paths: ProjectPaths,
    pool: SqlitePool,
    embedder: Option<Box<dyn EmbeddingProvider>>,
    write_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl KnowledgeStore {
    /// Open (or create) the project index and run migrations.
    pub async fn open(
        config: Arc<Config>,
        project_id: &str,
        paths: ProjectPaths,
        http: reqwest::Client,
    ) -> Result<Self> {
        let pool = db::connect(&paths.index_file).await?;
        migrate::run_migrations(&pool).await?;

        let embedder = if config.embedding.is_enabled() {
            match embedding::create_provider(&config.embedding, http) {
                Ok(p) => Some(p),
                Err(err) => {
                    tracing::warn!(error = %err, "embedding provider unavailable, vector search off");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            config,
            project_id: project_id.to_string(),
            paths,
            pool,
            embedder,
            write_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("Knowledge store for project '{}' is closed", self.project_id);
        }
        Ok(())
    }

    // ============ Ingest ============

    /// Ingest one document: normalize, chunk, embed, commit.
    ///
    /// Duplicates by `(label, content_hash)` collapse to the existing
    /// document. A changed body under an existing `(title, label)` replaces
    /// the old chunks in the same transaction. Never partial: either every
    /// chunk of the document lands or none do.
    pub async fn ingest(&self, doc: &IngestDoc) -> Result<IngestReport> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock().await;
        self.ingest_locked(doc).await
    }

    /// Batched ingest; prior documents survive a mid-batch failure.
    pub async fn ingest_many(&self, docs: &[IngestDoc]) -> Result<Vec<IngestReport>> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock().await;
        let mut reports = Vec::with_capacity(docs.len());
        for doc in docs {
            let report = self
                .ingest_locked(doc)
                .await
                .with_context(|| format!("ingest failed for '{}'", doc.title))?;
            reports.push(report);
        }
        Ok(reports)
    }

    async fn ingest_locked(&self, doc: &IngestDoc) -> Result<IngestReport> {
        let text = normalize_markdown(&doc.text);
        let hash = content_hash(&text);

        // Same content under this label: collapse.
        let existing_hash: Option<String> = sqlx::query_scalar(
            "SELECT id FROM documents WHERE label = ? AND content_hash = ?",
        )
        .bind(&doc.label)
        .bind(&hash)
        .fetch_optional(&self.pool)
        .await?;
        if existing_hash.is_some() {
            return Ok(IngestReport {
                title: doc.title.clone(),
                chunks: 0,
                duplicate: true,
            });
        }

        // Same title whose body changed: replace in place.
        let replaced: Option<String> =
            sqlx::query_scalar("SELECT id FROM documents WHERE title = ? AND label = ?")
                .bind(&doc.title)
                .bind(&doc.label)
                .fetch_optional(&self.pool)
                .await?;

        let doc_id = replaced.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let chunks = chunk_markdown(
            &doc_id,
            &doc.title,
            &text,
            self.config.chunking.target_bytes,
            self.config.chunking.min_bytes,
        );

        // Embedding is best-effort; the lexical index alone is a valid commit.
        let vectors = match &self.embedder {
            Some(embedder) => {
                let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
                match embedder.embed(&texts).await {
                    Ok(vecs) => Some(vecs),
                    Err(err) => {
                        tracing::warn!(error = %err, title = %doc.title, "embedding failed, chunks stay lexical-only");
                        None
                    }
                }
            }
            None => None,
        };

        let mut metadata = doc.metadata.clone();
        if let Some(thread) = &doc.thread {
            metadata.insert("thread".to_string(), serde_json::json!(thread));
        }
        let metadata_json = serde_json::to_string(&metadata)?;
        let ingested_at = chrono::Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;

        if replaced.is_some() {
            sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
                .bind(&doc_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
                .bind(&doc_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM chunks WHERE document_id = ?")
                .bind(&doc_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM keywords WHERE document_id = ?")
                .bind(&doc_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "UPDATE documents SET body = ?, metadata_json = ?, thread = ?, content_hash = ?, ingested_at = ? WHERE id = ?",
            )
            .bind(&text)
            .bind(&metadata_json)
            .bind(&doc.thread)
            .bind(&hash)
            .bind(ingested_at)
            .bind(&doc_id)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                r#"
                INSERT INTO documents (id, title, label, body, metadata_json, thread, content_hash, ingested_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&doc_id)
            .bind(&doc.title)
            .bind(&doc.label)
            .bind(&text)
            .bind(&metadata_json)
            .bind(&doc.thread)
            .bind(&hash)
            .bind(ingested_at)
            .execute(&mut *tx)
            .await?;
        }

        for chunk in &chunks {
            sqlx::query(
                "INSERT INTO chunks (id, document_id, chunk_index, parent_title, text, hash, simhash) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.parent_title)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .bind(chunk.simhash)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO chunks_fts (chunk_id, document_id, title, text) VALUES (?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(&chunk.parent_title)
            .bind(&chunk.text)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(vectors) = &vectors {
            for (chunk, vector) in chunks.iter().zip(vectors.iter()) {
                sqlx::query(
                    "INSERT INTO chunk_vectors (chunk_id, document_id, embedding) VALUES (?, ?, ?)",
                )
                .bind(&chunk.id)
                .bind(&chunk.document_id)
                .bind(embedding::vec_to_blob(vector))
                .execute(&mut *tx)
                .await?;
            }
        }

        for keyword in extract_keywords(&text, KEYWORDS_PER_DOC) {
            sqlx::query("INSERT OR IGNORE INTO keywords (keyword, document_id) VALUES (?, ?)")
                .bind(&keyword)
                .bind(&doc_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        Ok(IngestReport {
            title: doc.title.clone(),
            chunks: chunks.len(),
            duplicate: false,
        })
    }

    /// When the titled document was last (re)ingested, if ever.
    pub async fn ingested_at_for_title(&self, title: &str) -> Result<Option<i64>> {
        self.ensure_open()?;
        let ts: Option<i64> =
            sqlx::query_scalar("SELECT ingested_at FROM documents WHERE title = ? ORDER BY ingested_at DESC LIMIT 1")
                .bind(title)
                .fetch_optional(&self.pool)
                .await?;
        Ok(ts)
    }

    // ============ Search ============

    /// Ranked retrieval over the project's chunks.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        mode: SearchMode,
        thread: Option<&str>,
        label: Option<&str>,
    ) -> Result<Vec<SearchHit>> {
        self.ensure_open()?;
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        if mode == SearchMode::Vector && self.embedder.is_none() {
            bail!(crate::error::ToolError::validation(
                "Mode 'vector' requires embeddings. Set [embedding] provider in config."
            ));
        }

        let candidate_k = self.config.retrieval.candidate_k;

        let lexical = if matches!(mode, SearchMode::Lexical | SearchMode::Hybrid) {
            self.lexical_candidates(query, candidate_k).await?
        } else {
            Vec::new()
        };

        let vector = if matches!(mode, SearchMode::Vector | SearchMode::Hybrid)
            && self.embedder.is_some()
        {
            self.vector_candidates(query, candidate_k).await?
        } else {
            Vec::new()
        };

        if lexical.is_empty() && vector.is_empty() {
            return Ok(Vec::new());
        }

        let fused = self.fuse(&lexical, &vector, query).await?;

        // Post-retrieval filters: the indexes have no pre-filters.
        let mut hits: Vec<SearchHit> = Vec::new();
        let mut seen_simhash: Vec<(i64, f64)> = Vec::new();
        for cand in fused {
            if let Some(want) = label {
                if cand.label != want {
                    continue;
                }
            }
            if let Some(want) = thread {
                if cand.thread.as_deref() != Some(want) {
                    continue;
                }
            }
            // Collapse near-identical chunks onto the better-scored one.
            let duplicate = seen_simhash.iter().any(|(sh, _)| {
                simhash_distance(*sh as u64, cand.simhash as u64) <= NEAR_DUP_DISTANCE
            });
            if duplicate {
                continue;
            }
            seen_simhash.push((cand.simhash, cand.score));

            hits.push(SearchHit {
                title: cand.title,
                label: cand.label,
                text: cand.text,
                score: cand.score,
                metadata: cand.metadata,
                chunk_index: cand.chunk_index,
            });
            if hits.len() >= top_k {
                break;
            }
        }
        Ok(hits)
    }

    async fn lexical_candidates(&self, query: &str, candidate_k: i64) -> Result<Vec<Candidate>> {
        let match_expr = fts_match_expr(query);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT f.chunk_id, f.document_id, rank,
                   c.chunk_index, c.text, c.simhash,
                   d.title, d.label, d.thread, d.metadata_json
            FROM chunks_fts f
            JOIN chunks c ON c.id = f.chunk_id
            JOIN documents d ON d.id = f.document_id
            WHERE chunks_fts MATCH ?
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(&match_expr)
        .bind(candidate_k)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .enumerate()
            .map(|(rank, row)| Candidate::from_row(row, rank))
            .collect())
    }

    async fn vector_candidates(&self, query: &str, candidate_k: i64) -> Result<Vec<Candidate>> {
        let embedder = match &self.embedder {
            Some(e) => e,
            None => return Ok(Vec::new()),
        };
        let query_vec = embedder
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))?;

        // Brute-force scan; project indexes stay small enough that ANN
        // structures are not worth the write amplification.
        let rows = sqlx::query(
            r#"
            SELECT cv.chunk_id, cv.document_id, cv.embedding,
                   c.chunk_index, c.text, c.simhash,
                   d.title, d.label, d.thread, d.metadata_json
            FROM chunk_vectors cv
            JOIN chunks c ON c.id = cv.chunk_id
            JOIN documents d ON d.id = cv.document_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut scored: Vec<(f32, &sqlx::sqlite::SqliteRow)> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vec = embedding::blob_to_vec(&blob);
                (embedding::cosine_similarity(&query_vec, &vec), row)
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(candidate_k as usize);

        Ok(scored
            .iter()
            .enumerate()
            .map(|(rank, (_, row))| Candidate::from_row(row, rank))
            .collect())
    }

    /// Reciprocal-rank fusion followed by the re-weighting heuristic.
    async fn fuse(
        &self,
        lexical: &[Candidate],
        vector: &[Candidate],
        query: &str,
    ) -> Result<Vec<Candidate>> {
        let rrf_k = self.config.retrieval.rrf_k;

        let mut by_chunk: HashMap<String, Candidate> = HashMap::new();
        let mut scores: HashMap<String, f64> = HashMap::new();

        for list in [lexical, vector] {
            for cand in list {
                *scores.entry(cand.chunk_id.clone()).or_insert(0.0) +=
                    1.0 / (rrf_k + cand.rank as f64 + 1.0);
                by_chunk
                    .entry(cand.chunk_id.clone())
                    .or_insert_with(|| cand.clone());
            }
        }

        let keyword_docs = self.keyword_matches(query).await?;

        let mut fused: Vec<Candidate> = by_chunk
            .into_values()
            .map(|mut cand| {
                let mut score = scores.get(&cand.chunk_id).copied().unwrap_or(0.0);

                // Chunk-length normalization: stubby chunks carry less signal.
                let len = cand.text.len() as f64;
                score *= len / (len + 200.0);

                // Configured label prior.
                if let Some(prior) = self.config.retrieval.label_priors.get(&cand.label) {
                    score *= prior;
                }

                // Keyword-index agreement.
                if keyword_docs.contains(&cand.document_id) {
                    score *= 1.1;
                }

                cand.score = score;
                cand
            })
            .collect();

        fused.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk_id.cmp(&b.chunk_id))
        });
        Ok(fused)
    }

    async fn keyword_matches(&self, query: &str) -> Result<HashSet<String>> {
        let mut out = HashSet::new();
        for token in query_tokens(query).into_iter().take(8) {
            let rows: Vec<String> =
                sqlx::query_scalar("SELECT document_id FROM keywords WHERE keyword = ?")
                    .bind(&token)
                    .fetch_all(&self.pool)
                    .await?;
            out.extend(rows);
        }
        Ok(out)
    }

    // ============ Ask ============

    /// Retrieve context for a question and optionally synthesize an answer.
    ///
    /// With `context_only` the top chunks are returned verbatim with `[n]`
    /// citations; otherwise the rendered context is handed to the sub-model
    /// for a retrieval-augmented answer. Degrades to plain search ranking
    /// when the store is sparse.
    pub async fn ask(
        &self,
        question: &str,
        context_only: bool,
        thread: Option<&str>,
        sub_model: Option<&dyn LlmProvider>,
    ) -> Result<AskResponse> {
        self.ensure_open()?;
        let mode = if self.embedder.is_some() {
            SearchMode::Hybrid
        } else {
            SearchMode::Lexical
        };
        let hits = self
            .search(question, self.config.retrieval.top_k, mode, thread, None)
            .await?;

        let mut context = String::new();
        for (i, hit) in hits.iter().enumerate() {
            context.push_str(&format!("[{}] {} ({})\n{}\n\n", i + 1, hit.title, hit.label, hit.text));
        }

        let answer = if context_only || hits.is_empty() {
            None
        } else {
            let provider = sub_model
                .ok_or_else(|| anyhow::anyhow!("Answer synthesis requires the sub-model"))?;
            let prompt = format!(
                "Answer the question using only the numbered context. Cite sources as [n].\n\n\
                 Context:\n{context}\nQuestion: {question}\nAnswer:"
            );
            let reply = provider.complete(&prompt).await?;
            Some(reply.text)
        };

        Ok(AskResponse {
            question: question.to_string(),
            answer,
            context,
            hits,
        })
    }

    // ============ Timeline / status / clear ============

    /// Titles in ingestion order, optionally bounded by Unix timestamps.
    pub async fn timeline(
        &self,
        since: Option<i64>,
        until: Option<i64>,
    ) -> Result<Vec<TimelineEntry>> {
        self.ensure_open()?;
        let rows = sqlx::query(
            r#"
            SELECT title, label, ingested_at FROM documents
            WHERE ingested_at >= ? AND ingested_at <= ?
            ORDER BY ingested_at ASC, title ASC
            "#,
        )
        .bind(since.unwrap_or(0))
        .bind(until.unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| TimelineEntry {
                title: row.get("title"),
                label: row.get("label"),
                ingested_at: row.get("ingested_at"),
            })
            .collect())
    }

    /// Size and shape of the project index.
    pub async fn status(&self) -> Result<StoreStatus> {
        self.ensure_open()?;
        let doc_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        let chunk_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let size_bytes = std::fs::metadata(&self.paths.index_file)
            .map(|m| m.len())
            .unwrap_or(0);

        let label_rows = sqlx::query(
            "SELECT label, COUNT(*) AS doc_count FROM documents GROUP BY label ORDER BY doc_count DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        let labels = label_rows
            .iter()
            .map(|row| LabelCount {
                label: row.get("label"),
                doc_count: row.get("doc_count"),
            })
            .collect();

        let threads: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT thread FROM documents WHERE thread IS NOT NULL ORDER BY thread",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(StoreStatus {
            doc_count,
            chunk_count,
            size_bytes,
            labels,
            threads,
        })
    }

    /// Delete the index file and reset in-memory state. Idempotent.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.pool.close().await;
        }
        for suffix in ["", "-wal", "-shm"] {
            let path = append_suffix(&self.paths.index_file, suffix);
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("failed to delete {}", path.display()))?;
            }
        }
        Ok(())
    }

    /// Close the pool without deleting anything.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.pool.close().await;
        }
    }
}

fn append_suffix(path: &std::path::Path, suffix: &str) -> std::path::PathBuf {
    if suffix.is_empty() {
        return path.to_path_buf();
    }
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    std::path::PathBuf::from(s)
}

// ============ Candidates ============

/// A candidate chunk from one retrieval list.
#[derive(Debug, Clone)]
struct Candidate {
    chunk_id: String,
    document_id: String,
    rank: usize,
    score: f64,
    title: String,
    label: String,
    thread: Option<String>,
    metadata: serde_json::Map<String, serde_json::Value>,
    text: String,
    chunk_index: i64,
    simhash: i64,
}

impl Candidate {
    fn from_row(row: &sqlx::sqlite::SqliteRow, rank: usize) -> Self {
        let metadata_json: String = row.get("metadata_json");
        let metadata = serde_json::from_str(&metadata_json).unwrap_or_default();
        Self {
            chunk_id: row.get("chunk_id"),
            document_id: row.get("document_id"),
            rank,
            score: 0.0,
            title: row.get("title"),
            label: row.get("label"),
            thread: row.get("thread"),
            metadata,
            text: row.get("text"),
            chunk_index: row.get("chunk_index"),
            simhash: row.get("simhash"),
        }
    }
}

// ============ Text helpers ============

/// Normalize an ingest body: LF endings, trimmed edges.
fn normalize_markdown(text: &str) -> String {
    text.replace("\r\n", "\n").trim().to_string()
}

/// Lowercased alphanumeric tokens of a query, deduplicated in order.
fn query_tokens(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for token in query.split(|c: char| !c.is_alphanumeric()) {
        let token = token.to_ascii_lowercase();
        if token.len() >= 2 && seen.insert(token.clone()) {
            out.push(token);
        }
    }
    out
}

/// Build a defensive FTS5 MATCH expression: quoted tokens, OR semantics.
///
/// OR keeps recall for partially matching queries; BM25 still ranks fuller
/// matches first. Raw user input never reaches the FTS parser.
fn fts_match_expr(query: &str) -> String {
    query_tokens(query)
        .into_iter()
        .take(32)
        .map(|t| format!("\"{t}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Frequency-ranked keywords for the coarse entity index.
fn extract_keywords(text: &str, limit: usize) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for token in text.split(|c: char| !c.is_alphanumeric()) {
        let token = token.to_ascii_lowercase();
        if token.len() >= 4 && !is_stopword(&token) {
            *counts.entry(token).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.into_iter().take(limit).map(|(k, _)| k).collect()
}

fn is_stopword(token: &str) -> bool {
    matches!(
        token,
        "this" | "that" | "with" | "from" | "have" | "will" | "your" | "when" | "then"
            | "there" | "which" | "would" | "could" | "should" | "about" | "into" | "only"
            | "also" | "more" | "than" | "them" | "they" | "were" | "been" | "each"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fts_match_expr_quotes_tokens() {
        let expr = fts_match_expr("https://example.com/a-b?c=1");
        assert!(expr.contains("\"https\""));
        assert!(expr.contains("\"example\""));
        assert!(expr.contains(" OR "));
        assert!(!expr.contains('?'));
    }

    #[test]
    fn test_fts_match_expr_empty_query() {
        assert_eq!(fts_match_expr("???"), "");
    }

    #[test]
    fn test_query_tokens_dedup() {
        assert_eq!(query_tokens("log log LOG commit"), vec!["log", "commit"]);
    }

    #[test]
    fn test_extract_keywords_ranks_by_frequency() {
        let text = "tokio runtime tokio runtime tokio scheduler executor";
        let keywords = extract_keywords(text, 2);
        assert_eq!(keywords[0], "tokio");
        assert_eq!(keywords[1], "runtime");
    }

    #[test]
    fn test_search_mode_parse() {
        assert_eq!(SearchMode::parse("lexical").unwrap(), SearchMode::Lexical);
        assert_eq!(SearchMode::parse("hybrid").unwrap(), SearchMode::Hybrid);
        assert!(SearchMode::parse("keyword").is_err());
    }

    #[test]
    fn test_normalize_markdown() {
        assert_eq!(normalize_markdown("  a\r\nb  "), "a\nb");
    }
}
