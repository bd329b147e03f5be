//! Markdown acquisition: cascade, cache, and ingest.
//!
//! Converts a URL to markdown through a three-tier cascade, stopping at the
//! first success whose body is plausibly markdown:
//!
//! 1. **Negotiated** — `GET` with `Accept: text/markdown`.
//! 2. **Proxy** — `GET` against the HTML→markdown proxy with the URL appended.
//! 3. **Conversion** — `GET` the original URL, convert HTML locally.
//!
//! Fetched markdown is stored twice: verbatim under the project's raw
//! directory (atomic write, JSON sidecar) and chunked into the knowledge
//! index. Cached entries inside the freshness window short-circuit without
//! network I/O. The blocklist is applied before the cascade and therefore
//! also before any URL is forwarded to the proxy.
//!
//! Every failure is a categorized [`ToolError`] value; nothing in this
//! module panics or raises past the tool boundary, so compound operations
//! (sitemaps, research) never abort on a single bad URL.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use url::Url;

use crate::chunk::content_hash;
use crate::config::Config;
use crate::error::{ErrorKind, ToolError, ToolResult};
use crate::models::{FetchMeta, FetchOutcome, IngestDoc, MarkdownSource};
use crate::store::KnowledgeStore;

/// Smallest body the markdown heuristic will accept.
const MIN_MARKDOWN_BYTES: usize = 120;

/// Summary of a sitemap expansion.
#[derive(Debug, Clone, Serialize)]
pub struct SitemapReport {
    pub sitemap_url: String,
    pub discovered: usize,
    pub fetched: usize,
    pub from_cache: usize,
    pub failed: Vec<FetchFailure>,
}

/// Summary of a directory load.
#[derive(Debug, Clone, Serialize)]
pub struct DirLoadReport {
    pub pattern: String,
    pub loaded: usize,
    pub skipped: usize,
}

/// One failed URL inside a compound operation.
#[derive(Debug, Clone, Serialize)]
pub struct FetchFailure {
    pub url: String,
    pub error_kind: ErrorKind,
    pub message: String,
}

/// The markdown fetcher. Cheap to clone; tasks share the HTTP client.
#[derive(Clone)]
pub struct Fetcher {
    config: Arc<Config>,
    http: reqwest::Client,
}

impl Fetcher {
    pub fn new(config: Arc<Config>, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    // ============ Single fetch ============

    /// Fetch one URL into the store, honoring cache freshness.
    pub async fn fetch(
        &self,
        store: &KnowledgeStore,
        raw_url: &str,
        force: bool,
    ) -> ToolResult<FetchOutcome> {
        let url = Url::parse(raw_url)
            .map_err(|_| ToolError::validation(format!("'{raw_url}' is not a valid URL.")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ToolError::validation(format!(
                "Only http(s) URLs can be fetched, got '{}'.",
                url.scheme()
            )));
        }

        let host = normalized_host(&url)
            .ok_or_else(|| ToolError::validation("The URL has no hostname."))?;
        if let Some(entry) = blocked_by(&host, &self.config.fetcher.effective_blocklist()) {
            return Err(ToolError::blocked(format!(
                "The host '{host}' is refused by policy ({entry})."
            )));
        }

        let raw_path = store.paths().raw_dir.join(cache_rel_path(&url));
        let meta_path = meta_path_for(&raw_path);

        if !force {
            if let Some(outcome) = self.try_cache(store, &raw_path, &meta_path).await? {
                return Ok(outcome);
            }
        }

        let (body, source, tokens) = self.cascade(&url).await?;

        let meta = FetchMeta {
            url: url.to_string(),
            fetched_at: chrono::Utc::now().timestamp(),
            content_hash: content_hash(&body),
            size_bytes: body.len() as u64,
            markdown_source: source,
            markdown_tokens: tokens,
        };
        write_raw_atomic(&raw_path, &body, &meta_path, &meta)
            .map_err(|err| {
                tracing::error!(error = %err, "raw cache write failed");
                ToolError::internal("Writing the raw document cache failed.")
            })?;

        let report = store
            .ingest(&ingest_doc_for(&url, &host, &body, source))
            .await
            .map_err(ToolError::from)?;

        Ok(FetchOutcome {
            url: url.to_string(),
            from_cache: false,
            markdown_source: source,
            size_bytes: body.len() as u64,
            chunks: report.chunks,
            markdown_tokens: tokens,
        })
    }

    /// Serve from the raw cache when the entry is inside the freshness
    /// window. A raw file newer than its index entry re-ingests first, so
    /// cache and index converge without network I/O.
    async fn try_cache(
        &self,
        store: &KnowledgeStore,
        raw_path: &Path,
        meta_path: &Path,
    ) -> ToolResult<Option<FetchOutcome>> {
        if !raw_path.exists() || !meta_path.exists() {
            return Ok(None);
        }
        let meta: FetchMeta = match std::fs::read_to_string(meta_path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
        {
            Some(meta) => meta,
            None => return Ok(None),
        };

        let age = chrono::Utc::now().timestamp() - meta.fetched_at;
        let window = self.config.fetcher.freshness_days * 86_400;
        if age >= window {
            return Ok(None);
        }

        let indexed_at = store
            .ingested_at_for_title(&meta.url)
            .await
            .map_err(ToolError::from)?;
        let mut chunks = 0;
        if indexed_at.map(|ts| ts < meta.fetched_at).unwrap_or(true) {
            let body = std::fs::read_to_string(raw_path)
                .map_err(|_| ToolError::internal("The cached raw document is unreadable."))?;
            let url = Url::parse(&meta.url)
                .map_err(|_| ToolError::internal("The cached metadata holds an invalid URL."))?;
            let host = normalized_host(&url).unwrap_or_default();
            let report = store
                .ingest(&ingest_doc_for(&url, &host, &body, meta.markdown_source))
                .await
                .map_err(ToolError::from)?;
            chunks = report.chunks;
        }

        Ok(Some(FetchOutcome {
            url: meta.url.clone(),
            from_cache: true,
            markdown_source: meta.markdown_source,
            size_bytes: meta.size_bytes,
            chunks,
            markdown_tokens: meta.markdown_tokens,
        }))
    }

    // ============ Cascade ============

    async fn cascade(
        &self,
        url: &Url,
    ) -> ToolResult<(String, MarkdownSource, Option<u64>)> {
        // Tier 1: content negotiation.
        match self.get(url.as_str(), true).await {
            Ok(response) => {
                let content_type = header(&response, "content-type");
                let tokens = token_hint(&response);
                let body = self.read_body(response).await?;
                if content_type.contains("text/markdown") || looks_like_markdown(&body) {
                    return Ok((body, MarkdownSource::Negotiated, tokens));
                }
            }
            Err(err) if err.kind == ErrorKind::Timeout => return Err(err),
            Err(_) => {}
        }

        // Tier 2: proxy. The blocklist already ran, so the URL may leave.
        let proxy_url = format!(
            "{}{}",
            self.config.fetcher.proxy_base,
            url.as_str()
        );
        match self.get(&proxy_url, true).await {
            Ok(response) => {
                let tokens = token_hint(&response);
                let body = self.read_body(response).await?;
                if looks_like_markdown(&body) {
                    return Ok((body, MarkdownSource::MarkdownNew, tokens));
                }
            }
            Err(_) => {}
        }

        // Tier 3: raw HTML, converted locally.
        let response = self.get(url.as_str(), false).await?;
        let html = self.read_body(response).await?;
        let markdown = htmd::convert(&html)
            .map_err(|_| ToolError::internal("HTML conversion produced no markdown."))?;
        if markdown.trim().is_empty() {
            return Err(ToolError::new(
                ErrorKind::NotFound,
                "The URL yielded no convertible content.",
            ));
        }
        Ok((markdown, MarkdownSource::Html2text, None))
    }

    async fn get(&self, url: &str, negotiate: bool) -> ToolResult<reqwest::Response> {
        let mut request = self
            .http
            .get(url)
            .timeout(Duration::from_secs(self.config.fetcher.timeout_secs));
        if negotiate {
            request = request.header("Accept", "text/markdown");
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                ToolError::timeout(format!("Fetching '{url}' timed out."))
            } else {
                ToolError::transport(format!("Fetching '{url}' failed: connection error."))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::transport(format!(
                "Fetching '{url}' returned HTTP {status}."
            )));
        }
        Ok(response)
    }

    async fn read_body(&self, response: reqwest::Response) -> ToolResult<String> {
        response
            .text()
            .await
            .map_err(|_| ToolError::transport("Reading the response body failed."))
    }

    // ============ Sitemap expansion ============

    /// Fetch every `<loc>` entry of a sitemap with bounded concurrency.
    pub async fn fetch_sitemap(
        &self,
        store: Arc<KnowledgeStore>,
        sitemap_url: &str,
    ) -> ToolResult<SitemapReport> {
        let url = Url::parse(sitemap_url)
            .map_err(|_| ToolError::validation(format!("'{sitemap_url}' is not a valid URL.")))?;
        let host = normalized_host(&url)
            .ok_or_else(|| ToolError::validation("The sitemap URL has no hostname."))?;
        if let Some(entry) = blocked_by(&host, &self.config.fetcher.effective_blocklist()) {
            return Err(ToolError::blocked(format!(
                "The host '{host}' is refused by policy ({entry})."
            )));
        }

        let response = self.get(url.as_str(), false).await?;
        let xml = self.read_body(response).await?;
        let mut locs = parse_sitemap_locs(&xml);
        locs.truncate(self.config.fetcher.sitemap_limit);
        let discovered = locs.len();

        let semaphore = Arc::new(Semaphore::new(self.config.fetcher.sitemap_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for loc in locs {
            let fetcher = self.clone();
            let store = store.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire().await;
                let outcome = fetcher.fetch(&store, &loc, false).await;
                (loc, outcome)
            });
        }

        let mut fetched = 0;
        let mut from_cache = 0;
        let mut failed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let Ok((loc, outcome)) = joined else { continue };
            match outcome {
                Ok(o) if o.from_cache => from_cache += 1,
                Ok(_) => fetched += 1,
                Err(err) => failed.push(FetchFailure {
                    url: loc,
                    error_kind: err.kind,
                    message: err.message,
                }),
            }
        }

        Ok(SitemapReport {
            sitemap_url: sitemap_url.to_string(),
            discovered,
            fetched,
            from_cache,
            failed,
        })
    }

    // ============ Directory load ============

    /// Ingest local files matching a glob, relative paths as titles.
    pub async fn load_dir(
        &self,
        store: &KnowledgeStore,
        pattern: &str,
    ) -> ToolResult<DirLoadReport> {
        let glob = globset::GlobBuilder::new(pattern)
            .literal_separator(false)
            .build()
            .map_err(|_| ToolError::validation(format!("'{pattern}' is not a valid glob.")))?
            .compile_matcher();

        let root = glob_root(pattern);
        let mut loaded = 0;
        let mut skipped = 0;
        let mut docs = Vec::new();

        for entry in walkdir::WalkDir::new(&root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if !glob.is_match(path) {
                continue;
            }
            match std::fs::read_to_string(path) {
                Ok(text) => {
                    let title = path
                        .strip_prefix(&root)
                        .unwrap_or(path)
                        .display()
                        .to_string();
                    let mut doc = IngestDoc::new(title, "local", text);
                    doc.metadata
                        .insert("source".into(), serde_json::json!("directory"));
                    docs.push(doc);
                    loaded += 1;
                }
                Err(_) => skipped += 1,
            }
        }

        store.ingest_many(&docs).await.map_err(ToolError::from)?;

        Ok(DirLoadReport {
            pattern: pattern.to_string(),
            loaded,
            skipped,
        })
    }
}

// ============ URL helpers ============

/// Hostname lowered and stripped of `www.` / `docs.` prefixes.
pub fn normalized_host(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_ascii_lowercase();
    let host = host
        .strip_prefix("www.")
        .or_else(|| host.strip_prefix("docs."))
        .unwrap_or(&host);
    Some(host.to_string())
}

/// The blocklist entry matching this host, if any. Suffix semantics:
/// `example.com` blocks `example.com` and `sub.example.com`.
pub fn blocked_by(host: &str, blocklist: &[String]) -> Option<String> {
    for entry in blocklist {
        let entry = entry.trim().to_ascii_lowercase();
        if entry.is_empty() {
            continue;
        }
        if host == entry || host.ends_with(&format!(".{entry}")) {
            return Some(entry);
        }
    }
    None
}

/// Library label derived from the hostname: the first label after prefix
/// stripping (`docs.tokio.rs` → `tokio`).
fn library_label(host: &str) -> String {
    host.split('.').next().unwrap_or(host).to_string()
}

fn ingest_doc_for(url: &Url, host: &str, body: &str, source: MarkdownSource) -> IngestDoc {
    let mut doc = IngestDoc::new(url.to_string(), library_label(host), body.to_string());
    doc.metadata.insert("url".into(), serde_json::json!(url.to_string()));
    doc.metadata
        .insert("source".into(), serde_json::json!("fetch"));
    doc.metadata
        .insert("library".into(), serde_json::json!(library_label(host)));
    doc.metadata.insert(
        "markdown_source".into(),
        serde_json::json!(source.as_str()),
    );
    doc
}

/// Cache-relative path for a URL: `host/sanitized/path.md`.
pub fn cache_rel_path(url: &Url) -> PathBuf {
    let host = url.host_str().unwrap_or("unknown").to_ascii_lowercase();
    let mut rel = PathBuf::from(sanitize_segment(&host));
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();

    if segments.is_empty() {
        rel.push("index");
    } else {
        for segment in &segments {
            rel.push(sanitize_segment(segment));
        }
    }
    if let Some(query) = url.query() {
        let tail = rel.file_name().map(|f| f.to_string_lossy().to_string());
        if let Some(tail) = tail {
            rel.set_file_name(format!("{tail}_{}", sanitize_segment(query)));
        }
    }
    rel.set_extension("md");
    rel
}

fn sanitize_segment(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    // ".." would escape the raw directory.
    if cleaned.trim_matches('.').is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

fn meta_path_for(raw_path: &Path) -> PathBuf {
    let mut s = raw_path.as_os_str().to_os_string();
    s.push(".meta.json");
    PathBuf::from(s)
}

fn glob_root(pattern: &str) -> PathBuf {
    let prefix: String = pattern
        .chars()
        .take_while(|c| !matches!(c, '*' | '?' | '[' | '{'))
        .collect();
    let path = Path::new(&prefix);
    let root = if prefix.ends_with('/') {
        path.to_path_buf()
    } else {
        path.parent().map(|p| p.to_path_buf()).unwrap_or_default()
    };
    if root.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        root
    }
}

// ============ Body heuristics and storage ============

/// Whether a response body is plausibly markdown rather than HTML.
pub fn looks_like_markdown(body: &str) -> bool {
    if body.len() < MIN_MARKDOWN_BYTES {
        return false;
    }
    let head = body.trim_start();
    if head.starts_with("<!DOCTYPE") || head.starts_with("<!doctype") || head.starts_with("<html") {
        return false;
    }

    let mut headings = 0;
    let mut list_lines = 0;
    let mut fences = 0;
    for line in body.lines() {
        let trimmed = line.trim_start();
        let hashes = trimmed.chars().take_while(|c| *c == '#').count();
        if (1..=6).contains(&hashes) && trimmed[hashes..].starts_with(' ') {
            headings += 1;
        }
        if trimmed.starts_with("- ") || trimmed.starts_with("* ") || trimmed.starts_with("1. ") {
            list_lines += 1;
        }
        if trimmed.starts_with("```") {
            fences += 1;
        }
    }
    headings > 0 || fences >= 2 || list_lines >= 3
}

fn header(response: &reqwest::Response, name: &str) -> String {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

fn token_hint(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get("x-markdown-tokens")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Write raw markdown and its sidecar atomically (temp file, then rename).
fn write_raw_atomic(
    raw_path: &Path,
    body: &str,
    meta_path: &Path,
    meta: &FetchMeta,
) -> anyhow::Result<()> {
    if let Some(parent) = raw_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = raw_path.with_extension("md.tmp");
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, raw_path)?;

    let tmp_meta = meta_path.with_extension("json.tmp");
    std::fs::write(&tmp_meta, serde_json::to_vec_pretty(meta)?)?;
    std::fs::rename(&tmp_meta, meta_path)?;
    Ok(())
}

/// Collect `<loc>` entries from a sitemap, nested indexes included.
pub fn parse_sitemap_locs(xml: &str) -> Vec<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut locs = Vec::new();
    let mut in_loc = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == b"loc" => in_loc = true,
            Ok(Event::End(e)) if e.name().as_ref() == b"loc" => in_loc = false,
            Ok(Event::Text(text)) if in_loc => {
                if let Ok(value) = text.unescape() {
                    let value = value.trim().to_string();
                    if !value.is_empty() && !locs.contains(&value) {
                        locs.push(value);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
    }
    locs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocklist_matches_all_prefix_variants() {
        let blocklist = vec!["spamfarm.example".to_string()];
        for raw in [
            "https://spamfarm.example/page",
            "https://www.spamfarm.example/page",
            "https://docs.spamfarm.example/page",
        ] {
            let url = Url::parse(raw).unwrap();
            let host = normalized_host(&url).unwrap();
            assert!(
                blocked_by(&host, &blocklist).is_some(),
                "expected {raw} to be blocked"
            );
        }
    }

    #[test]
    fn test_blocklist_suffix_semantics() {
        let blocklist = vec!["example.com".to_string()];
        assert!(blocked_by("example.com", &blocklist).is_some());
        assert!(blocked_by("sub.example.com", &blocklist).is_some());
        assert!(blocked_by("notexample.com", &blocklist).is_none());
    }

    #[test]
    fn test_cache_rel_path_shapes() {
        let url = Url::parse("https://docs.tokio.rs/tokio/latest/sync?q=1").unwrap();
        let rel = cache_rel_path(&url);
        let s = rel.display().to_string();
        assert!(s.starts_with("docs.tokio.rs/"));
        assert!(s.ends_with(".md"));
        assert!(!s.contains('?'));

        let root = Url::parse("https://example.com/").unwrap();
        assert_eq!(cache_rel_path(&root).display().to_string(), "example.com/index.md");
    }

    #[test]
    fn test_cache_rel_path_never_escapes() {
        let url = Url::parse("https://example.com/%2e%2e/%2e%2e/etc/passwd").unwrap();
        let rel = cache_rel_path(&url);
        assert!(rel
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_))));
    }

    #[test]
    fn test_markdown_heuristic_accepts_headed_text() {
        let body = format!("# Title\n\n{}\n\n- a\n- b\n- c\n", "prose ".repeat(40));
        assert!(looks_like_markdown(&body));
    }

    #[test]
    fn test_markdown_heuristic_rejects_html_and_small_bodies() {
        assert!(!looks_like_markdown("<!DOCTYPE html><html><body># nope</body></html>"));
        assert!(!looks_like_markdown("# too small"));
        let plain = "plain prose without any structure at all ".repeat(10);
        assert!(!looks_like_markdown(&plain));
    }

    #[test]
    fn test_parse_sitemap_locs() {
        let xml = r#"<?xml version="1.0"?>
            <urlset>
              <url><loc>https://example.com/a</loc></url>
              <url><loc>https://example.com/b</loc></url>
              <url><loc>https://example.com/a</loc></url>
            </urlset>"#;
        let locs = parse_sitemap_locs(xml);
        assert_eq!(
            locs,
            vec!["https://example.com/a", "https://example.com/b"]
        );
    }

    #[test]
    fn test_library_label_from_host() {
        assert_eq!(library_label("tokio.rs"), "tokio");
        assert_eq!(library_label("serde.dev"), "serde");
    }

    #[test]
    fn test_glob_root_extraction() {
        assert_eq!(glob_root("docs/**/*.md"), PathBuf::from("docs"));
        assert_eq!(glob_root("*.md"), PathBuf::from("."));
    }
}
