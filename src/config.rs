//! Configuration parsing and validation.
//!
//! The harness is configured via a TOML file (default: `config/sbx.toml`).
//! The config defines storage paths, kernel isolation settings, snapshot
//! cadence, chunking parameters, retrieval tuning, fetcher policy, sub-agent
//! limits, callback bind address, and language-model endpoints.
//!
//! Credentials are never part of the config file: the sub-model API key is
//! read from `SANDBOX_LLM_API_KEY` at call time and never written to any
//! artifact. The blocklist can be extended via `SANDBOX_BLOCKED_DOMAINS`
//! (comma-separated host suffixes).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable holding the sub-model credential.
pub const LLM_API_KEY_ENV: &str = "SANDBOX_LLM_API_KEY";

/// Environment variable extending the fetch blocklist.
pub const BLOCKED_DOMAINS_ENV: &str = "SANDBOX_BLOCKED_DOMAINS";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub kernel: KernelConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub subagent: SubAgentConfig,
    #[serde(default)]
    pub callback: CallbackConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub research: ResearchConfig,
}

/// Root directories for persisted state.
#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Per-project index files and raw caches live under here.
    #[serde(default = "default_knowledge_dir")]
    pub knowledge_dir: PathBuf,
    /// Kernel snapshots, one per session.
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            knowledge_dir: default_knowledge_dir(),
            sessions_dir: default_sessions_dir(),
        }
    }
}

fn default_knowledge_dir() -> PathBuf {
    home_relative("knowledge")
}

fn default_sessions_dir() -> PathBuf {
    home_relative("sessions")
}

fn home_relative(leaf: &str) -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".sandbox-harness")
        .join(leaf)
}

/// Kernel process ownership and isolation tier selection.
#[derive(Debug, Deserialize, Clone)]
pub struct KernelConfig {
    /// Requested isolation tier (1 = sandboxed subprocess, 2 = container,
    /// 3 = reserved). Degrades to 1 when the container runtime is absent.
    #[serde(default = "default_tier")]
    pub tier: u8,
    /// Command line that starts the tier-1 kernel process. The placeholder
    /// `{port}` is substituted with the chosen loopback port.
    #[serde(default = "default_kernel_command")]
    pub command: Vec<String>,
    /// Container image for tier 2.
    #[serde(default = "default_kernel_image")]
    pub image: String,
    /// Memory bound passed to the container runtime (tier 2).
    #[serde(default = "default_kernel_memory")]
    pub memory: String,
    /// CPU bound passed to the container runtime (tier 2).
    #[serde(default = "default_kernel_cpus")]
    pub cpus: f64,
    /// Base URL of an externally managed kernel. When set, the manager
    /// never starts a process and only health-checks this endpoint.
    #[serde(default)]
    pub url: Option<String>,
    /// Port the managed kernel listens on.
    #[serde(default = "default_kernel_port")]
    pub port: u16,
    /// Default per-execute timeout handed to the kernel, seconds.
    #[serde(default = "default_exec_timeout")]
    pub exec_timeout_secs: u64,
    /// Extra margin the HTTP timeout keeps over the kernel's own timeout,
    /// so an overdue execution is reported as a structured timeout.
    #[serde(default = "default_http_margin")]
    pub http_margin_secs: u64,
    /// Seconds between health probes.
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
    /// Workspace directory mounted into a tier-2 kernel.
    #[serde(default)]
    pub workspace: Option<PathBuf>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            tier: default_tier(),
            command: default_kernel_command(),
            image: default_kernel_image(),
            memory: default_kernel_memory(),
            cpus: default_kernel_cpus(),
            url: None,
            port: default_kernel_port(),
            exec_timeout_secs: default_exec_timeout(),
            http_margin_secs: default_http_margin(),
            health_interval_secs: default_health_interval(),
            workspace: None,
        }
    }
}

fn default_tier() -> u8 {
    2
}
fn default_kernel_command() -> Vec<String> {
    vec![
        "sandbox-kernel".to_string(),
        "--port".to_string(),
        "{port}".to_string(),
    ]
}
fn default_kernel_image() -> String {
    "sandbox-kernel:latest".to_string()
}
fn default_kernel_memory() -> String {
    "2g".to_string()
}
fn default_kernel_cpus() -> f64 {
    2.0
}
fn default_kernel_port() -> u16 {
    8787
}
fn default_exec_timeout() -> u64 {
    120
}
fn default_http_margin() -> u64 {
    10
}
fn default_health_interval() -> u64 {
    15
}

/// Snapshot cadence.
#[derive(Debug, Deserialize, Clone)]
pub struct SnapshotConfig {
    /// Seconds between periodic saves. 0 disables the timer.
    #[serde(default = "default_snapshot_interval")]
    pub interval_secs: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_snapshot_interval(),
        }
    }
}

fn default_snapshot_interval() -> u64 {
    300
}

/// Chunking parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Target chunk size in bytes; documents above this are split on
    /// markdown section boundaries.
    #[serde(default = "default_target_bytes")]
    pub target_bytes: usize,
    /// Sections smaller than this are merged into their neighbor.
    #[serde(default = "default_min_bytes")]
    pub min_bytes: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_bytes: default_target_bytes(),
            min_bytes: default_min_bytes(),
        }
    }
}

fn default_target_bytes() -> usize {
    3072
}
fn default_min_bytes() -> usize {
    512
}

/// Retrieval tuning.
#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Candidates pulled from each index before fusion.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: i64,
    /// Reciprocal-rank-fusion constant.
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    /// Default number of hits returned.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Per-label score multipliers applied after fusion.
    #[serde(default)]
    pub label_priors: std::collections::HashMap<String, f64>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            candidate_k: default_candidate_k(),
            rrf_k: default_rrf_k(),
            top_k: default_top_k(),
            label_priors: Default::default(),
        }
    }
}

fn default_candidate_k() -> i64 {
    80
}
fn default_rrf_k() -> f64 {
    60.0
}
fn default_top_k() -> usize {
    8
}

/// Embedding provider settings.
#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"hash"` (deterministic local), `"openai"`, or `"disabled"`.
    #[serde(default = "default_embed_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_embed_dims")]
    pub dims: usize,
    #[serde(default = "default_embed_timeout")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embed_provider(),
            model: None,
            dims: default_embed_dims(),
            timeout_secs: default_embed_timeout(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embed_provider() -> String {
    "hash".to_string()
}
fn default_embed_dims() -> usize {
    256
}
fn default_embed_timeout() -> u64 {
    30
}

/// Knowledge-store behavior knobs.
#[derive(Debug, Deserialize, Clone)]
pub struct KnowledgeConfig {
    /// When true, `ask` returns raw chunks with citations; when false it
    /// synthesizes an answer through the sub-model.
    #[serde(default = "default_true")]
    pub ask_context_only: bool,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            ask_context_only: true,
        }
    }
}

/// Fetcher policy.
#[derive(Debug, Deserialize, Clone)]
pub struct FetcherConfig {
    /// Raw cache entries younger than this are served without network I/O.
    #[serde(default = "default_freshness_days")]
    pub freshness_days: i64,
    /// Base URL of the HTML→markdown proxy; the target URL is appended.
    #[serde(default = "default_proxy_base")]
    pub proxy_base: String,
    /// Host suffixes refused outright.
    #[serde(default = "default_blocked_domains")]
    pub blocked_domains: Vec<String>,
    /// Per-request timeout, seconds.
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,
    /// Concurrent fetches during sitemap expansion.
    #[serde(default = "default_sitemap_concurrency")]
    pub sitemap_concurrency: usize,
    /// Hard cap on URLs taken from one sitemap.
    #[serde(default = "default_sitemap_limit")]
    pub sitemap_limit: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            freshness_days: default_freshness_days(),
            proxy_base: default_proxy_base(),
            blocked_domains: default_blocked_domains(),
            timeout_secs: default_fetch_timeout(),
            sitemap_concurrency: default_sitemap_concurrency(),
            sitemap_limit: default_sitemap_limit(),
        }
    }
}

impl FetcherConfig {
    /// Configured blocklist plus the `SANDBOX_BLOCKED_DOMAINS` extension.
    pub fn effective_blocklist(&self) -> Vec<String> {
        let mut list = self.blocked_domains.clone();
        if let Ok(extra) = std::env::var(BLOCKED_DOMAINS_ENV) {
            for entry in extra.split(',') {
                let entry = entry.trim().to_ascii_lowercase();
                if !entry.is_empty() && !list.contains(&entry) {
                    list.push(entry);
                }
            }
        }
        list
    }
}

fn default_freshness_days() -> i64 {
    7
}
fn default_proxy_base() -> String {
    "https://markdown.new/".to_string()
}
fn default_blocked_domains() -> Vec<String> {
    vec![
        "geeksforgeeks.org".to_string(),
        "w3schools.com".to_string(),
        "tutorialspoint.com".to_string(),
    ]
}
fn default_fetch_timeout() -> u64 {
    30
}
fn default_sitemap_concurrency() -> usize {
    4
}
fn default_sitemap_limit() -> usize {
    50
}

/// Sub-agent loop limits.
#[derive(Debug, Deserialize, Clone)]
pub struct SubAgentConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_max_llm_calls")]
    pub max_llm_calls: u64,
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

impl Default for SubAgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_llm_calls: default_max_llm_calls(),
            max_output_chars: default_max_output_chars(),
        }
    }
}

fn default_max_iterations() -> usize {
    20
}
fn default_max_llm_calls() -> u64 {
    50
}
fn default_max_output_chars() -> usize {
    10_000
}

/// Callback server bind settings.
#[derive(Debug, Deserialize, Clone)]
pub struct CallbackConfig {
    /// Loopback bind address. Port 0 picks a free port.
    #[serde(default = "default_callback_bind")]
    pub bind: String,
    /// Hostname a tier-2 (containerized) kernel uses to reach the host.
    #[serde(default = "default_container_host")]
    pub container_host: String,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            bind: default_callback_bind(),
            container_host: default_container_host(),
        }
    }
}

fn default_callback_bind() -> String {
    "127.0.0.1:0".to_string()
}
fn default_container_host() -> String {
    "host.docker.internal".to_string()
}

/// Client-facing tool server bind settings.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_server_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_server_bind(),
        }
    }
}

fn default_server_bind() -> String {
    "127.0.0.1:7341".to_string()
}

/// Language-model endpoints for the main model and the sub-model.
#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// OpenAI-compatible chat completions base URL.
    #[serde(default = "default_llm_base")]
    pub base_url: String,
    /// Model driving sub-agent loops.
    #[serde(default = "default_main_model")]
    pub main_model: String,
    /// Model answering `llm_query` callbacks.
    #[serde(default = "default_sub_model")]
    pub sub_model: String,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base(),
            main_model: default_main_model(),
            sub_model: default_sub_model(),
            timeout_secs: default_llm_timeout(),
            max_tokens: default_llm_max_tokens(),
        }
    }
}

fn default_llm_base() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_main_model() -> String {
    "gpt-4o".to_string()
}
fn default_sub_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_timeout() -> u64 {
    120
}
fn default_llm_max_tokens() -> u32 {
    4096
}

/// Research resolver settings.
#[derive(Debug, Deserialize, Clone)]
pub struct ResearchConfig {
    /// URL templates expanded with `{topic}` to propose documentation roots.
    #[serde(default)]
    pub root_templates: Vec<String>,
    /// Concurrent fetches during a research run.
    #[serde(default = "default_research_concurrency")]
    pub concurrency: usize,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            root_templates: Vec::new(),
            concurrency: default_research_concurrency(),
        }
    }
}

fn default_research_concurrency() -> usize {
    4
}

fn default_true() -> bool {
    true
}

/// Load and validate a config file. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str::<Config>(&content).with_context(|| "Failed to parse config file")?
    } else {
        Config::default()
    };

    if config.chunking.target_bytes == 0 {
        anyhow::bail!("chunking.target_bytes must be > 0");
    }
    if config.chunking.min_bytes > config.chunking.target_bytes {
        anyhow::bail!("chunking.min_bytes must not exceed chunking.target_bytes");
    }

    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.rrf_k <= 0.0 {
        anyhow::bail!("retrieval.rrf_k must be > 0");
    }

    match config.embedding.provider.as_str() {
        "hash" | "openai" | "disabled" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hash, openai, or disabled.",
            other
        ),
    }
    if config.embedding.is_enabled() && config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0 when embeddings are enabled");
    }

    match config.kernel.tier {
        1 | 2 | 3 => {}
        other => anyhow::bail!("kernel.tier must be 1, 2, or 3 (got {})", other),
    }

    if config.fetcher.freshness_days < 0 {
        anyhow::bail!("fetcher.freshness_days must be >= 0");
    }

    if config.subagent.max_iterations == 0 || config.subagent.max_llm_calls == 0 {
        anyhow::bail!("subagent limits must be >= 1");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert_eq!(config.fetcher.freshness_days, 7);
        assert_eq!(config.subagent.max_iterations, 20);
        assert_eq!(config.subagent.max_llm_calls, 50);
        assert_eq!(config.subagent.max_output_chars, 10_000);
        assert!(config.knowledge.ask_context_only);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = load_config(Path::new("/nonexistent/sbx.toml")).unwrap();
        assert_eq!(config.kernel.tier, 2);
    }

    #[test]
    fn test_rejects_bad_tier() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sbx.toml");
        std::fs::write(&path, "[kernel]\ntier = 9\n").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_rejects_unknown_embedding_provider() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sbx.toml");
        std::fs::write(&path, "[embedding]\nprovider = \"onnx\"\n").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_parses_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sbx.toml");
        std::fs::write(
            &path,
            "[fetcher]\nfreshness_days = 3\n\n[retrieval]\ntop_k = 5\n",
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.fetcher.freshness_days, 3);
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.subagent.max_iterations, 20);
    }
}
