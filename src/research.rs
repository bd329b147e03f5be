//! Compound research operation: topic → URLs → fetch → ingest → report.
//!
//! Topic resolution is a pluggable [`DocResolver`]; the default expands the
//! configured URL templates with the topic slug and merges caller-provided
//! seed URLs. No external catalog is hardcoded. Fetches run with bounded
//! concurrency and individual failures never abort the run; the report
//! carries counts and per-URL outcomes, never fetched content.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::error::ToolResult;
use crate::fetch::{FetchFailure, Fetcher};
use crate::models::StoreStatus;
use crate::store::KnowledgeStore;

/// Resolves a topic to candidate documentation URLs.
#[async_trait]
pub trait DocResolver: Send + Sync {
    async fn resolve(&self, topic: &str) -> Result<Vec<String>>;
}

/// Default resolver: expands `[research] root_templates` with the topic.
pub struct TemplateResolver {
    templates: Vec<String>,
}

impl TemplateResolver {
    pub fn from_config(config: &Config) -> Self {
        Self {
            templates: config.research.root_templates.clone(),
        }
    }
}

#[async_trait]
impl DocResolver for TemplateResolver {
    async fn resolve(&self, topic: &str) -> Result<Vec<String>> {
        let slug = topic_slug(topic);
        if slug.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .templates
            .iter()
            .map(|template| template.replace("{topic}", &slug))
            .collect())
    }
}

fn topic_slug(topic: &str) -> String {
    topic
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}

/// Outcome of a `research` run.
#[derive(Debug, Clone, Serialize)]
pub struct ResearchReport {
    pub topic: String,
    pub candidates: usize,
    pub fetched: usize,
    pub from_cache: usize,
    pub indexed_chunks: usize,
    pub failures: Vec<FetchFailure>,
}

/// Drives research runs and the knowledge management operations.
pub struct ResearchOrchestrator {
    config: Arc<Config>,
    fetcher: Arc<Fetcher>,
    resolver: Arc<dyn DocResolver>,
}

impl ResearchOrchestrator {
    pub fn new(config: Arc<Config>, fetcher: Arc<Fetcher>, resolver: Arc<dyn DocResolver>) -> Self {
        Self {
            config,
            fetcher,
            resolver,
        }
    }

    /// Discover URLs for a topic, fetch each, and report counts.
    pub async fn research(
        &self,
        store: Arc<KnowledgeStore>,
        topic: &str,
        seeds: &[String],
    ) -> ToolResult<ResearchReport> {
        let mut candidates: Vec<String> = Vec::new();
        let mut seen = HashSet::new();

        match self.resolver.resolve(topic).await {
            Ok(resolved) => {
                for url in resolved {
                    if seen.insert(url.clone()) {
                        candidates.push(url);
                    }
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, topic, "topic resolver failed, seeds only");
            }
        }
        for url in seeds {
            if seen.insert(url.clone()) {
                candidates.push(url.clone());
            }
        }

        let total = candidates.len();
        let semaphore = Arc::new(Semaphore::new(self.config.research.concurrency.clamp(1, 4)));
        let mut tasks = JoinSet::new();
        for url in candidates {
            let fetcher = self.fetcher.clone();
            let store = store.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire().await;
                let outcome = fetcher.fetch(&store, &url, false).await;
                (url, outcome)
            });
        }

        let mut fetched = 0;
        let mut from_cache = 0;
        let mut indexed_chunks = 0;
        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let Ok((url, outcome)) = joined else { continue };
            match outcome {
                Ok(o) => {
                    if o.from_cache {
                        from_cache += 1;
                    } else {
                        fetched += 1;
                    }
                    indexed_chunks += o.chunks;
                }
                Err(err) => failures.push(FetchFailure {
                    url,
                    error_kind: err.kind,
                    message: err.message,
                }),
            }
        }

        Ok(ResearchReport {
            topic: topic.to_string(),
            candidates: total,
            fetched,
            from_cache,
            indexed_chunks,
            failures,
        })
    }

    /// Size and label breakdown of a project index.
    pub async fn knowledge_status(&self, store: &KnowledgeStore) -> ToolResult<StoreStatus> {
        store.status().await.map_err(Into::into)
    }

    /// Delete a project index.
    pub async fn knowledge_clear(&self, store: &KnowledgeStore) -> ToolResult<()> {
        store.clear().await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_slug() {
        assert_eq!(topic_slug("Tokio Runtime"), "tokio-runtime");
        assert_eq!(topic_slug("  serde!  "), "serde");
        assert_eq!(topic_slug("a b"), "a-b");
    }

    #[tokio::test]
    async fn test_template_resolver_expands_topic() {
        let resolver = TemplateResolver {
            templates: vec![
                "https://docs.rs/{topic}".to_string(),
                "https://{topic}.dev/docs".to_string(),
            ],
        };
        let urls = resolver.resolve("My Lib").await.unwrap();
        assert_eq!(
            urls,
            vec!["https://docs.rs/my-lib", "https://my-lib.dev/docs"]
        );
    }

    #[tokio::test]
    async fn test_template_resolver_empty_topic() {
        let resolver = TemplateResolver {
            templates: vec!["https://docs.rs/{topic}".to_string()],
        };
        assert!(resolver.resolve("  ").await.unwrap().is_empty());
    }
}
