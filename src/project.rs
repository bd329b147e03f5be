//! Project identity and the process-wide store registry.
//!
//! All persisted state is scoped by a project id derived from a stable
//! identifier: the client's working directory for implicit projects, or an
//! explicit topic slug. One index file and one raw-document directory per
//! project; a project is never addressed by two concurrent writers within
//! the process (the registry hands out a single shared store instance).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::store::KnowledgeStore;

/// Length of the hex project id.
const PROJECT_ID_LEN: usize = 16;

/// Derive a project id from a stable identifier.
///
/// Explicit slugs pass through after normalization so `research` topics map
/// to readable directory names; anything path-like is hashed.
pub fn project_id_for(identifier: &str) -> String {
    let slug: String = identifier
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();

    // Path-like or unwieldy identifiers become a hash; short clean slugs
    // stay readable.
    if identifier.contains('/') || identifier.contains('\\') || slug.len() > 48 || slug.is_empty() {
        let mut hasher = Sha256::new();
        hasher.update(identifier.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        digest[..PROJECT_ID_LEN].to_string()
    } else {
        slug.trim_matches('-').to_string()
    }
}

/// Project id for the current working directory.
pub fn default_project_id() -> String {
    let cwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| ".".to_string());
    project_id_for(&cwd)
}

/// Session id for kernel snapshots, derived the same way.
pub fn session_id_for(working_dir: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(working_dir.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..PROJECT_ID_LEN].to_string()
}

/// Paths owned by one project.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub index_file: PathBuf,
    pub raw_dir: PathBuf,
}

impl ProjectPaths {
    pub fn new(config: &Config, project_id: &str) -> Self {
        let knowledge_dir = &config.paths.knowledge_dir;
        Self {
            index_file: knowledge_dir.join(format!("{project_id}.sqlite")),
            raw_dir: knowledge_dir.join(project_id).join("raw"),
        }
    }
}

/// Process-wide map of open knowledge stores, one per project.
///
/// Init-on-first-access, teardown on host stop. The map itself is guarded
/// by a mutex; each opened store serializes its own writes internally.
pub struct ProjectRegistry {
    config: Arc<Config>,
    http: reqwest::Client,
    stores: Mutex<HashMap<String, Arc<KnowledgeStore>>>,
}

impl ProjectRegistry {
    pub fn new(config: Arc<Config>, http: reqwest::Client) -> Self {
        Self {
            config,
            http,
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Get the store for a project, opening it lazily on first access.
    pub async fn store(&self, project_id: &str) -> Result<Arc<KnowledgeStore>> {
        let mut stores = self.stores.lock().await;
        if let Some(store) = stores.get(project_id) {
            return Ok(store.clone());
        }

        let paths = ProjectPaths::new(&self.config, project_id);
        let store = Arc::new(
            KnowledgeStore::open(self.config.clone(), project_id, paths, self.http.clone())
                .await?,
        );
        stores.insert(project_id.to_string(), store.clone());
        Ok(store)
    }

    /// Drop a project's store from the cache (after `clear`).
    pub async fn evict(&self, project_id: &str) {
        self.stores.lock().await.remove(project_id);
    }

    /// Close every open store. Called from the host stop path.
    pub async fn close_all(&self) {
        let mut stores = self.stores.lock().await;
        for (_, store) in stores.drain() {
            store.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_projects_stay_readable() {
        assert_eq!(project_id_for("Tokio Docs"), "tokio-docs");
        assert_eq!(project_id_for("serde"), "serde");
    }

    #[test]
    fn test_path_identifiers_are_hashed() {
        let id = project_id_for("/home/user/work/repo");
        assert_eq!(id.len(), PROJECT_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_derivation_is_stable() {
        assert_eq!(
            project_id_for("/home/user/work/repo"),
            project_id_for("/home/user/work/repo")
        );
        assert_ne!(
            project_id_for("/home/user/work/repo"),
            project_id_for("/home/user/work/other")
        );
    }

    #[test]
    fn test_session_id_shape() {
        let id = session_id_for("/home/user/work/repo");
        assert_eq!(id.len(), PROJECT_ID_LEN);
    }
}
