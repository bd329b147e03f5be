//! Kernel session snapshots.
//!
//! Two triggers: a periodic timer and the graceful-shutdown path. A save
//! asks the kernel to serialize its namespace, writes the bytes to a temp
//! file, and renames into place, so the session file is never half-written.
//! On lazy kernel start the snapshot for the current session is pushed back
//! before any tool dispatch; a snapshot the kernel rejects is renamed aside
//! and the kernel starts clean. Non-serializable names are the kernel's to
//! skip and come back in the restore report.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::kernel_client::{KernelClient, RestoreOutcome};
use crate::kernel_manager::KernelManager;
use crate::models::SnapshotManifest;

/// Bumped when the snapshot wire format changes.
const SCHEMA_VERSION: u32 = 1;

/// Saves and restores the kernel namespace for one session.
#[derive(Clone)]
pub struct SessionSnapshotter {
    config: Arc<Config>,
    manager: KernelManager,
    session_id: String,
}

impl SessionSnapshotter {
    pub fn new(config: Arc<Config>, manager: KernelManager, session_id: String) -> Self {
        Self {
            config,
            manager,
            session_id,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn snapshot_path(&self) -> PathBuf {
        self.config
            .paths
            .sessions_dir
            .join(format!("{}.snapshot", self.session_id))
    }

    fn manifest_path(&self) -> PathBuf {
        self.config
            .paths
            .sessions_dir
            .join(format!("{}.manifest.json", self.session_id))
    }

    /// Save the kernel namespace if the kernel is running.
    ///
    /// A save never starts a kernel: an idle session has nothing worth
    /// persisting. The exec lock is held so a save cannot interleave with
    /// an in-flight execution.
    pub async fn save(&self) -> Result<bool> {
        if !self.manager.is_running().await {
            return Ok(false);
        }
        let client = self.manager.client().await?;

        let bytes = {
            let _exec = self.manager.exec_lock().lock().await;
            client
                .snapshot_save()
                .await
                .map_err(|err| anyhow::anyhow!("snapshot save failed: {err}"))?
        };

        let path = self.snapshot_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Write-temp-then-rename; a crash leaves either the old snapshot or
        // a stray .tmp, never a torn file.
        let tmp = path.with_extension("snapshot.tmp");
        std::fs::write(&tmp, &bytes)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)?;

        let manifest = SnapshotManifest {
            session_id: self.session_id.clone(),
            saved_at: chrono::Utc::now().timestamp(),
            schema_version: SCHEMA_VERSION,
        };
        std::fs::write(self.manifest_path(), serde_json::to_vec_pretty(&manifest)?)?;

        tracing::debug!(session = %self.session_id, bytes = bytes.len(), "session snapshot saved");
        Ok(true)
    }

    /// Push a stored snapshot into a freshly started kernel.
    ///
    /// Returns `None` when no snapshot exists. A snapshot the kernel cannot
    /// restore is renamed aside with a `.corrupt` suffix and the kernel
    /// proceeds with an empty namespace.
    pub async fn restore(&self, client: &KernelClient) -> Result<Option<RestoreOutcome>> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(None);
        }

        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(error = %err, "snapshot unreadable, starting clean");
                self.quarantine(&path);
                return Ok(None);
            }
        };

        match client.snapshot_restore(bytes).await {
            Ok(outcome) => {
                if !outcome.skipped.is_empty() {
                    tracing::debug!(skipped = ?outcome.skipped, "snapshot names skipped on restore");
                }
                tracing::info!(
                    session = %self.session_id,
                    restored = outcome.restored.len(),
                    "session snapshot restored"
                );
                Ok(Some(outcome))
            }
            Err(err) => {
                tracing::warn!(error = %err, "snapshot rejected by kernel, starting clean");
                self.quarantine(&path);
                Ok(None)
            }
        }
    }

    fn quarantine(&self, path: &std::path::Path) {
        let aside = path.with_extension("snapshot.corrupt");
        if let Err(err) = std::fs::rename(path, &aside) {
            tracing::warn!(error = %err, "failed to move corrupt snapshot aside");
        }
    }

    /// Spawn the periodic save loop. Returns its handle for shutdown.
    pub fn spawn_periodic(&self) -> Option<tokio::task::JoinHandle<()>> {
        let interval_secs = self.config.snapshot.interval_secs;
        if interval_secs == 0 {
            return None;
        }
        let snapshotter = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate first tick is a no-op
            loop {
                ticker.tick().await;
                if let Err(err) = snapshotter.save().await {
                    tracing::warn!(error = %err, "periodic snapshot failed");
                }
            }
        }))
    }
}
