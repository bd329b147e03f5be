//! Lifecycle composition of the host process.
//!
//! Start order: configuration → shared HTTP client → project registry →
//! callback server → tool registry → snapshot timer. No kernel is started
//! here; the first kernel-using tool call triggers the lazy start, which
//! injects the sub-agent helpers and restores the session snapshot before
//! any dispatch touches the namespace.
//!
//! Every acquire has a matching release on [`Host::stop`]: the callback
//! server drains, a final snapshot is taken, the kernel stops, and all open
//! project stores close.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::callback::{CallbackServer, CallbackState};
use crate::config::Config;
use crate::fetch::Fetcher;
use crate::kernel_manager::{KernelManager, StartHook};
use crate::llm::{ChatClient, LlmProvider};
use crate::project::{default_project_id, session_id_for, ProjectRegistry};
use crate::research::{ResearchOrchestrator, TemplateResolver};
use crate::server::{router, ServerState};
use crate::snapshot::SessionSnapshotter;
use crate::subagent::{helper_injection_source, SubAgentRunner};
use crate::tools::{SandboxBridge, ToolContext, ToolRegistry};

/// The assembled host process.
pub struct Host {
    config: Arc<Config>,
    projects: Arc<ProjectRegistry>,
    manager: KernelManager,
    snapshotter: SessionSnapshotter,
    callback: CallbackServer,
    state: ServerState,
    snapshot_task: Option<tokio::task::JoinHandle<()>>,
}

impl Host {
    /// Compose all components. Nothing heavy starts here except the
    /// callback listener; stores and the kernel come up lazily.
    pub async fn build(config: Config) -> Result<Host> {
        Self::build_with_models(config, None, None).await
    }

    /// Composition seam used by tests to substitute scripted models.
    pub async fn build_with_models(
        config: Config,
        main_model: Option<Arc<dyn LlmProvider>>,
        sub_model: Option<Arc<dyn LlmProvider>>,
    ) -> Result<Host> {
        let config = Arc::new(config);

        // One connection pool for every outbound HTTP call in the process.
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(8)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to build the shared HTTP client")?;

        let projects = Arc::new(ProjectRegistry::new(config.clone(), http.clone()));
        let fetcher = Arc::new(Fetcher::new(config.clone(), http.clone()));
        let manager = KernelManager::new(config.clone(), http.clone());

        let main_model: Arc<dyn LlmProvider> = main_model
            .unwrap_or_else(|| Arc::new(ChatClient::main_model(&config.llm, http.clone())));
        let sub_model: Arc<dyn LlmProvider> = sub_model
            .unwrap_or_else(|| Arc::new(ChatClient::sub_model(&config.llm, http.clone())));

        let working_dir = std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| ".".to_string());
        let default_project = default_project_id();
        let session_id = session_id_for(&working_dir);

        // The callback server sees only the read-only sandbox bridge.
        let bridge = Arc::new(SandboxBridge {
            config: config.clone(),
            projects: projects.clone(),
            fetcher: fetcher.clone(),
            default_project: default_project.clone(),
        });
        let callback_state = Arc::new(CallbackState::new(sub_model.clone(), bridge));
        let callback = CallbackServer::start(&config.callback.bind, callback_state.clone())
            .await
            .context("failed to start the callback server")?;

        let runner = Arc::new(SubAgentRunner::new(
            config.clone(),
            manager.clone(),
            main_model,
            callback_state.clone(),
        ));
        let research = Arc::new(ResearchOrchestrator::new(
            config.clone(),
            fetcher.clone(),
            Arc::new(TemplateResolver::from_config(&config)),
        ));

        let snapshotter = SessionSnapshotter::new(config.clone(), manager.clone(), session_id);

        // On every kernel (re)start: helper stubs first, then the session
        // snapshot, so restored code can already call the helpers.
        manager
            .set_start_hook(make_start_hook(
                config.clone(),
                snapshotter.clone(),
                callback.advertised_url(false, &config.callback.container_host),
                callback.advertised_url(true, &config.callback.container_host),
            ))
            .await;

        let context = Arc::new(ToolContext {
            config: config.clone(),
            projects: projects.clone(),
            fetcher,
            manager: manager.clone(),
            runner,
            research,
            callback: callback_state,
            sub_model,
            default_project,
        });

        let state = ServerState {
            registry: Arc::new(ToolRegistry::with_builtins()),
            context,
        };

        let snapshot_task = snapshotter.spawn_periodic();

        Ok(Host {
            config,
            projects,
            manager,
            snapshotter,
            callback,
            state,
            snapshot_task,
        })
    }

    /// Server state for embedding the router elsewhere (tests).
    pub fn server_state(&self) -> ServerState {
        self.state.clone()
    }

    /// Serve the tool API until the process is told to stop.
    pub async fn serve(self) -> Result<()> {
        let bind = self.config.server.bind.clone();
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .with_context(|| format!("tool server failed to bind {bind}"))?;
        tracing::info!(addr = %listener.local_addr()?, "tool server ready");
        println!("sandbox-harness listening on http://{bind}");

        let app = router(self.state.clone());
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown signal received");
            })
            .await?;

        self.stop().await;
        Ok(())
    }

    /// Release everything acquired in [`Host::build`]: drain the callback
    /// server, take a final snapshot, stop the kernel, close the stores.
    pub async fn stop(mut self) {
        if let Some(task) = self.snapshot_task.take() {
            task.abort();
        }

        self.callback.drain_and_stop().await;

        if let Err(err) = self.snapshotter.save().await {
            tracing::warn!(error = %err, "final snapshot failed");
        }

        self.manager.stop().await;
        self.projects.close_all().await;
        tracing::info!("host stopped");
    }
}

fn make_start_hook(
    config: Arc<Config>,
    snapshotter: SessionSnapshotter,
    loopback_url: String,
    container_url: String,
) -> StartHook {
    Arc::new(move |client, tier| {
        let config = config.clone();
        let snapshotter = snapshotter.clone();
        let url = if tier == 2 {
            container_url.clone()
        } else {
            loopback_url.clone()
        };
        Box::pin(async move {
            let source = helper_injection_source(&url);
            client
                .execute(&source, config.kernel.exec_timeout_secs)
                .await
                .map_err(|err| anyhow::anyhow!("helper injection failed: {err}"))?;
            snapshotter.restore(&client).await?;
            Ok(())
        })
    })
}
