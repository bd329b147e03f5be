//! Kernel process ownership: tier selection, lazy start, health loop.
//!
//! The manager owns the external kernel in one of three isolation tiers:
//!
//! | Tier | Mechanism |
//! |------|-----------|
//! | 1 | Bare subprocess from the configured command line |
//! | 2 | Container with null DNS, bounded memory/CPU, mounted workspace |
//! | 3 | Reserved; treated as unavailable |
//!
//! The requested tier degrades to tier 1 when the container runtime does
//! not answer. Nothing starts at process init: the first operation that
//! needs the kernel triggers startup, and concurrent first callers share a
//! single start attempt behind the state lock. A health loop probes the
//! kernel and restarts it after three consecutive failures; every start and
//! restart fires the injection hook so the sub-agent helper stubs are
//! re-established.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::kernel_client::{ExecOutcome, KernelClient, KernelError};

/// Hook fired after every kernel start or restart with the active tier.
pub type StartHook = Arc<
    dyn Fn(KernelClient, u8) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync,
>;

/// Consecutive failed probes before the health loop restarts the kernel.
const HEALTH_STRIKES: u32 = 3;

/// How long a fresh kernel gets to answer its first health probe.
const STARTUP_WAIT: Duration = Duration::from_secs(30);

/// The isolation mechanism actually running.
enum RunningKernel {
    /// Externally managed; the manager only health-checks it.
    External,
    /// Tier 1 subprocess.
    Child(tokio::process::Child),
    /// Tier 2 container, by name.
    Container(String),
}

struct ActiveKernel {
    client: KernelClient,
    tier: u8,
    running: RunningKernel,
    health_task: Option<tokio::task::JoinHandle<()>>,
}

struct ManagerInner {
    config: Arc<Config>,
    http: reqwest::Client,
    state: Mutex<Option<ActiveKernel>>,
    start_hook: Mutex<Option<StartHook>>,
    /// Serializes executions against each other and against snapshot saves.
    exec_lock: Mutex<()>,
}

/// Lifecycle owner of the one kernel per process.
#[derive(Clone)]
pub struct KernelManager {
    inner: Arc<ManagerInner>,
}

impl KernelManager {
    pub fn new(config: Arc<Config>, http: reqwest::Client) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                http,
                state: Mutex::new(None),
                start_hook: Mutex::new(None),
                exec_lock: Mutex::new(()),
            }),
        }
    }

    /// Register the hook that re-injects helpers on (re)start.
    pub async fn set_start_hook(&self, hook: StartHook) {
        *self.inner.start_hook.lock().await = Some(hook);
    }

    /// Lock guarding executions; the snapshotter holds it across saves.
    pub fn exec_lock(&self) -> &Mutex<()> {
        &self.inner.exec_lock
    }

    /// Whether the kernel has been started by this process.
    pub async fn is_running(&self) -> bool {
        self.inner.state.lock().await.is_some()
    }

    /// The client for the running kernel, starting it lazily.
    pub async fn client(&self) -> Result<KernelClient> {
        let mut state = self.inner.state.lock().await;
        if let Some(active) = state.as_ref() {
            return Ok(active.client.clone());
        }

        let active = self.start_kernel().await?;
        let client = active.client.clone();
        let tier = active.tier;
        *state = Some(active);
        drop(state);

        self.fire_start_hook(client.clone(), tier).await;
        self.spawn_health_loop().await;
        Ok(client)
    }

    /// Execute with the one-retry transport policy: a transport failure is
    /// retried once after a confirming health probe; anything else is the
    /// caller's to handle.
    pub async fn execute(&self, code: &str, timeout_secs: u64) -> Result<ExecOutcome, KernelError> {
        let client = self
            .client()
            .await
            .map_err(|err| KernelError::Transport(err.to_string()))?;

        let _exec = self.inner.exec_lock.lock().await;
        match client.execute(code, timeout_secs).await {
            Err(err) if err.is_retryable() => {
                if client.health().await.is_ok() {
                    client.execute(code, timeout_secs).await
                } else {
                    Err(err)
                }
            }
            other => other,
        }
    }

    /// Stop the kernel and the health loop. Idempotent.
    pub async fn stop(&self) {
        let mut state = self.inner.state.lock().await;
        if let Some(mut active) = state.take() {
            if let Some(task) = active.health_task.take() {
                task.abort();
            }
            stop_running(&mut active.running).await;
        }
    }

    // ============ Startup ============

    async fn start_kernel(&self) -> Result<ActiveKernel> {
        let config = &self.inner.config;

        if let Some(url) = &config.kernel.url {
            let client = self.make_client(url);
            wait_healthy(&client).await.with_context(|| {
                format!("the external kernel at {url} did not become healthy")
            })?;
            tracing::info!(url = %url, "attached to external kernel");
            return Ok(ActiveKernel {
                client,
                tier: 1,
                running: RunningKernel::External,
                health_task: None,
            });
        }

        let tier = self.select_tier().await;
        let port = config.kernel.port;
        let url = format!("http://127.0.0.1:{port}");
        let client = self.make_client(&url);

        let running = match tier {
            2 => RunningKernel::Container(start_container(config, port).await?),
            _ => RunningKernel::Child(start_subprocess(config, port)?),
        };

        let mut running = running;
        if let Err(err) = wait_healthy(&client).await {
            stop_running(&mut running).await;
            return Err(err.context("the kernel did not become healthy after start"));
        }
        tracing::info!(tier, port, "kernel started");

        Ok(ActiveKernel {
            client,
            tier,
            running,
            health_task: None,
        })
    }

    /// Requested tier when available, degrading to tier 1.
    async fn select_tier(&self) -> u8 {
        let requested = self.inner.config.kernel.tier;
        match requested {
            2 if container_runtime_available().await => 2,
            2 => {
                tracing::warn!("container runtime unreachable, degrading to tier 1");
                1
            }
            3 => {
                tracing::warn!("tier 3 isolation is reserved, degrading to tier 1");
                1
            }
            _ => 1,
        }
    }

    fn make_client(&self, url: &str) -> KernelClient {
        KernelClient::new(
            url,
            self.inner.http.clone(),
            Duration::from_secs(self.inner.config.kernel.http_margin_secs),
        )
    }

    async fn fire_start_hook(&self, client: KernelClient, tier: u8) {
        let hook = self.inner.start_hook.lock().await.clone();
        if let Some(hook) = hook {
            if let Err(err) = hook(client, tier).await {
                tracing::warn!(error = %err, "kernel start hook failed");
            }
        }
    }

    // ============ Health loop ============

    async fn spawn_health_loop(&self) {
        let manager = self.clone();
        let interval = Duration::from_secs(self.inner.config.kernel.health_interval_secs.max(1));
        let task = tokio::spawn(async move {
            let mut strikes = 0u32;
            loop {
                tokio::time::sleep(interval).await;
                let client = {
                    let state = manager.inner.state.lock().await;
                    match state.as_ref() {
                        Some(active) => active.client.clone(),
                        None => return,
                    }
                };
                match client.health().await {
                    Ok(()) => strikes = 0,
                    Err(err) => {
                        strikes += 1;
                        tracing::warn!(strikes, error = %err, "kernel health probe failed");
                        if strikes >= HEALTH_STRIKES {
                            strikes = 0;
                            if let Err(err) = manager.restart().await {
                                tracing::error!(error = %err, "kernel restart failed");
                            }
                        }
                    }
                }
            }
        });

        if let Some(active) = self.inner.state.lock().await.as_mut() {
            if let Some(old) = active.health_task.replace(task) {
                old.abort();
            }
        }
    }

    /// Tear the kernel down and bring a fresh one up, re-firing the hook.
    pub async fn restart(&self) -> Result<()> {
        tracing::info!("restarting kernel");
        {
            let mut state = self.inner.state.lock().await;
            if let Some(mut active) = state.take() {
                stop_running(&mut active.running).await;
            }
            let active = self.start_kernel().await?;
            *state = Some(active);
        }
        let client = {
            let state = self.inner.state.lock().await;
            state.as_ref().map(|a| (a.client.clone(), a.tier))
        };
        if let Some((client, tier)) = client {
            self.fire_start_hook(client, tier).await;
        }
        Ok(())
    }
}

// ============ Process helpers ============

async fn container_runtime_available() -> bool {
    let probe = tokio::time::timeout(
        Duration::from_secs(5),
        tokio::process::Command::new("docker")
            .arg("info")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status(),
    )
    .await;
    matches!(probe, Ok(Ok(status)) if status.success())
}

fn start_subprocess(config: &Config, port: u16) -> Result<tokio::process::Child> {
    let command = &config.kernel.command;
    if command.is_empty() {
        bail!("kernel.command is empty");
    }
    let args: Vec<String> = command
        .iter()
        .map(|arg| arg.replace("{port}", &port.to_string()))
        .collect();

    let child = tokio::process::Command::new(&args[0])
        .args(&args[1..])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn kernel command '{}'", args[0]))?;
    Ok(child)
}

async fn start_container(config: &Config, port: u16) -> Result<String> {
    let name = format!("sbx-kernel-{port}");
    let mut cmd = tokio::process::Command::new("docker");
    cmd.args(["run", "-d", "--rm", "--name"])
        .arg(&name)
        .args(["--dns", "0.0.0.0", "--memory"])
        .arg(&config.kernel.memory)
        .arg("--cpus")
        .arg(config.kernel.cpus.to_string())
        .arg("-p")
        .arg(format!("127.0.0.1:{port}:{port}"));
    if let Some(workspace) = &config.kernel.workspace {
        cmd.arg("-v")
            .arg(format!("{}:/workspace", workspace.display()));
    }
    cmd.arg(&config.kernel.image);

    let output = cmd.output().await.context("docker run failed to execute")?;
    if !output.status.success() {
        bail!(
            "docker run failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(name)
}

async fn stop_running(running: &mut RunningKernel) {
    match running {
        RunningKernel::External => {}
        RunningKernel::Child(child) => {
            let _ = child.kill().await;
        }
        RunningKernel::Container(name) => {
            let _ = tokio::process::Command::new("docker")
                .args(["stop", "-t", "5"])
                .arg(&*name)
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status()
                .await;
        }
    }
}

async fn wait_healthy(client: &KernelClient) -> Result<()> {
    let deadline = tokio::time::Instant::now() + STARTUP_WAIT;
    loop {
        match client.health().await {
            Ok(()) => return Ok(()),
            Err(err) => {
                if tokio::time::Instant::now() >= deadline {
                    bail!("kernel never answered /health: {err}");
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }
}
