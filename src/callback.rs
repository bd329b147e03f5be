//! Loopback callback server the kernel calls back into.
//!
//! Code running inside the kernel reaches host capabilities through two
//! endpoints, so sandbox-originated traffic never re-enters the client's
//! context:
//!
//! - `POST /llm_query` `{prompt}` → `{response, usage}` — forwards to the
//!   sub-language-model and feeds the usage ledger.
//! - `POST /tool_call` `{tool, input}` → `{result}` — dispatches through the
//!   sandbox-callable whitelist; anything that mutates state is refused.
//!
//! The kernel→host and host→kernel directions are two independent HTTP
//! channels; there is no shared memory between the processes. The server
//! lives for the lifetime of the host process and drains in-flight calls
//! before stopping.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::{ToolError, ToolResult};
use crate::llm::LlmProvider;
use crate::models::UsageSnapshot;

/// Tools callable from inside the kernel. Everything else is refused:
/// `execute`, `reset`, `sub_agent`, and `ingest` would mutate host or
/// kernel state from the sandbox.
pub const SANDBOX_TOOLS: &[&str] = &[
    "search_knowledge",
    "ask_knowledge",
    "fetch_url",
    "load_file",
    "apple_search",
];

/// Host-side executor for sandbox-callable tools.
///
/// Implemented by the tool surface; the callback server only enforces the
/// whitelist and the drain state.
#[async_trait::async_trait]
pub trait SandboxDispatcher: Send + Sync {
    async fn dispatch(&self, tool: &str, input: serde_json::Value) -> ToolResult<serde_json::Value>;
}

// Lifecycle phases.
const PHASE_READY: u8 = 0;
const PHASE_DRAINING: u8 = 1;
const PHASE_STOPPED: u8 = 2;

/// Shared state behind the callback endpoints.
pub struct CallbackState {
    sub_model: Arc<dyn LlmProvider>,
    dispatcher: Arc<dyn SandboxDispatcher>,
    ledger: std::sync::Mutex<UsageSnapshot>,
    phase: AtomicU8,
    in_flight: AtomicUsize,
}

impl CallbackState {
    pub fn new(sub_model: Arc<dyn LlmProvider>, dispatcher: Arc<dyn SandboxDispatcher>) -> Self {
        Self {
            sub_model,
            dispatcher,
            ledger: std::sync::Mutex::new(UsageSnapshot::default()),
            phase: AtomicU8::new(PHASE_READY),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Current cumulative usage counters.
    pub fn usage(&self) -> UsageSnapshot {
        self.ledger.lock().expect("usage ledger lock").clone()
    }

    /// Zero the ledger; the only sanctioned way counters decrease.
    pub fn reset_usage(&self) -> UsageSnapshot {
        let mut ledger = self.ledger.lock().expect("usage ledger lock");
        let before = ledger.clone();
        *ledger = UsageSnapshot::default();
        before
    }

    fn record_usage(&self, model: &str, input_tokens: u64, output_tokens: u64) {
        let mut ledger = self.ledger.lock().expect("usage ledger lock");
        ledger.calls += 1;
        ledger.input_tokens += input_tokens;
        ledger.output_tokens += output_tokens;
        *ledger.calls_by_model.entry(model.to_string()).or_insert(0) += 1;
    }

    fn accept_call(&self) -> Result<CallGuard<'_>, ToolError> {
        if self.phase.load(Ordering::SeqCst) != PHASE_READY {
            return Err(ToolError::unavailable(
                "The callback server is shutting down.",
            ));
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(CallGuard { state: self })
    }
}

/// RAII in-flight counter used by the drain path.
struct CallGuard<'a> {
    state: &'a CallbackState,
}

impl std::fmt::Debug for CallGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallGuard").finish_non_exhaustive()
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A running callback server.
pub struct CallbackServer {
    state: Arc<CallbackState>,
    addr: SocketAddr,
    task: tokio::task::JoinHandle<()>,
}

impl CallbackServer {
    /// Bind the loopback listener and start serving.
    pub async fn start(bind: &str, state: Arc<CallbackState>) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(bind)
            .await
            .with_context(|| format!("callback server failed to bind {bind}"))?;
        let addr = listener.local_addr()?;

        let app = Router::new()
            .route("/llm_query", post(handle_llm_query))
            .route("/tool_call", post(handle_tool_call))
            .with_state(state.clone());

        let task = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                tracing::error!(error = %err, "callback server exited");
            }
        });

        tracing::info!(%addr, "callback server ready");
        Ok(Self { state, addr, task })
    }

    pub fn state(&self) -> Arc<CallbackState> {
        self.state.clone()
    }

    /// URL the kernel uses to reach this server.
    ///
    /// Tier 1 kernels share the loopback; tier 2 kernels cross the
    /// container boundary through the configured host name.
    pub fn advertised_url(&self, containerized: bool, container_host: &str) -> String {
        if containerized {
            format!("http://{}:{}", container_host, self.addr.port())
        } else {
            format!("http://127.0.0.1:{}", self.addr.port())
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Refuse new calls, await in-flight ones, then stop serving.
    pub async fn drain_and_stop(self) {
        self.state.phase.store(PHASE_DRAINING, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
        while self.state.in_flight.load(Ordering::SeqCst) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        self.state.phase.store(PHASE_STOPPED, Ordering::SeqCst);
        self.task.abort();
    }
}

// ============ Handlers ============

#[derive(Deserialize)]
struct LlmQueryRequest {
    prompt: String,
}

#[derive(Serialize)]
struct LlmQueryResponse {
    response: String,
    usage: LlmQueryUsage,
}

#[derive(Serialize)]
struct LlmQueryUsage {
    input_tokens: u64,
    output_tokens: u64,
}

async fn handle_llm_query(
    State(state): State<Arc<CallbackState>>,
    Json(req): Json<LlmQueryRequest>,
) -> Response {
    let guard = match state.accept_call() {
        Ok(guard) => guard,
        Err(err) => return error_response(&err),
    };

    if req.prompt.trim().is_empty() {
        return error_response(&ToolError::validation("prompt must not be empty"));
    }

    let result = state.sub_model.complete(&req.prompt).await;
    drop(guard);

    match result {
        Ok(completion) => {
            state.record_usage(
                &completion.model,
                completion.input_tokens,
                completion.output_tokens,
            );
            Json(LlmQueryResponse {
                response: completion.text,
                usage: LlmQueryUsage {
                    input_tokens: completion.input_tokens,
                    output_tokens: completion.output_tokens,
                },
            })
            .into_response()
        }
        Err(err) => error_response(&ToolError::from(err)),
    }
}

#[derive(Deserialize)]
struct ToolCallRequest {
    tool: String,
    #[serde(default)]
    input: serde_json::Value,
}

#[derive(Serialize)]
struct ToolCallResponse {
    result: serde_json::Value,
}

async fn handle_tool_call(
    State(state): State<Arc<CallbackState>>,
    Json(req): Json<ToolCallRequest>,
) -> Response {
    let guard = match state.accept_call() {
        Ok(guard) => guard,
        Err(err) => return error_response(&err),
    };

    if !SANDBOX_TOOLS.contains(&req.tool.as_str()) {
        return error_response(&ToolError::validation(format!(
            "Tool '{}' is not callable from the sandbox.",
            req.tool
        )));
    }

    let result = state.dispatcher.dispatch(&req.tool, req.input).await;
    drop(guard);

    match result {
        Ok(result) => Json(ToolCallResponse { result }).into_response(),
        Err(err) => error_response(&err),
    }
}

fn error_response(err: &ToolError) -> Response {
    let body = serde_json::json!({
        "error": { "kind": err.kind.as_str(), "message": err.message }
    });
    (err.kind.status_code(), Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::llm::ScriptedProvider;

    struct EchoDispatcher;

    #[async_trait::async_trait]
    impl SandboxDispatcher for EchoDispatcher {
        async fn dispatch(
            &self,
            tool: &str,
            input: serde_json::Value,
        ) -> ToolResult<serde_json::Value> {
            Ok(serde_json::json!({ "tool": tool, "echo": input }))
        }
    }

    fn test_state(replies: Vec<String>) -> Arc<CallbackState> {
        Arc::new(CallbackState::new(
            Arc::new(ScriptedProvider::new("sub", replies)),
            Arc::new(EchoDispatcher),
        ))
    }

    #[tokio::test]
    async fn test_ledger_accumulates_and_resets() {
        let state = test_state(vec![]);
        state.record_usage("sub", 10, 5);
        state.record_usage("sub", 10, 5);
        state.record_usage("other", 1, 1);

        let usage = state.usage();
        assert_eq!(usage.calls, 3);
        assert_eq!(usage.input_tokens, 21);
        assert_eq!(usage.output_tokens, 11);
        assert_eq!(usage.calls_by_model.get("sub"), Some(&2));

        let before = state.reset_usage();
        assert_eq!(before.calls, 3);
        assert_eq!(state.usage().calls, 0);
    }

    #[tokio::test]
    async fn test_draining_refuses_new_calls() {
        let state = test_state(vec![]);
        state.phase.store(PHASE_DRAINING, Ordering::SeqCst);
        let err = state.accept_call().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn test_server_roundtrip() {
        let state = test_state(vec!["positive".into()]);
        let server = CallbackServer::start("127.0.0.1:0", state.clone())
            .await
            .unwrap();
        let base = format!("http://{}", server.local_addr());
        let http = reqwest::Client::new();

        // llm_query feeds the ledger.
        let resp: serde_json::Value = http
            .post(format!("{base}/llm_query"))
            .json(&serde_json::json!({ "prompt": "classify sentiment" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(resp["response"], "positive");
        assert_eq!(state.usage().calls, 1);

        // Whitelisted tool dispatches.
        let resp = http
            .post(format!("{base}/tool_call"))
            .json(&serde_json::json!({ "tool": "search_knowledge", "input": {"query": "x"} }))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());

        // Mutating tool is refused with a 4xx.
        let resp = http
            .post(format!("{base}/tool_call"))
            .json(&serde_json::json!({ "tool": "execute", "input": {} }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);

        server.drain_and_stop().await;
    }

    #[test]
    fn test_whitelist_contents() {
        for tool in ["search_knowledge", "ask_knowledge", "fetch_url", "load_file"] {
            assert!(SANDBOX_TOOLS.contains(&tool));
        }
        for tool in ["execute", "reset", "sub_agent", "ingest"] {
            assert!(!SANDBOX_TOOLS.contains(&tool));
        }
    }
}
