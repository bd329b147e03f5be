//! Shared fixtures: temp-dir configs and in-process stub servers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use sandbox_harness::config::Config;

/// A config whose persisted state lives under `root`.
pub fn test_config(root: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.paths.knowledge_dir = root.join("knowledge");
    cfg.paths.sessions_dir = root.join("sessions");
    cfg.server.bind = "127.0.0.1:0".to_string();
    cfg.callback.bind = "127.0.0.1:0".to_string();
    cfg.kernel.exec_timeout_secs = 10;
    cfg
}

/// Serve a router on an ephemeral port; returns its base URL.
pub async fn spawn_server(app: Router) -> (String, SocketAddr) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), addr)
}

// ═══════════════════════════════════════════════════════════════════════
// Documentation origin stub (for the fetch cascade)
// ═══════════════════════════════════════════════════════════════════════

/// How the origin stub answers one path.
#[derive(Clone)]
pub enum OriginBehavior {
    /// Honors `Accept: text/markdown` with a markdown body.
    NegotiatesMarkdown(String),
    /// Always answers HTML regardless of negotiation.
    HtmlOnly(String),
    /// Plain markdown without negotiation headers.
    PlainMarkdown(String),
    /// Sitemap XML.
    Sitemap(String),
    /// HTTP 500.
    Failing,
}

pub struct OriginState {
    pub routes: Mutex<HashMap<String, OriginBehavior>>,
    pub requests: AtomicUsize,
}

/// An origin documentation server with scriptable per-path behavior and a
/// request counter for asserting "zero outbound requests" properties.
pub async fn spawn_origin(routes: HashMap<String, OriginBehavior>) -> (String, Arc<OriginState>) {
    let state = Arc::new(OriginState {
        routes: Mutex::new(routes),
        requests: AtomicUsize::new(0),
    });

    let app = Router::new()
        .route("/{*path}", get(origin_handler))
        .with_state(state.clone());
    let (url, _) = spawn_server(app).await;
    (url, state)
}

async fn origin_handler(
    State(state): State<Arc<OriginState>>,
    axum::extract::Path(path): axum::extract::Path<String>,
    headers: HeaderMap,
) -> axum::response::Response {
    state.requests.fetch_add(1, Ordering::SeqCst);
    let behavior = state.routes.lock().unwrap().get(&path).cloned();

    let markdown_accepted = headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/markdown"))
        .unwrap_or(false);

    match behavior {
        Some(OriginBehavior::NegotiatesMarkdown(body)) if markdown_accepted => (
            [
                ("content-type", "text/markdown; charset=utf-8"),
                ("x-markdown-tokens", "321"),
            ],
            body,
        )
            .into_response(),
        Some(OriginBehavior::NegotiatesMarkdown(_)) | Some(OriginBehavior::HtmlOnly(_)) => {
            let html = match state.routes.lock().unwrap().get(&path).cloned() {
                Some(OriginBehavior::HtmlOnly(html)) => html,
                _ => "<html><body><h1>Fallback page</h1><p>content</p></body></html>".to_string(),
            };
            ([("content-type", "text/html; charset=utf-8")], html).into_response()
        }
        Some(OriginBehavior::PlainMarkdown(body)) => {
            ([("content-type", "text/plain")], body).into_response()
        }
        Some(OriginBehavior::Sitemap(xml)) => {
            ([("content-type", "application/xml")], xml).into_response()
        }
        Some(OriginBehavior::Failing) => {
            (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response()
        }
        None => (axum::http::StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

/// A markdown body large and structured enough for the heuristic.
pub fn sample_markdown(topic: &str) -> String {
    format!(
        "# {topic} guide\n\nAn overview of {topic} fundamentals for daily work.\n\n\
         ## Basics\n\n- install the toolchain\n- configure the project\n- run the pipeline\n\n\
         ```sh\nsbx fetch https://example.org/{topic}\n```\n\n\
         ## Internals\n\nThe {topic} engine keeps state between calls and commits incrementally.\n"
    )
}

// ═══════════════════════════════════════════════════════════════════════
// Kernel stub
// ═══════════════════════════════════════════════════════════════════════

/// In-memory stand-in for the code kernel, faithful to the HTTP contract.
///
/// It does not interpret a language; instead it recognizes the few code
/// shapes the tests send: helper injection (captures the callback URL),
/// `llm_query(...)` / `search_knowledge(...)` calls (performed as real
/// HTTP calls back to the host, exercising the callback channel), simple
/// assignments, and a `BOOM` marker that raises.
pub struct KernelStub {
    pub vars: Mutex<HashMap<String, serde_json::Value>>,
    pub callback_url: Mutex<Option<String>>,
    pub exec_count: AtomicUsize,
    pub reject_restore: std::sync::atomic::AtomicBool,
    http: reqwest::Client,
}

impl KernelStub {
    fn new() -> Self {
        Self {
            vars: Mutex::new(HashMap::new()),
            callback_url: Mutex::new(None),
            exec_count: AtomicUsize::new(0),
            reject_restore: std::sync::atomic::AtomicBool::new(false),
            http: reqwest::Client::new(),
        }
    }
}

pub async fn spawn_kernel_stub() -> (String, Arc<KernelStub>) {
    let stub = Arc::new(KernelStub::new());

    let app = Router::new()
        .route("/exec", post(kernel_exec))
        .route("/vars", get(kernel_vars))
        .route("/var/{name}", get(kernel_var))
        .route("/reset", post(kernel_reset))
        .route("/snapshot/save", post(kernel_snapshot_save))
        .route("/snapshot/restore", post(kernel_snapshot_restore))
        .route("/health", get(kernel_health))
        .with_state(stub.clone());
    let (url, _) = spawn_server(app).await;
    (url, stub)
}

async fn kernel_exec(
    State(stub): State<Arc<KernelStub>>,
    Json(body): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    stub.exec_count.fetch_add(1, Ordering::SeqCst);
    let code = body["code"].as_str().unwrap_or_default().to_string();

    // Helper injection: remember where the callback server lives.
    if let Some(start) = code.find("_SBX_CALLBACK = \"") {
        let rest = &code[start + "_SBX_CALLBACK = \"".len()..];
        if let Some(end) = rest.find('"') {
            *stub.callback_url.lock().unwrap() = Some(rest[..end].to_string());
        }
        return Json(serde_json::json!({ "output": "", "stderr": "", "vars": [] }));
    }

    if code.contains("BOOM") {
        return Json(serde_json::json!({
            "output": "", "stderr": "", "vars": [],
            "error": "Traceback (most recent call last): BOOM"
        }));
    }

    // llm_query("...") is performed as a real callback HTTP round trip.
    if let Some(prompt) = extract_call_arg(&code, "llm_query(") {
        let callback = stub.callback_url.lock().unwrap().clone();
        let Some(callback) = callback else {
            return Json(serde_json::json!({
                "output": "", "stderr": "", "vars": [],
                "error": "NameError: name 'llm_query' is not defined"
            }));
        };
        let response = stub
            .http
            .post(format!("{callback}/llm_query"))
            .json(&serde_json::json!({ "prompt": prompt }))
            .send()
            .await;
        return match response {
            Ok(resp) => {
                let body: serde_json::Value = resp.json().await.unwrap_or_default();
                let answer = body["response"].as_str().unwrap_or_default().to_string();
                stub.vars
                    .lock()
                    .unwrap()
                    .insert("result".to_string(), serde_json::json!(answer));
                Json(serde_json::json!({
                    "output": format!("{answer}\n"), "stderr": "", "vars": ["result"]
                }))
            }
            Err(err) => Json(serde_json::json!({
                "output": "", "stderr": "", "vars": [],
                "error": format!("ConnectionError: {err}")
            })),
        };
    }

    // search_knowledge("...", top_k=N) goes through a real /tool_call round trip.
    if let Some(query) = extract_call_arg(&code, "search_knowledge(") {
        let callback = stub.callback_url.lock().unwrap().clone().unwrap_or_default();
        let top_k = code
            .split("top_k=")
            .nth(1)
            .and_then(|rest| rest.chars().take_while(|c| c.is_ascii_digit()).collect::<String>().parse::<u64>().ok())
            .unwrap_or(3);
        let response = stub
            .http
            .post(format!("{callback}/tool_call"))
            .json(&serde_json::json!({
                "tool": "search_knowledge",
                "input": { "query": query, "top_k": top_k }
            }))
            .send()
            .await;
        return match response {
            Ok(resp) => {
                let body: serde_json::Value = resp.json().await.unwrap_or_default();
                Json(serde_json::json!({
                    "output": body["result"].to_string(), "stderr": "", "vars": []
                }))
            }
            Err(err) => Json(serde_json::json!({
                "output": "", "stderr": "", "vars": [],
                "error": format!("ConnectionError: {err}")
            })),
        };
    }

    // base64 load template from the `load` tool.
    if code.contains("_sbx_b64.b64decode(") {
        if let Some((name, _)) = code
            .lines()
            .find(|l| l.contains(" = _sbx_b64.b64decode("))
            .and_then(|l| l.split_once(" = "))
        {
            stub.vars
                .lock()
                .unwrap()
                .insert(name.trim().to_string(), serde_json::json!("<file content>"));
            return Json(serde_json::json!({
                "output": "", "stderr": "", "vars": [name.trim()]
            }));
        }
    }

    // print("...") / print(expr)
    if let Some(arg) = extract_call_arg(&code, "print(") {
        return Json(serde_json::json!({
            "output": format!("{arg}\n"), "stderr": "", "vars": []
        }));
    }

    // Simple `name = <json literal>` assignment.
    if let Some((name, value)) = code.trim().split_once(" = ") {
        let name = name.trim();
        if name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            let parsed: serde_json::Value = serde_json::from_str(value.trim())
                .unwrap_or_else(|_| serde_json::json!(value.trim()));
            stub.vars.lock().unwrap().insert(name.to_string(), parsed);
            return Json(serde_json::json!({
                "output": "", "stderr": "", "vars": [name]
            }));
        }
    }

    Json(serde_json::json!({ "output": "", "stderr": "", "vars": [] }))
}

/// First string literal argument of `prefix(...)`, if present.
fn extract_call_arg(code: &str, prefix: &str) -> Option<String> {
    let start = code.find(prefix)? + prefix.len();
    let rest = &code[start..];
    let quote = rest.chars().next()?;
    if quote != '"' && quote != '\'' {
        return None;
    }
    let rest = &rest[1..];
    let end = rest.find(quote)?;
    Some(rest[..end].to_string())
}

async fn kernel_vars(State(stub): State<Arc<KernelStub>>) -> Json<serde_json::Value> {
    let vars = stub.vars.lock().unwrap();
    let list: Vec<serde_json::Value> = vars
        .iter()
        .map(|(name, value)| {
            serde_json::json!({
                "name": name,
                "type": if value.is_string() { "str" } else { "object" },
                "summary": value.to_string(),
            })
        })
        .collect();
    Json(serde_json::json!(list))
}

async fn kernel_var(
    State(stub): State<Arc<KernelStub>>,
    axum::extract::Path(name): axum::extract::Path<String>,
) -> axum::response::Response {
    let vars = stub.vars.lock().unwrap();
    match vars.get(&name) {
        Some(value) => Json(serde_json::json!({ "value": value })).into_response(),
        None => (axum::http::StatusCode::NOT_FOUND, "no such variable").into_response(),
    }
}

async fn kernel_reset(State(stub): State<Arc<KernelStub>>) -> Json<serde_json::Value> {
    stub.vars.lock().unwrap().clear();
    Json(serde_json::json!({ "status": "ok" }))
}

async fn kernel_snapshot_save(State(stub): State<Arc<KernelStub>>) -> Vec<u8> {
    let vars = stub.vars.lock().unwrap();
    serde_json::to_vec(&*vars).unwrap()
}

async fn kernel_snapshot_restore(
    State(stub): State<Arc<KernelStub>>,
    body: axum::body::Bytes,
) -> axum::response::Response {
    if stub.reject_restore.load(Ordering::SeqCst) {
        return (axum::http::StatusCode::BAD_REQUEST, "unreadable snapshot").into_response();
    }
    match serde_json::from_slice::<HashMap<String, serde_json::Value>>(&body) {
        Ok(restored) => {
            let names: Vec<String> = restored.keys().cloned().collect();
            *stub.vars.lock().unwrap() = restored;
            Json(serde_json::json!({ "restored": names, "skipped": [] })).into_response()
        }
        Err(_) => (axum::http::StatusCode::BAD_REQUEST, "unreadable snapshot").into_response(),
    }
}

async fn kernel_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
