//! Client-facing HTTP tool API.
//!
//! The client calls a named tool with a JSON argument object and receives a
//! JSON result. There is no streaming and no discovery protocol beyond the
//! listing endpoint; tool names are fixed (see [`crate::tools`]).
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/tools/{name}` | Invoke a tool with a JSON argument object |
//! | `GET`  | `/tools/list` | List tools with their parameter schemas |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error contract
//!
//! ```json
//! { "error": { "kind": "validation", "message": "Missing required argument 'query'." } }
//! ```
//!
//! The HTTP status derives from the error kind; no stack ever crosses this
//! boundary.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::error::ToolError;
use crate::tools::{ToolContext, ToolRegistry};

/// Shared state for all route handlers.
#[derive(Clone)]
pub struct ServerState {
    pub registry: Arc<ToolRegistry>,
    pub context: Arc<ToolContext>,
}

/// Build the router; the caller owns binding and shutdown.
pub fn router(state: ServerState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/tools/list", get(handle_list))
        .route("/tools/{name}", post(handle_call))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

impl IntoResponse for ToolError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": { "kind": self.kind.as_str(), "message": self.message }
        });
        (self.kind.status_code(), Json(body)).into_response()
    }
}

// ============ POST /tools/{name} ============

async fn handle_call(
    State(state): State<ServerState>,
    Path(name): Path<String>,
    Json(params): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ToolError> {
    let result = state.registry.dispatch(&name, params, &state.context).await?;
    Ok(Json(serde_json::json!({ "result": result })))
}

// ============ GET /tools/list ============

/// One tool descriptor in the listing.
#[derive(Serialize)]
struct ToolInfo {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Serialize)]
struct ListResponse {
    tools: Vec<ToolInfo>,
}

async fn handle_list(State(state): State<ServerState>) -> Json<ListResponse> {
    let tools = state
        .registry
        .tools()
        .iter()
        .map(|tool| ToolInfo {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            parameters: tool.parameters_schema(),
        })
        .collect();
    Json(ListResponse { tools })
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
