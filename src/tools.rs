//! The fixed tool surface exposed to the client.
//!
//! Every tool declares a JSON-Schema parameter contract; arguments are
//! validated against it before dispatch and mismatches come back as
//! `validation` errors. Handlers return a single structured JSON result,
//! never a stream. Uncaught conditions are wrapped as `internal` with a
//! generic message at this boundary.
//!
//! A separate [`SandboxBridge`] implements the sandbox-callable dispatcher
//! used by the callback server, so kernel-originated calls route through
//! host implementations without touching the client transport.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::callback::{CallbackState, SandboxDispatcher};
use crate::config::Config;
use crate::error::{ToolError, ToolResult};
use crate::fetch::Fetcher;
use crate::kernel_manager::KernelManager;
use crate::llm::LlmProvider;
use crate::models::IngestDoc;
use crate::project::{project_id_for, ProjectRegistry};
use crate::research::ResearchOrchestrator;
use crate::store::{KnowledgeStore, SearchMode};
use crate::subagent::{LimitOverrides, SubAgentRunner};

/// Path fragments the `load` family refuses: credential directories and
/// cloud configuration.
const DENIED_PATH_PARTS: &[&str] = &[
    ".ssh",
    ".aws",
    ".gnupg",
    ".kube",
    ".netrc",
    ".npmrc",
    ".docker",
    "gcloud",
    ".azure",
    ".env",
    "credentials",
    "id_rsa",
];

/// Largest file `load` / `load_file` will read, bytes.
const MAX_LOAD_BYTES: u64 = 4 * 1024 * 1024;

// ═══════════════════════════════════════════════════════════════════════
// ToolContext
// ═══════════════════════════════════════════════════════════════════════

/// Bridge handed to every tool execution.
///
/// Owns shared handles to all host components; cheap to clone via `Arc`.
pub struct ToolContext {
    pub config: Arc<Config>,
    pub projects: Arc<ProjectRegistry>,
    pub fetcher: Arc<Fetcher>,
    pub manager: KernelManager,
    pub runner: Arc<SubAgentRunner>,
    pub research: Arc<ResearchOrchestrator>,
    pub callback: Arc<CallbackState>,
    pub sub_model: Arc<dyn LlmProvider>,
    /// Project addressed when a call names none (working-directory hash).
    pub default_project: String,
}

impl ToolContext {
    /// Resolve the store for an optional `project` argument.
    async fn store_for(&self, params: &Value) -> ToolResult<Arc<KnowledgeStore>> {
        let project = match params.get("project").and_then(|p| p.as_str()) {
            Some(explicit) => project_id_for(explicit),
            None => self.default_project.clone(),
        };
        self.projects.store(&project).await.map_err(Into::into)
    }

    fn project_name(&self, params: &Value) -> String {
        match params.get("project").and_then(|p| p.as_str()) {
            Some(explicit) => project_id_for(explicit),
            None => self.default_project.clone(),
        }
    }
}

/// Refuse paths under the credential denylist.
pub fn check_path_allowed(path: &str) -> ToolResult<()> {
    let lowered = path.to_ascii_lowercase();
    for part in lowered.split(['/', '\\']) {
        if DENIED_PATH_PARTS.iter().any(|deny| part == *deny) {
            return Err(ToolError::blocked(format!(
                "Paths under '{part}' hold credentials and cannot be loaded."
            )));
        }
    }
    Ok(())
}

fn read_limited(path: &str) -> ToolResult<String> {
    let metadata = std::fs::metadata(path)
        .map_err(|_| ToolError::not_found(format!("The file '{path}' does not exist.")))?;
    if !metadata.is_file() {
        return Err(ToolError::validation(format!("'{path}' is not a file.")));
    }
    if metadata.len() > MAX_LOAD_BYTES {
        return Err(ToolError::validation(format!(
            "'{path}' exceeds the {MAX_LOAD_BYTES}-byte load limit."
        )));
    }
    std::fs::read_to_string(path)
        .map_err(|_| ToolError::validation(format!("'{path}' is not readable as UTF-8 text.")))
}

// ═══════════════════════════════════════════════════════════════════════
// Tool trait and registry
// ═══════════════════════════════════════════════════════════════════════

/// One named operation on the tool surface.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema (`type: object`) for the arguments.
    fn parameters_schema(&self) -> Value;
    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult<Value>;
}

/// Registry of the fixed tool set.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// The full tool surface.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        // Kernel
        registry.register(Box::new(ExecTool));
        registry.register(Box::new(LoadTool));
        registry.register(Box::new(GetTool));
        registry.register(Box::new(VarsTool));
        registry.register(Box::new(ResetTool));
        registry.register(Box::new(SubAgentTool));
        registry.register(Box::new(UsageTool));
        // Knowledge
        registry.register(Box::new(SearchTool));
        registry.register(Box::new(AskTool));
        registry.register(Box::new(TimelineTool));
        registry.register(Box::new(IngestTool));
        // Fetching
        registry.register(Box::new(FetchTool));
        registry.register(Box::new(LoadDirTool));
        registry.register(Box::new(FetchSitemapTool));
        // Research / management
        registry.register(Box::new(ResearchTool));
        registry.register(Box::new(KnowledgeStatusTool));
        registry.register(Box::new(KnowledgeClearTool));
        registry
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    /// Validate arguments and run the named tool.
    pub async fn dispatch(&self, name: &str, params: Value, ctx: &ToolContext) -> ToolResult<Value> {
        let tool = self
            .find(name)
            .ok_or_else(|| ToolError::not_found(format!("No tool named '{name}'.")))?;
        validate_args(&tool.parameters_schema(), &params)?;
        tool.execute(params, ctx).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Check a parameter object against a tool's JSON Schema: required fields
/// present, no unknown fields, primitive types as declared.
pub fn validate_args(schema: &Value, params: &Value) -> ToolResult<()> {
    let params_map = params
        .as_object()
        .ok_or_else(|| ToolError::validation("Arguments must be a JSON object."))?;
    let properties = schema
        .get("properties")
        .and_then(|p| p.as_object())
        .cloned()
        .unwrap_or_default();

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field in required {
            let field = field.as_str().unwrap_or_default();
            if !params_map.contains_key(field) {
                return Err(ToolError::validation(format!(
                    "Missing required argument '{field}'."
                )));
            }
        }
    }

    for (key, value) in params_map {
        let Some(declared) = properties.get(key) else {
            return Err(ToolError::validation(format!("Unknown argument '{key}'.")));
        };
        if value.is_null() {
            continue;
        }
        let expected = declared.get("type").and_then(|t| t.as_str()).unwrap_or("");
        let ok = match expected {
            "string" => value.is_string(),
            "integer" => value.is_i64() || value.is_u64(),
            "number" => value.is_number(),
            "boolean" => value.is_boolean(),
            "object" => value.is_object(),
            "array" => value.is_array(),
            _ => true,
        };
        if !ok {
            return Err(ToolError::validation(format!(
                "Argument '{key}' must be of type {expected}."
            )));
        }
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Kernel tools
// ═══════════════════════════════════════════════════════════════════════

/// Run code in the kernel, retaining variables across calls.
struct ExecTool;

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Execute code in the stateful kernel"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": { "type": "string", "description": "Code to execute" },
                "timeout": { "type": "integer", "description": "Execution timeout in seconds" }
            },
            "required": ["code"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult<Value> {
        let code = params["code"].as_str().unwrap_or_default();
        if code.trim().is_empty() {
            return Err(ToolError::validation("code must not be empty"));
        }
        let timeout = params
            .get("timeout")
            .and_then(|t| t.as_u64())
            .unwrap_or(ctx.config.kernel.exec_timeout_secs);

        let outcome = ctx
            .manager
            .execute(code, timeout)
            .await
            .map_err(|err| err.to_tool_error())?;
        Ok(json!({
            "stdout": outcome.stdout,
            "stderr": outcome.stderr,
            "vars": outcome.variables,
        }))
    }
}

/// Load a local file into a kernel variable.
struct LoadTool;

#[async_trait]
impl Tool for LoadTool {
    fn name(&self) -> &str {
        "load"
    }

    fn description(&self) -> &str {
        "Load a local file into a kernel variable"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File to load" },
                "var_name": { "type": "string", "description": "Kernel variable to bind" }
            },
            "required": ["path", "var_name"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult<Value> {
        let path = params["path"].as_str().unwrap_or_default();
        let var_name = params["var_name"].as_str().unwrap_or_default();
        check_path_allowed(path)?;
        if !crate::subagent::is_identifier(var_name) {
            return Err(ToolError::validation(format!(
                "'{var_name}' is not a valid variable name."
            )));
        }

        let content = read_limited(path)?;
        let bytes = content.len();

        // Transported as base64 so arbitrary content survives templating.
        use base64::Engine as _;
        let encoded = base64::engine::general_purpose::STANDARD.encode(content.as_bytes());
        let code = format!(
            "import base64 as _sbx_b64\n{var_name} = _sbx_b64.b64decode(\"{encoded}\").decode(\"utf-8\")\n"
        );
        ctx.manager
            .execute(&code, ctx.config.kernel.exec_timeout_secs)
            .await
            .map_err(|err| err.to_tool_error())?;

        Ok(json!({ "loaded": var_name, "bytes": bytes }))
    }
}

/// Read one kernel variable.
struct GetTool;

#[async_trait]
impl Tool for GetTool {
    fn name(&self) -> &str {
        "get"
    }

    fn description(&self) -> &str {
        "Read a kernel variable, optionally through an accessor expression"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Variable name" },
                "query": { "type": "string", "description": "Accessor expression" }
            },
            "required": ["name"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult<Value> {
        let name = params["name"].as_str().unwrap_or_default();
        let query = params.get("query").and_then(|q| q.as_str());
        let client = ctx.manager.client().await?;
        let value = client
            .get_variable(name, query)
            .await
            .map_err(|err| err.to_tool_error())?;
        Ok(json!({ "name": name, "value": value }))
    }
}

/// List kernel variables.
struct VarsTool;

#[async_trait]
impl Tool for VarsTool {
    fn name(&self) -> &str {
        "vars"
    }

    fn description(&self) -> &str {
        "List variables in the kernel namespace"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext) -> ToolResult<Value> {
        let client = ctx.manager.client().await?;
        let vars = client
            .list_variables()
            .await
            .map_err(|err| err.to_tool_error())?;
        Ok(json!({ "vars": vars }))
    }
}

/// Clear the kernel namespace.
struct ResetTool;

#[async_trait]
impl Tool for ResetTool {
    fn name(&self) -> &str {
        "reset"
    }

    fn description(&self) -> &str {
        "Clear all kernel variables"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext) -> ToolResult<Value> {
        let client = ctx.manager.client().await?;
        client.reset().await.map_err(|err| err.to_tool_error())?;
        Ok(json!({ "reset": true }))
    }
}

/// Run a bounded sub-agent loop.
struct SubAgentTool;

#[async_trait]
impl Tool for SubAgentTool {
    fn name(&self) -> &str {
        "sub_agent"
    }

    fn description(&self) -> &str {
        "Run a bounded sub-agent reasoning loop against the kernel"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "signature": { "type": "string", "description": "Registered name or shorthand like 'text -> summary: str'" },
                "inputs": { "type": "object", "description": "Values for the signature's input fields" },
                "limits": { "type": "object", "description": "Optional overrides: max_iterations, max_llm_calls, max_output_chars" }
            },
            "required": ["signature", "inputs"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult<Value> {
        let signature = params["signature"].as_str().unwrap_or_default();
        let inputs = params.get("inputs").cloned().unwrap_or(json!({}));
        let overrides: LimitOverrides = params
            .get("limits")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|_| ToolError::validation("limits must hold integer fields"))?
            .unwrap_or_default();

        match ctx.runner.run(signature, &inputs, overrides).await {
            Ok(run) => Ok(json!({
                "outputs": run.outputs,
                "trajectory": run.trajectory,
                "iterations": run.iterations,
                "usage": run.usage,
            })),
            // Limit and model failures keep their trajectory; the error
            // stays a structured value rather than an HTTP failure.
            Err(failure) => Ok(json!({
                "error_kind": failure.error.kind.as_str(),
                "message": failure.error.message,
                "trajectory": failure.trajectory,
                "iterations": failure.iterations,
            })),
        }
    }
}

/// Report or reset the sub-model usage ledger.
struct UsageTool;

#[async_trait]
impl Tool for UsageTool {
    fn name(&self) -> &str {
        "usage"
    }

    fn description(&self) -> &str {
        "Report cumulative sub-model usage, optionally resetting it"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "reset": { "type": "boolean", "description": "Zero the counters after reporting" }
            }
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult<Value> {
        let reset = params.get("reset").and_then(|r| r.as_bool()).unwrap_or(false);
        let usage = if reset {
            ctx.callback.reset_usage()
        } else {
            ctx.callback.usage()
        };
        Ok(serde_json::to_value(usage).unwrap_or(json!({})))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Knowledge tools
// ═══════════════════════════════════════════════════════════════════════

/// Hybrid search over a project index.
struct SearchTool;

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Search the knowledge store"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query" },
                "top_k": { "type": "integer", "description": "Max hits" },
                "mode": { "type": "string", "description": "lexical, vector, or hybrid" },
                "project": { "type": "string", "description": "Project to search" },
                "thread": { "type": "string", "description": "Thread filter" },
                "label": { "type": "string", "description": "Label filter" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult<Value> {
        let query = params["query"].as_str().unwrap_or_default();
        if query.trim().is_empty() {
            return Err(ToolError::validation("query must not be empty"));
        }
        let top_k = params
            .get("top_k")
            .and_then(|k| k.as_u64())
            .map(|k| k as usize)
            .unwrap_or(ctx.config.retrieval.top_k);
        let mode = params
            .get("mode")
            .and_then(|m| m.as_str())
            .map(SearchMode::parse)
            .transpose()
            .map_err(|err| ToolError::validation(err.to_string()))?
            .unwrap_or(SearchMode::Hybrid);

        let store = ctx.store_for(&params).await?;
        let hits = store
            .search(
                query,
                top_k,
                mode,
                params.get("thread").and_then(|t| t.as_str()),
                params.get("label").and_then(|l| l.as_str()),
            )
            .await
            .map_err(ToolError::from)?;
        Ok(json!({ "hits": hits }))
    }
}

/// Retrieval-augmented question answering.
struct AskTool;

#[async_trait]
impl Tool for AskTool {
    fn name(&self) -> &str {
        "ask"
    }

    fn description(&self) -> &str {
        "Answer a question from the knowledge store, with citations"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": { "type": "string", "description": "The question" },
                "context_only": { "type": "boolean", "description": "Return raw chunks instead of a synthesized answer" },
                "project": { "type": "string", "description": "Project to consult" },
                "thread": { "type": "string", "description": "Thread filter" }
            },
            "required": ["question"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult<Value> {
        let question = params["question"].as_str().unwrap_or_default();
        if question.trim().is_empty() {
            return Err(ToolError::validation("question must not be empty"));
        }
        let context_only = params
            .get("context_only")
            .and_then(|c| c.as_bool())
            .unwrap_or(ctx.config.knowledge.ask_context_only);

        let store = ctx.store_for(&params).await?;
        let response = store
            .ask(
                question,
                context_only,
                params.get("thread").and_then(|t| t.as_str()),
                Some(ctx.sub_model.as_ref()),
            )
            .await
            .map_err(ToolError::from)?;
        Ok(serde_json::to_value(response).unwrap_or(json!({})))
    }
}

/// Ingestion timeline of a project.
struct TimelineTool;

#[async_trait]
impl Tool for TimelineTool {
    fn name(&self) -> &str {
        "timeline"
    }

    fn description(&self) -> &str {
        "List ingested titles in time order"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "since": { "type": "string", "description": "Lower bound, YYYY-MM-DD or Unix seconds" },
                "until": { "type": "string", "description": "Upper bound, YYYY-MM-DD or Unix seconds" },
                "project": { "type": "string", "description": "Project to list" }
            }
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult<Value> {
        let since = parse_time_bound(params.get("since"), false)?;
        let until = parse_time_bound(params.get("until"), true)?;
        let store = ctx.store_for(&params).await?;
        let entries = store.timeline(since, until).await.map_err(ToolError::from)?;
        Ok(json!({ "entries": entries }))
    }
}

/// Direct text ingest.
struct IngestTool;

#[async_trait]
impl Tool for IngestTool {
    fn name(&self) -> &str {
        "ingest"
    }

    fn description(&self) -> &str {
        "Ingest text into the knowledge store"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": { "type": "string", "description": "Logical document name" },
                "label": { "type": "string", "description": "Coarse bucket, defaults to 'note'" },
                "text": { "type": "string", "description": "Markdown body" },
                "thread": { "type": "string", "description": "Thread namespace" },
                "project": { "type": "string", "description": "Target project" }
            },
            "required": ["title", "text"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult<Value> {
        let title = params["title"].as_str().unwrap_or_default();
        let text = params["text"].as_str().unwrap_or_default();
        if title.trim().is_empty() || text.trim().is_empty() {
            return Err(ToolError::validation("title and text must not be empty"));
        }
        let label = params
            .get("label")
            .and_then(|l| l.as_str())
            .unwrap_or("note");

        let mut doc = IngestDoc::new(title, label, text);
        doc.thread = params
            .get("thread")
            .and_then(|t| t.as_str())
            .map(str::to_string);
        doc.metadata
            .insert("source".into(), json!("ingest"));

        let store = ctx.store_for(&params).await?;
        let report = store.ingest(&doc).await.map_err(ToolError::from)?;
        Ok(serde_json::to_value(report).unwrap_or(json!({})))
    }
}

fn parse_time_bound(value: Option<&Value>, end_of_day: bool) -> ToolResult<Option<i64>> {
    let Some(value) = value else { return Ok(None) };
    if value.is_null() {
        return Ok(None);
    }
    if let Some(ts) = value.as_i64() {
        return Ok(Some(ts));
    }
    let text = value
        .as_str()
        .ok_or_else(|| ToolError::validation("time bounds must be strings or integers"))?;
    if let Ok(ts) = text.parse::<i64>() {
        return Ok(Some(ts));
    }
    let date = chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map_err(|_| ToolError::validation(format!("'{text}' is not YYYY-MM-DD or Unix seconds")))?;
    let time = if end_of_day {
        date.and_hms_opt(23, 59, 59)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    Ok(time.map(|t| t.and_utc().timestamp()))
}

// ═══════════════════════════════════════════════════════════════════════
// Fetching tools
// ═══════════════════════════════════════════════════════════════════════

/// Fetch one URL through the markdown cascade.
struct FetchTool;

#[async_trait]
impl Tool for FetchTool {
    fn name(&self) -> &str {
        "fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL as markdown, cache it, and index it"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "URL to fetch" },
                "force": { "type": "boolean", "description": "Bypass the freshness window" },
                "project": { "type": "string", "description": "Target project" }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult<Value> {
        let url = params["url"].as_str().unwrap_or_default();
        let force = params.get("force").and_then(|f| f.as_bool()).unwrap_or(false);
        let store = ctx.store_for(&params).await?;

        // The fetcher's contract is structured results, not raised errors.
        match ctx.fetcher.fetch(&store, url, force).await {
            Ok(outcome) => Ok(serde_json::to_value(outcome).unwrap_or(json!({}))),
            Err(err) => Ok(json!({
                "url": url,
                "error_kind": err.kind.as_str(),
                "message": err.message,
            })),
        }
    }
}

/// Ingest local files matching a glob.
struct LoadDirTool;

#[async_trait]
impl Tool for LoadDirTool {
    fn name(&self) -> &str {
        "load_dir"
    }

    fn description(&self) -> &str {
        "Ingest local files matching a glob pattern"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "glob": { "type": "string", "description": "Glob pattern, e.g. docs/**/*.md" },
                "project": { "type": "string", "description": "Target project" }
            },
            "required": ["glob"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult<Value> {
        let pattern = params["glob"].as_str().unwrap_or_default();
        let store = ctx.store_for(&params).await?;
        match ctx.fetcher.load_dir(&store, pattern).await {
            Ok(report) => Ok(serde_json::to_value(report).unwrap_or(json!({}))),
            Err(err) => Ok(json!({
                "glob": pattern,
                "error_kind": err.kind.as_str(),
                "message": err.message,
            })),
        }
    }
}

/// Expand and fetch a sitemap.
struct FetchSitemapTool;

#[async_trait]
impl Tool for FetchSitemapTool {
    fn name(&self) -> &str {
        "fetch_sitemap"
    }

    fn description(&self) -> &str {
        "Fetch every page of a sitemap with bounded concurrency"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "Sitemap URL" },
                "project": { "type": "string", "description": "Target project" }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult<Value> {
        let url = params["url"].as_str().unwrap_or_default();
        let store = ctx.store_for(&params).await?;
        match ctx.fetcher.fetch_sitemap(store, url).await {
            Ok(report) => Ok(serde_json::to_value(report).unwrap_or(json!({}))),
            Err(err) => Ok(json!({
                "url": url,
                "error_kind": err.kind.as_str(),
                "message": err.message,
            })),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Research / management tools
// ═══════════════════════════════════════════════════════════════════════

/// Compound research run.
struct ResearchTool;

#[async_trait]
impl Tool for ResearchTool {
    fn name(&self) -> &str {
        "research"
    }

    fn description(&self) -> &str {
        "Discover, fetch, and index documentation for a topic"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "topic": { "type": "string", "description": "Topic to research" },
                "seeds": { "type": "array", "description": "Additional seed URLs" },
                "project": { "type": "string", "description": "Target project; defaults to the topic slug" }
            },
            "required": ["topic"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult<Value> {
        let topic = params["topic"].as_str().unwrap_or_default();
        if topic.trim().is_empty() {
            return Err(ToolError::validation("topic must not be empty"));
        }
        let seeds: Vec<String> = params
            .get("seeds")
            .and_then(|s| s.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        // Research results default into a topic-slug project.
        let project = match params.get("project").and_then(|p| p.as_str()) {
            Some(explicit) => project_id_for(explicit),
            None => project_id_for(topic),
        };
        let store = ctx.projects.store(&project).await?;
        let report = ctx.research.research(store, topic, &seeds).await?;
        Ok(serde_json::to_value(report).unwrap_or(json!({})))
    }
}

/// Project index status.
struct KnowledgeStatusTool;

#[async_trait]
impl Tool for KnowledgeStatusTool {
    fn name(&self) -> &str {
        "knowledge_status"
    }

    fn description(&self) -> &str {
        "Report document, chunk, and size counts for a project"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "project": { "type": "string", "description": "Project to inspect" }
            }
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult<Value> {
        let store = ctx.store_for(&params).await?;
        let status = ctx.research.knowledge_status(&store).await?;
        Ok(serde_json::to_value(status).unwrap_or(json!({})))
    }
}

/// Delete a project index.
struct KnowledgeClearTool;

#[async_trait]
impl Tool for KnowledgeClearTool {
    fn name(&self) -> &str {
        "knowledge_clear"
    }

    fn description(&self) -> &str {
        "Delete a project's index and reset its caches"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "project": { "type": "string", "description": "Project to clear" }
            }
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult<Value> {
        let project = ctx.project_name(&params);
        let store = ctx.store_for(&params).await?;
        ctx.research.knowledge_clear(&store).await?;
        ctx.projects.evict(&project).await;
        Ok(json!({ "cleared": project }))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Sandbox dispatch
// ═══════════════════════════════════════════════════════════════════════

/// Routes whitelisted kernel-originated calls to host implementations.
///
/// A deliberately small slice of the host: the read-only subset of the
/// tool surface, with no handle back to the callback server or the kernel.
/// Results go back over the callback channel only and never reach the
/// client transport.
pub struct SandboxBridge {
    pub config: Arc<Config>,
    pub projects: Arc<ProjectRegistry>,
    pub fetcher: Arc<Fetcher>,
    pub default_project: String,
}

#[async_trait]
impl SandboxDispatcher for SandboxBridge {
    async fn dispatch(&self, tool: &str, input: Value) -> ToolResult<Value> {
        match tool {
            "search_knowledge" => {
                let query = input
                    .get("query")
                    .and_then(|q| q.as_str())
                    .ok_or_else(|| ToolError::validation("search_knowledge needs 'query'"))?;
                let top_k = input
                    .get("top_k")
                    .and_then(|k| k.as_u64())
                    .map(|k| k as usize)
                    .unwrap_or(self.config.retrieval.top_k);
                let store = self.projects.store(&self.default_project).await?;
                let hits = store
                    .search(query, top_k, SearchMode::Hybrid, None, None)
                    .await
                    .map_err(ToolError::from)?;
                Ok(json!({ "hits": hits }))
            }
            "ask_knowledge" => {
                let question = input
                    .get("question")
                    .and_then(|q| q.as_str())
                    .ok_or_else(|| ToolError::validation("ask_knowledge needs 'question'"))?;
                let store = self.projects.store(&self.default_project).await?;
                // Context-only from the sandbox; synthesis would recurse
                // into the sub-model mid-callback.
                let response = store
                    .ask(question, true, None, None)
                    .await
                    .map_err(ToolError::from)?;
                Ok(serde_json::to_value(response).unwrap_or(json!({})))
            }
            "fetch_url" => {
                let url = input
                    .get("url")
                    .and_then(|u| u.as_str())
                    .ok_or_else(|| ToolError::validation("fetch_url needs 'url'"))?;
                let force = input.get("force").and_then(|f| f.as_bool()).unwrap_or(false);
                let store = self.projects.store(&self.default_project).await?;
                let outcome = self.fetcher.fetch(&store, url, force).await?;
                Ok(serde_json::to_value(outcome).unwrap_or(json!({})))
            }
            "load_file" => {
                let path = input
                    .get("path")
                    .and_then(|p| p.as_str())
                    .ok_or_else(|| ToolError::validation("load_file needs 'path'"))?;
                check_path_allowed(path)?;
                let content = read_limited(path)?;
                Ok(json!({ "path": path, "content": content }))
            }
            "apple_search" => {
                let query = input
                    .get("query")
                    .and_then(|q| q.as_str())
                    .ok_or_else(|| ToolError::validation("apple_search needs 'query'"))?;
                let top_k = input
                    .get("top_k")
                    .and_then(|k| k.as_u64())
                    .map(|k| k as usize)
                    .unwrap_or(self.config.retrieval.top_k);
                let store = self.projects.store(&self.default_project).await?;
                let hits = store
                    .search(query, top_k * 4, SearchMode::Hybrid, None, None)
                    .await
                    .map_err(ToolError::from)?;
                // Restricted to previously indexed Apple documentation.
                let hits: Vec<_> = hits
                    .into_iter()
                    .filter(|hit| hit.title.contains("apple.com"))
                    .take(top_k)
                    .collect();
                Ok(json!({ "hits": hits }))
            }
            other => Err(ToolError::validation(format!(
                "Tool '{other}' is not callable from the sandbox."
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_has_full_surface() {
        let registry = ToolRegistry::with_builtins();
        for name in [
            "exec",
            "load",
            "get",
            "vars",
            "reset",
            "sub_agent",
            "usage",
            "search",
            "ask",
            "timeline",
            "ingest",
            "fetch",
            "load_dir",
            "fetch_sitemap",
            "research",
            "knowledge_status",
            "knowledge_clear",
        ] {
            assert!(registry.find(name).is_some(), "missing tool {name}");
        }
    }

    #[test]
    fn test_validate_args_required_and_unknown() {
        let schema = json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "top_k": { "type": "integer" }
            },
            "required": ["query"]
        });
        assert!(validate_args(&schema, &json!({"query": "x"})).is_ok());
        assert!(validate_args(&schema, &json!({})).is_err());
        assert!(validate_args(&schema, &json!({"query": "x", "bogus": 1})).is_err());
        assert!(validate_args(&schema, &json!({"query": 7})).is_err());
        assert!(validate_args(&schema, &json!({"query": "x", "top_k": 3})).is_ok());
    }

    #[test]
    fn test_path_denylist() {
        assert!(check_path_allowed("/home/user/.ssh/id_rsa").is_err());
        assert!(check_path_allowed("/home/user/.aws/credentials").is_err());
        assert!(check_path_allowed("C:\\Users\\u\\.kube\\config").is_err());
        assert!(check_path_allowed("/home/user/project/notes.md").is_ok());
    }

    #[test]
    fn test_parse_time_bound() {
        assert_eq!(parse_time_bound(None, false).unwrap(), None);
        assert_eq!(
            parse_time_bound(Some(&json!(1700000000)), false).unwrap(),
            Some(1_700_000_000)
        );
        let since = parse_time_bound(Some(&json!("2024-01-02")), false)
            .unwrap()
            .unwrap();
        let until = parse_time_bound(Some(&json!("2024-01-02")), true)
            .unwrap()
            .unwrap();
        assert!(until - since == 86_399);
        assert!(parse_time_bound(Some(&json!("yesterday")), false).is_err());
    }

    #[test]
    fn test_all_schemas_are_objects() {
        let registry = ToolRegistry::with_builtins();
        for tool in registry.tools() {
            let schema = tool.parameters_schema();
            assert_eq!(schema["type"], "object", "tool {}", tool.name());
        }
    }
}
