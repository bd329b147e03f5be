//! Bounded sub-agent reasoning loops.
//!
//! A run is given a *signature* (input field names → output field names
//! plus instructions) and input values. The loop alternates consulting the
//! main model and executing model-proposed code in the kernel, until the
//! model submits outputs or a limit trips. Helper functions injected at
//! kernel start let that code call the sub-model (`llm_query`,
//! `llm_query_batch`) and a whitelisted set of host tools without any of
//! the traffic re-entering the client's context.
//!
//! # Model protocol
//!
//! The model must answer each consultation with either a fenced code block
//! (executed in the kernel, output appended to the trajectory) or a JSON
//! object `{"submit": {...}}` matching the signature's output fields.
//!
//! # Limits
//!
//! `max_iterations` bounds loop turns, `max_llm_calls` bounds main-model
//! plus sub-model calls combined, `max_output_chars` truncates captured
//! execution output. Exhausting any of them ends the run with a
//! `sandbox_limit` failure carrying the trajectory so far.

use std::sync::Arc;

use serde::Deserialize;

use crate::callback::{CallbackState, SANDBOX_TOOLS};
use crate::config::Config;
use crate::error::{ErrorKind, ToolError};
use crate::kernel_client::KernelError;
use crate::kernel_manager::KernelManager;
use crate::llm::LlmProvider;
use crate::models::{TrajectoryTurn, UsageSnapshot};

// ═══════════════════════════════════════════════════════════════════════
// Signatures
// ═══════════════════════════════════════════════════════════════════════

/// One output field of a signature, with an optional type hint.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct OutputField {
    pub name: String,
    pub type_hint: Option<String>,
}

/// A named, composable task shape for the sub-agent loop.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SignatureSpec {
    pub name: String,
    pub input_fields: Vec<String>,
    pub output_fields: Vec<OutputField>,
    pub instructions: String,
}

/// Resolve a signature reference: a registry name or string shorthand
/// (`"input_a, input_b -> output: list[str]"`). Both paths run through the
/// same validator.
pub fn resolve_signature(reference: &str) -> Result<SignatureSpec, ToolError> {
    let spec = if reference.contains("->") {
        parse_shorthand(reference)?
    } else {
        registry_lookup(reference).ok_or_else(|| {
            ToolError::validation(format!(
                "Unknown signature '{reference}'; use a registered name or shorthand like 'text -> summary: str'."
            ))
        })?
    };
    validate_signature(&spec)?;
    Ok(spec)
}

fn parse_shorthand(reference: &str) -> Result<SignatureSpec, ToolError> {
    let (inputs, outputs) = reference
        .split_once("->")
        .ok_or_else(|| ToolError::validation("A signature shorthand needs '->'."))?;

    let input_fields: Vec<String> = inputs
        .split(',')
        .map(|f| {
            // Inputs may carry type hints too; only the name matters here.
            let name = f.split_once(':').map(|(name, _)| name).unwrap_or(f);
            field_name(name).to_string()
        })
        .filter(|f| !f.is_empty())
        .collect();

    let output_fields: Vec<OutputField> = outputs
        .split(',')
        .filter(|f| !f.trim().is_empty())
        .map(|f| {
            let (name, hint) = match f.split_once(':') {
                Some((name, hint)) => (name, Some(hint.trim().to_string())),
                None => (f, None),
            };
            OutputField {
                name: field_name(name).to_string(),
                type_hint: hint,
            }
        })
        .collect();

    Ok(SignatureSpec {
        name: "inline".to_string(),
        input_fields,
        output_fields,
        instructions: String::new(),
    })
}

fn field_name(raw: &str) -> &str {
    raw.trim().trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '_')
}

fn validate_signature(spec: &SignatureSpec) -> Result<(), ToolError> {
    if spec.input_fields.is_empty() {
        return Err(ToolError::validation(
            "A signature needs at least one input field.",
        ));
    }
    if spec.output_fields.is_empty() {
        return Err(ToolError::validation(
            "A signature needs at least one output field.",
        ));
    }
    let mut seen = std::collections::HashSet::new();
    for field in spec
        .input_fields
        .iter()
        .chain(spec.output_fields.iter().map(|f| &f.name))
    {
        if !is_identifier(field) {
            return Err(ToolError::validation(format!(
                "'{field}' is not a valid field name."
            )));
        }
        if !seen.insert(field.clone()) {
            return Err(ToolError::validation(format!(
                "Field '{field}' appears twice in the signature."
            )));
        }
    }
    Ok(())
}

pub(crate) fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// The built-in signature registry. Resolution is a pure function of the
/// name and this table.
fn registry_lookup(name: &str) -> Option<SignatureSpec> {
    let (inputs, outputs, instructions): (&[&str], &[(&str, &str)], &str) = match name {
        "search" => (
            &["query"],
            &[("findings", "list[str]")],
            "Search the knowledge store for material relevant to the query. \
             Use search_knowledge(query=..., top_k=...) from code, inspect the hits, \
             and submit the distinct findings.",
        ),
        "extract" => (
            &["text", "schema"],
            &[("fields", "dict")],
            "Extract the fields described by the schema from the text. Prefer \
             deterministic string processing in code; consult llm_query only for \
             genuinely ambiguous spans.",
        ),
        "classify" => (
            &["text"],
            &[("category", "str")],
            "Classify the text. Use llm_query for the judgment call and submit \
             the single category label.",
        ),
        "summarize" => (
            &["text"],
            &[("summary", "str")],
            "Summarize the text faithfully. Long inputs should be split in code \
             and condensed with llm_query_batch before a final merge.",
        ),
        "deep_reasoning" => (
            &["question", "context"],
            &[("answer", "str")],
            "Work in three phases. Recon: inspect the context in code and print \
             what is actually there. Filter: narrow the candidate material \
             deterministically in code, never by guessing. Aggregate: hand the \
             filtered material to llm_query and synthesize the answer.",
        ),
        "deep_reasoning_multi" => (
            &["question", "context"],
            &[("answers", "list[str]")],
            "Work in three phases. Recon: inspect the context in code and print \
             what is actually there. Filter: narrow the candidate material \
             deterministically in code, never by guessing. Aggregate: fan the \
             finalists out with llm_query_batch and submit one answer per \
             candidate, input order preserved.",
        ),
        _ => return None,
    };

    Some(SignatureSpec {
        name: name.to_string(),
        input_fields: inputs.iter().map(|s| s.to_string()).collect(),
        output_fields: outputs
            .iter()
            .map(|(n, t)| OutputField {
                name: n.to_string(),
                type_hint: Some(t.to_string()),
            })
            .collect(),
        instructions: instructions.to_string(),
    })
}

// ═══════════════════════════════════════════════════════════════════════
// Helper injection
// ═══════════════════════════════════════════════════════════════════════

/// Source injected into the kernel namespace at every (re)start.
///
/// The host does not depend on the kernel's language beyond this template:
/// the kernel only has to execute it and round-trip JSON over HTTP. Tool
/// stubs are generated from the sandbox whitelist so the two never drift.
pub fn helper_injection_source(callback_url: &str) -> String {
    let mut source = String::from(HELPER_TEMPLATE);
    for tool in SANDBOX_TOOLS {
        source.push_str(&format!("{tool} = _sbx_tool(\"{tool}\")\n"));
    }
    source.replace("__CALLBACK_URL__", callback_url.trim_end_matches('/'))
}

const HELPER_TEMPLATE: &str = r#"
import json as _sbx_json
import urllib.request as _sbx_urlreq

_SBX_CALLBACK = "__CALLBACK_URL__"

def _sbx_post(path, payload):
    data = _sbx_json.dumps(payload).encode("utf-8")
    req = _sbx_urlreq.Request(
        _SBX_CALLBACK + path, data=data,
        headers={"Content-Type": "application/json"})
    with _sbx_urlreq.urlopen(req, timeout=120) as resp:
        body = _sbx_json.loads(resp.read().decode("utf-8"))
    if "error" in body:
        raise RuntimeError(body["error"].get("message", "callback error"))
    return body

def llm_query(prompt):
    return _sbx_post("/llm_query", {"prompt": prompt})["response"]

def llm_query_batch(prompts):
    from concurrent.futures import ThreadPoolExecutor
    def _one(prompt):
        try:
            return llm_query(prompt)
        except Exception as exc:
            return "ERROR: " + str(exc)
    with ThreadPoolExecutor(max_workers=8) as pool:
        return list(pool.map(_one, prompts))

def _sbx_tool(name):
    def _call(**kwargs):
        return _sbx_post("/tool_call", {"tool": name, "input": kwargs})["result"]
    return _call

"#;

// ═══════════════════════════════════════════════════════════════════════
// Runner
// ═══════════════════════════════════════════════════════════════════════

/// Per-run limit overrides; unset fields fall back to configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LimitOverrides {
    pub max_iterations: Option<usize>,
    pub max_llm_calls: Option<u64>,
    pub max_output_chars: Option<usize>,
}

/// A completed run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SubAgentRun {
    pub outputs: serde_json::Value,
    pub trajectory: Vec<TrajectoryTurn>,
    pub iterations: usize,
    pub usage: UsageSnapshot,
}

/// A terminal failure, trajectory attached for inspection.
#[derive(Debug)]
pub struct SubAgentFailure {
    pub error: ToolError,
    pub trajectory: Vec<TrajectoryTurn>,
    pub iterations: usize,
}

/// Drives the bounded model ↔ kernel loop.
pub struct SubAgentRunner {
    config: Arc<Config>,
    manager: KernelManager,
    main_model: Arc<dyn LlmProvider>,
    callback: Arc<CallbackState>,
    /// The kernel namespace is shared; one run at a time.
    run_lock: tokio::sync::Mutex<()>,
}

impl SubAgentRunner {
    pub fn new(
        config: Arc<Config>,
        manager: KernelManager,
        main_model: Arc<dyn LlmProvider>,
        callback: Arc<CallbackState>,
    ) -> Self {
        Self {
            config,
            manager,
            main_model,
            callback,
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Run a signature to completion or to a limit.
    pub async fn run(
        &self,
        signature_ref: &str,
        inputs: &serde_json::Value,
        overrides: LimitOverrides,
    ) -> Result<SubAgentRun, SubAgentFailure> {
        // Malformed signatures and inputs are rejected before the loop.
        let signature = resolve_signature(signature_ref).map_err(|error| SubAgentFailure {
            error,
            trajectory: Vec::new(),
            iterations: 0,
        })?;
        let inputs_map = inputs.as_object().ok_or_else(|| SubAgentFailure {
            error: ToolError::validation("inputs must be a JSON object"),
            trajectory: Vec::new(),
            iterations: 0,
        })?;
        for field in &signature.input_fields {
            if !inputs_map.contains_key(field) {
                return Err(SubAgentFailure {
                    error: ToolError::validation(format!("inputs is missing field '{field}'")),
                    trajectory: Vec::new(),
                    iterations: 0,
                });
            }
        }

        let max_iterations = overrides
            .max_iterations
            .unwrap_or(self.config.subagent.max_iterations);
        let max_llm_calls = overrides
            .max_llm_calls
            .unwrap_or(self.config.subagent.max_llm_calls);
        let max_output_chars = overrides
            .max_output_chars
            .unwrap_or(self.config.subagent.max_output_chars);

        let _run = self.run_lock.lock().await;
        let usage_before = self.callback.usage();

        let mut trajectory: Vec<TrajectoryTurn> = Vec::new();
        let mut main_calls: u64 = 0;
        let mut feedback: Option<String> = None;
        let mut iterations = 0;

        loop {
            if iterations >= max_iterations {
                return Err(self.limit_failure(
                    format!("The run exhausted max_iterations ({max_iterations})."),
                    trajectory,
                    iterations,
                ));
            }
            iterations += 1;

            let sub_calls = self.callback.usage().calls.saturating_sub(usage_before.calls);
            if main_calls + sub_calls >= max_llm_calls {
                return Err(self.limit_failure(
                    format!("The run exhausted max_llm_calls ({max_llm_calls})."),
                    trajectory,
                    iterations,
                ));
            }

            let prompt = render_prompt(&signature, inputs, &trajectory, feedback.take());
            main_calls += 1;
            let reply = match self.main_model.complete(&prompt).await {
                Ok(completion) => completion.text,
                Err(err) => {
                    let error = ToolError::from(err);
                    // Rate limits terminate without retry; the caller decides.
                    return Err(SubAgentFailure {
                        error,
                        trajectory,
                        iterations,
                    });
                }
            };
            trajectory.push(TrajectoryTurn::ModelCall {
                reply: reply.clone(),
            });

            match parse_model_reply(&reply) {
                ModelAction::Submit(outputs) => {
                    match validate_submission(&signature, &outputs) {
                        Ok(()) => {
                            trajectory.push(TrajectoryTurn::Submission {
                                outputs: outputs.clone(),
                            });
                            let usage = self.callback.usage().diff(&usage_before);
                            return Ok(SubAgentRun {
                                outputs,
                                trajectory,
                                iterations,
                                usage,
                            });
                        }
                        Err(message) => feedback = Some(message),
                    }
                }
                ModelAction::Execute(code) => {
                    trajectory.push(TrajectoryTurn::KernelExecution { code: code.clone() });
                    let timeout = self.config.kernel.exec_timeout_secs;
                    match self.manager.execute(&code, timeout).await {
                        Ok(outcome) => trajectory.push(TrajectoryTurn::KernelOutput {
                            stdout: truncate(&outcome.stdout, max_output_chars),
                            stderr: truncate(&outcome.stderr, max_output_chars),
                        }),
                        // Runtime errors feed the trajectory for the model
                        // to react to; the loop goes on.
                        Err(KernelError::Runtime(traceback)) => {
                            trajectory.push(TrajectoryTurn::KernelOutput {
                                stdout: String::new(),
                                stderr: truncate(&traceback, max_output_chars),
                            })
                        }
                        Err(KernelError::Timeout(secs)) => {
                            trajectory.push(TrajectoryTurn::KernelOutput {
                                stdout: String::new(),
                                stderr: format!("execution timed out after {secs}s"),
                            })
                        }
                        Err(err) => {
                            return Err(SubAgentFailure {
                                error: err.to_tool_error(),
                                trajectory,
                                iterations,
                            })
                        }
                    }
                }
                ModelAction::Unparseable => {
                    feedback = Some(
                        "Reply with either a fenced code block or {\"submit\": {...}}."
                            .to_string(),
                    );
                }
            }
        }
    }

    fn limit_failure(
        &self,
        message: String,
        trajectory: Vec<TrajectoryTurn>,
        iterations: usize,
    ) -> SubAgentFailure {
        SubAgentFailure {
            error: ToolError::new(ErrorKind::SandboxLimit, message),
            trajectory,
            iterations,
        }
    }
}

// ============ Model protocol ============

enum ModelAction {
    Execute(String),
    Submit(serde_json::Value),
    Unparseable,
}

fn parse_model_reply(reply: &str) -> ModelAction {
    if let Some(code) = extract_fenced_block(reply) {
        return ModelAction::Execute(code);
    }

    let trimmed = reply.trim();
    if trimmed.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
            if let Some(submit) = value.get("submit") {
                return ModelAction::Submit(submit.clone());
            }
        }
    }
    ModelAction::Unparseable
}

fn extract_fenced_block(reply: &str) -> Option<String> {
    let open = reply.find("```")?;
    let after_fence = &reply[open + 3..];
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let close = body.find("```")?;
    let code = body[..close].trim_end();
    if code.trim().is_empty() {
        None
    } else {
        Some(code.to_string())
    }
}

fn validate_submission(
    signature: &SignatureSpec,
    outputs: &serde_json::Value,
) -> Result<(), String> {
    let map = match outputs.as_object() {
        Some(map) => map,
        None => return Err("The submission must be a JSON object.".to_string()),
    };
    for field in &signature.output_fields {
        if !map.contains_key(&field.name) {
            return Err(format!("The submission is missing field '{}'.", field.name));
        }
    }
    Ok(())
}

fn render_prompt(
    signature: &SignatureSpec,
    inputs: &serde_json::Value,
    trajectory: &[TrajectoryTurn],
    feedback: Option<String>,
) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "You drive a code kernel with persistent variables. Helper functions are \
         already defined: llm_query(prompt), llm_query_batch(prompts), and the \
         host tools ",
    );
    prompt.push_str(&SANDBOX_TOOLS.join(", "));
    prompt.push_str(
        ".\nAnswer with EITHER one fenced code block to execute, OR a JSON object \
         {\"submit\": {...}} carrying the output fields.\n\n",
    );

    if !signature.instructions.is_empty() {
        prompt.push_str("Task: ");
        prompt.push_str(&signature.instructions);
        prompt.push_str("\n\n");
    }

    prompt.push_str(&format!(
        "Input fields: {}\nOutput fields: {}\n\nInputs:\n{}\n",
        signature.input_fields.join(", "),
        signature
            .output_fields
            .iter()
            .map(|f| match &f.type_hint {
                Some(hint) => format!("{}: {}", f.name, hint),
                None => f.name.clone(),
            })
            .collect::<Vec<_>>()
            .join(", "),
        serde_json::to_string_pretty(inputs).unwrap_or_else(|_| "{}".to_string()),
    ));

    if !trajectory.is_empty() {
        prompt.push_str("\nTrajectory so far:\n");
        for turn in trajectory {
            match turn {
                TrajectoryTurn::ModelCall { reply } => {
                    prompt.push_str(&format!("<assistant>\n{reply}\n"));
                }
                TrajectoryTurn::KernelExecution { code } => {
                    prompt.push_str(&format!("<executed>\n{code}\n"));
                }
                TrajectoryTurn::KernelOutput { stdout, stderr } => {
                    prompt.push_str(&format!("<output>\nstdout: {stdout}\nstderr: {stderr}\n"));
                }
                TrajectoryTurn::Submission { .. } => {}
            }
        }
    }

    if let Some(feedback) = feedback {
        prompt.push_str(&format!("\nCorrection: {feedback}\n"));
    }
    prompt
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}\n… [truncated]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_names_resolve() {
        for name in [
            "search",
            "extract",
            "classify",
            "summarize",
            "deep_reasoning",
            "deep_reasoning_multi",
        ] {
            let spec = resolve_signature(name).unwrap();
            assert_eq!(spec.name, name);
            assert!(!spec.instructions.is_empty());
        }
    }

    #[test]
    fn test_unknown_name_rejected() {
        let err = resolve_signature("no_such_signature").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn test_shorthand_parses_fields_and_hints() {
        let spec = resolve_signature("input_a, input_b -> output: list[str]").unwrap();
        assert_eq!(spec.input_fields, vec!["input_a", "input_b"]);
        assert_eq!(spec.output_fields.len(), 1);
        assert_eq!(spec.output_fields[0].name, "output");
        assert_eq!(spec.output_fields[0].type_hint.as_deref(), Some("list[str]"));
    }

    #[test]
    fn test_shorthand_rejects_duplicates_and_empties() {
        assert!(resolve_signature("a, a -> b: str").is_err());
        assert!(resolve_signature(" -> b: str").is_err());
        assert!(resolve_signature("a -> ").is_err());
    }

    #[test]
    fn test_deep_reasoning_has_three_phases() {
        let spec = resolve_signature("deep_reasoning").unwrap();
        for phase in ["Recon", "Filter", "Aggregate"] {
            assert!(spec.instructions.contains(phase), "missing phase {phase}");
        }
    }

    #[test]
    fn test_injection_source_covers_whitelist() {
        let source = helper_injection_source("http://127.0.0.1:9999");
        assert!(source.contains("http://127.0.0.1:9999"));
        assert!(!source.contains("__CALLBACK_URL__"));
        assert!(source.contains("def llm_query("));
        assert!(source.contains("max_workers=8"));
        for tool in SANDBOX_TOOLS {
            assert!(source.contains(&format!("{tool} = _sbx_tool(\"{tool}\")")));
        }
    }

    #[test]
    fn test_parse_fenced_block() {
        let reply = "Let me check.\n```python\nprint(1 + 1)\n```\nDone.";
        match parse_model_reply(reply) {
            ModelAction::Execute(code) => assert_eq!(code, "print(1 + 1)"),
            _ => panic!("expected execute action"),
        }
    }

    #[test]
    fn test_parse_submission() {
        let reply = r#"{"submit": {"sentiment": "positive"}}"#;
        match parse_model_reply(reply) {
            ModelAction::Submit(outputs) => {
                assert_eq!(outputs["sentiment"], "positive");
            }
            _ => panic!("expected submit action"),
        }
    }

    #[test]
    fn test_parse_garbage_is_unparseable() {
        assert!(matches!(
            parse_model_reply("I am not sure what to do."),
            ModelAction::Unparseable
        ));
        assert!(matches!(
            parse_model_reply("``````"),
            ModelAction::Unparseable
        ));
    }

    #[test]
    fn test_submission_validation() {
        let spec = resolve_signature("text -> sentiment: str").unwrap();
        assert!(validate_submission(&spec, &serde_json::json!({"sentiment": "ok"})).is_ok());
        assert!(validate_submission(&spec, &serde_json::json!({"other": 1})).is_err());
        assert!(validate_submission(&spec, &serde_json::json!("nope")).is_err());
    }

    #[test]
    fn test_truncate_marks_cut() {
        let long = "x".repeat(50);
        let cut = truncate(&long, 10);
        assert!(cut.starts_with("xxxxxxxxxx"));
        assert!(cut.ends_with("[truncated]"));
        assert_eq!(truncate("short", 10), "short");
    }
}
