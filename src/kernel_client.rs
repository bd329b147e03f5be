//! Typed HTTP client for the remote code kernel.
//!
//! The kernel is an external process that executes caller code and retains
//! variable state between calls. Only its HTTP surface is assumed:
//!
//! | Method | Path | Body → Response |
//! |--------|------|-----------------|
//! | `POST` | `/exec` | `{code, timeout?}` → `{output, stderr, vars}` |
//! | `GET`  | `/vars` | → `[{name, type, summary}]` |
//! | `GET`  | `/var/{name}` | → `{value}` |
//! | `POST` | `/reset` | → `{status}` |
//! | `POST` | `/snapshot/save` | → binary body |
//! | `POST` | `/snapshot/restore` | binary body → `{restored, skipped}` |
//! | `GET`  | `/health` | → `{status: "ok"}` |
//!
//! Timeouts are layered: the per-request HTTP timeout stays strictly above
//! the kernel's own execution timeout, so an overdue execution produces a
//! structured timeout from the kernel instead of a torn connection.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{ErrorKind, ToolError};

/// Failure taxonomy of one kernel call.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// The HTTP layer failed; retryable by the caller.
    #[error("kernel transport error: {0}")]
    Transport(String),
    /// The execution exceeded its deadline.
    #[error("kernel execution timed out after {0}s")]
    Timeout(u64),
    /// Caller code raised inside the kernel; returned verbatim.
    #[error("{0}")]
    Runtime(String),
    /// The kernel answered with an unexpected body; fatal for the call.
    #[error("kernel protocol error: {0}")]
    Protocol(String),
    /// The kernel reported busy; fatal for the call.
    #[error("kernel is overloaded")]
    Overload,
}

impl KernelError {
    /// Transport errors are the only retryable category.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KernelError::Transport(_))
    }

    pub fn to_tool_error(&self) -> ToolError {
        match self {
            KernelError::Transport(msg) => ToolError::transport(msg.clone()),
            KernelError::Timeout(secs) => {
                ToolError::timeout(format!("The kernel execution timed out after {secs}s."))
            }
            KernelError::Runtime(traceback) => ToolError::kernel_runtime(traceback.clone()),
            KernelError::Protocol(msg) => {
                ToolError::new(ErrorKind::Internal, format!("Kernel protocol error: {msg}."))
            }
            KernelError::Overload => {
                ToolError::unavailable("The kernel is busy with another execution.")
            }
        }
    }
}

/// Result of one `/exec` round trip.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    /// Names present in the kernel namespace after the execution.
    pub variables: Vec<String>,
}

/// A variable summary from `/vars`.
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct VarInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub summary: String,
}

/// Names affected by a snapshot restore.
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct RestoreOutcome {
    pub restored: Vec<String>,
    /// Exactly the names whose values failed serialization.
    pub skipped: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ExecResponse {
    #[serde(default)]
    output: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    vars: Vec<String>,
    /// Traceback when the execution raised.
    #[serde(default)]
    error: Option<String>,
    /// Set when the kernel aborted the execution at its own deadline.
    #[serde(default)]
    timed_out: bool,
}

/// Client over one kernel base URL. Cheap to clone.
#[derive(Clone)]
pub struct KernelClient {
    base_url: String,
    http: reqwest::Client,
    /// Margin the HTTP timeout keeps above the kernel execution timeout.
    http_margin: Duration,
}

impl KernelClient {
    pub fn new(base_url: impl Into<String>, http: reqwest::Client, http_margin: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            http_margin,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Execute code, retaining variables for subsequent calls.
    pub async fn execute(&self, code: &str, timeout_secs: u64) -> Result<ExecOutcome, KernelError> {
        let http_timeout = Duration::from_secs(timeout_secs) + self.http_margin;
        let response = self
            .http
            .post(format!("{}/exec", self.base_url))
            .timeout(http_timeout)
            .json(&serde_json::json!({ "code": code, "timeout": timeout_secs }))
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;

        let response = self.check_status(response)?;
        let body: ExecResponse = response
            .json()
            .await
            .map_err(|err| KernelError::Protocol(err.to_string()))?;

        if body.timed_out {
            return Err(KernelError::Timeout(timeout_secs));
        }
        if let Some(traceback) = body.error {
            return Err(KernelError::Runtime(traceback));
        }
        Ok(ExecOutcome {
            stdout: body.output,
            stderr: body.stderr,
            variables: body.vars,
        })
    }

    /// List variables in the kernel namespace.
    pub async fn list_variables(&self) -> Result<Vec<VarInfo>, KernelError> {
        let response = self
            .http
            .get(format!("{}/vars", self.base_url))
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;
        let response = self.check_status(response)?;
        response
            .json()
            .await
            .map_err(|err| KernelError::Protocol(err.to_string()))
    }

    /// Fetch one variable, optionally through an accessor expression.
    pub async fn get_variable(
        &self,
        name: &str,
        expression: Option<&str>,
    ) -> Result<serde_json::Value, KernelError> {
        let mut request = self.http.get(format!("{}/var/{}", self.base_url, name));
        if let Some(expr) = expression {
            request = request.query(&[("expr", expr)]);
        }
        let response = request
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;

        if response.status().as_u16() == 404 {
            return Err(KernelError::Runtime(format!(
                "name '{name}' is not defined"
            )));
        }
        let response = self.check_status(response)?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| KernelError::Protocol(err.to_string()))?;
        body.get("value")
            .cloned()
            .ok_or_else(|| KernelError::Protocol("missing 'value' field".to_string()))
    }

    /// Clear the kernel namespace.
    pub async fn reset(&self) -> Result<(), KernelError> {
        let response = self
            .http
            .post(format!("{}/reset", self.base_url))
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;
        self.check_status(response)?;
        Ok(())
    }

    /// Serialize the kernel namespace.
    pub async fn snapshot_save(&self) -> Result<Vec<u8>, KernelError> {
        let response = self
            .http
            .post(format!("{}/snapshot/save", self.base_url))
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;
        let response = self.check_status(response)?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| KernelError::Protocol(err.to_string()))?;
        Ok(bytes.to_vec())
    }

    /// Replace the kernel namespace from serialized bytes.
    ///
    /// Atomic on the kernel side: the namespace is fully replaced or left
    /// untouched; non-serializable names are reported in `skipped`.
    pub async fn snapshot_restore(&self, bytes: Vec<u8>) -> Result<RestoreOutcome, KernelError> {
        let response = self
            .http
            .post(format!("{}/snapshot/restore", self.base_url))
            .body(bytes)
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;
        let response = self.check_status(response)?;
        response
            .json()
            .await
            .map_err(|err| KernelError::Protocol(err.to_string()))
    }

    /// One health probe.
    pub async fn health(&self) -> Result<(), KernelError> {
        let response = self
            .http
            .get(format!("{}/health", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;
        let response = self.check_status(response)?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| KernelError::Protocol(err.to_string()))?;
        match body.get("status").and_then(|s| s.as_str()) {
            Some("ok") => Ok(()),
            other => Err(KernelError::Protocol(format!(
                "unexpected health status: {other:?}"
            ))),
        }
    }

    fn transport_error(&self, err: reqwest::Error) -> KernelError {
        if err.is_timeout() {
            // The margin above the kernel deadline was exceeded, so the
            // kernel itself is unresponsive, not just the execution slow.
            KernelError::Transport(format!("request to {} timed out", self.base_url))
        } else {
            KernelError::Transport(err.to_string())
        }
    }

    fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response, KernelError> {
        let status = response.status();
        if status.as_u16() == 503 {
            return Err(KernelError::Overload);
        }
        if !status.is_success() {
            return Err(KernelError::Protocol(format!("HTTP {status}")));
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_is_retryable() {
        assert!(KernelError::Transport("x".into()).is_retryable());
        assert!(!KernelError::Timeout(5).is_retryable());
        assert!(!KernelError::Runtime("x".into()).is_retryable());
        assert!(!KernelError::Overload.is_retryable());
    }

    #[test]
    fn test_tool_error_mapping() {
        assert_eq!(
            KernelError::Runtime("Traceback".into()).to_tool_error().kind,
            ErrorKind::KernelRuntime
        );
        assert_eq!(
            KernelError::Overload.to_tool_error().kind,
            ErrorKind::Unavailable
        );
        assert_eq!(
            KernelError::Timeout(3).to_tool_error().kind,
            ErrorKind::Timeout
        );
    }

    #[test]
    fn test_exec_response_parses_minimal_body() {
        let body: ExecResponse =
            serde_json::from_str(r#"{"output": "4\n", "stderr": "", "vars": ["x"]}"#).unwrap();
        assert_eq!(body.output, "4\n");
        assert_eq!(body.vars, vec!["x"]);
        assert!(body.error.is_none());
        assert!(!body.timed_out);
    }
}
