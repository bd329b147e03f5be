//! Normalized error taxonomy shared by every tool.
//!
//! Lower layers surface the most specific [`ErrorKind`]; the tool surface
//! wraps anything uncategorized as [`ErrorKind::Internal`] with a generic
//! message so stack traces never cross the client boundary. The fetcher
//! returns these as values instead of raising (see [`crate::fetch`]).

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

/// Machine-readable failure category carried by every tool error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Arguments failed schema or semantic validation.
    Validation,
    /// The addressed document, variable, or resource does not exist.
    NotFound,
    /// The hostname is on the fetch blocklist.
    Blocked,
    /// A deadline expired before the operation completed.
    Timeout,
    /// The HTTP layer failed (connection refused, reset, DNS).
    Transport,
    /// Code executed in the kernel raised; the traceback is the message.
    KernelRuntime,
    /// A sub-agent run exhausted one of its configured limits.
    SandboxLimit,
    /// The sub-language-model refused the call with a rate limit.
    RateLimited,
    /// A required collaborator (kernel, container runtime) is not up.
    Unavailable,
    /// Concurrent access rules were violated (second writer on a project).
    Conflict,
    /// Anything the layers above could not categorize.
    Internal,
}

impl ErrorKind {
    /// Stable wire name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Blocked => "blocked",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Transport => "transport",
            ErrorKind::KernelRuntime => "kernel_runtime",
            ErrorKind::SandboxLimit => "sandbox_limit",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Internal => "internal",
        }
    }

    /// HTTP status the tool server answers with for this kind.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Blocked => StatusCode::FORBIDDEN,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Transport => StatusCode::BAD_GATEWAY,
            ErrorKind::KernelRuntime => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::SandboxLimit => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A categorized, user-visible failure.
///
/// The message is a single sentence; the kind is what clients branch on.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct ToolError {
    #[serde(rename = "error_kind")]
    pub kind: ErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn blocked(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Blocked, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    pub fn kernel_runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::KernelRuntime, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Wrap any uncategorized error as `internal` with a generic message.
    ///
    /// The original error is logged, never forwarded.
    pub fn from_uncaught(err: &anyhow::Error) -> Self {
        tracing::error!(error = %err, "uncaught error at tool boundary");
        Self::internal("The operation failed unexpectedly.")
    }
}

/// Convenience alias used by tool handlers.
pub type ToolResult<T> = std::result::Result<T, ToolError>;

impl From<anyhow::Error> for ToolError {
    fn from(err: anyhow::Error) -> Self {
        // Preserve an already-categorized error instead of re-wrapping it.
        match err.downcast::<ToolError>() {
            Ok(tool_err) => tool_err,
            Err(other) => ToolError::from_uncaught(&other),
        }
    }
}

impl From<sqlx::Error> for ToolError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!(error = %err, "storage error");
        ToolError::internal("The knowledge store operation failed.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names_are_snake_case() {
        assert_eq!(ErrorKind::KernelRuntime.as_str(), "kernel_runtime");
        assert_eq!(ErrorKind::SandboxLimit.as_str(), "sandbox_limit");
        let json = serde_json::to_string(&ErrorKind::RateLimited).unwrap();
        assert_eq!(json, "\"rate_limited\"");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrorKind::Validation.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorKind::Blocked.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            ErrorKind::Internal.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_downcast_preserves_kind() {
        let original = ToolError::blocked("host is refused");
        let through_anyhow: anyhow::Error = original.into();
        let back: ToolError = through_anyhow.into();
        assert_eq!(back.kind, ErrorKind::Blocked);
        assert_eq!(back.message, "host is refused");
    }

    #[test]
    fn test_uncaught_is_generic() {
        let err = anyhow::anyhow!("secret internal detail");
        let tool_err: ToolError = err.into();
        assert_eq!(tool_err.kind, ErrorKind::Internal);
        assert!(!tool_err.message.contains("secret"));
    }
}
