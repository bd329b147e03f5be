//! Language-model providers.
//!
//! Two roles share one abstraction: the **main model** that drives sub-agent
//! loops and the **sub-model** answering `llm_query` callbacks from the
//! kernel. Both are [`LlmProvider`] trait objects so tests can substitute a
//! scripted provider and run the full loop without network access.
//!
//! The HTTP implementation targets an OpenAI-compatible chat-completions
//! endpoint. The credential is read from `SANDBOX_LLM_API_KEY` per request
//! and never stored or written to any artifact.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::{LlmConfig, LLM_API_KEY_ENV};
use crate::error::{ErrorKind, ToolError};

/// One model completion with the usage the API reported.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A chat-completion backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Model identifier recorded in the usage ledger.
    fn model_name(&self) -> &str;

    /// Complete a single-prompt conversation.
    ///
    /// Rate limits surface as a [`ToolError`] with
    /// [`ErrorKind::RateLimited`] inside the `anyhow` chain; callers decide
    /// whether to retry (the harness never does).
    async fn complete(&self, prompt: &str) -> Result<Completion>;
}

// ============ HTTP provider ============

/// OpenAI-compatible chat client used for both model roles.
pub struct ChatClient {
    base_url: String,
    model: String,
    max_tokens: u32,
    timeout: Duration,
    http: reqwest::Client,
}

impl ChatClient {
    /// Client for the main (loop-driving) model.
    pub fn main_model(config: &LlmConfig, http: reqwest::Client) -> Self {
        Self::new(config, &config.main_model, http)
    }

    /// Client for the sub-model behind `/llm_query`.
    pub fn sub_model(config: &LlmConfig, http: reqwest::Client) -> Self {
        Self::new(config, &config.sub_model, http)
    }

    fn new(config: &LlmConfig, model: &str, http: reqwest::Client) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            max_tokens: config.max_tokens,
            timeout: Duration::from_secs(config.timeout_secs),
            http,
        }
    }
}

#[async_trait]
impl LlmProvider for ChatClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<Completion> {
        let api_key = std::env::var(LLM_API_KEY_ENV)
            .map_err(|_| ToolError::unavailable(format!("{LLM_API_KEY_ENV} is not set.")))?;

        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(self.timeout)
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    anyhow::Error::from(ToolError::timeout("The model call timed out."))
                } else {
                    anyhow::Error::from(ToolError::transport(format!(
                        "The model endpoint was unreachable: {err}."
                    )))
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            bail!(ToolError::new(
                ErrorKind::RateLimited,
                "The model refused the call with a rate limit."
            ));
        }
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Model API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        let text = json
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("Invalid model response: missing message content"))?
            .to_string();

        let input_tokens = json
            .pointer("/usage/prompt_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let output_tokens = json
            .pointer("/usage/completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        Ok(Completion {
            text,
            model: self.model.clone(),
            input_tokens,
            output_tokens,
        })
    }
}

// ============ Scripted provider ============

/// Deterministic provider replaying a fixed list of replies.
///
/// Used throughout the test suite to drive sub-agent loops and `ask`
/// synthesis without a network. Replies are consumed in order; running out
/// is an error so tests fail loudly on unexpected extra calls.
pub struct ScriptedProvider {
    name: String,
    replies: Mutex<VecDeque<String>>,
    tokens_per_call: u64,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>, replies: Vec<String>) -> Self {
        Self {
            name: name.into(),
            replies: Mutex::new(replies.into()),
            tokens_per_call: 10,
        }
    }

    /// Remaining unconsumed replies.
    pub fn remaining(&self) -> usize {
        self.replies.lock().expect("scripted provider lock").len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn model_name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, _prompt: &str) -> Result<Completion> {
        let reply = self
            .replies
            .lock()
            .expect("scripted provider lock")
            .pop_front();
        match reply {
            Some(text) => Ok(Completion {
                text,
                model: self.name.clone(),
                input_tokens: self.tokens_per_call,
                output_tokens: self.tokens_per_call,
            }),
            None => bail!("Scripted provider '{}' ran out of replies", self.name),
        }
    }
}

/// Provider that always reports a rate limit, for failure-path tests.
pub struct RateLimitedProvider;

#[async_trait]
impl LlmProvider for RateLimitedProvider {
    fn model_name(&self) -> &str {
        "rate-limited"
    }

    async fn complete(&self, _prompt: &str) -> Result<Completion> {
        bail!(ToolError::new(
            ErrorKind::RateLimited,
            "The model refused the call with a rate limit."
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_provider_replays_in_order() {
        let provider = ScriptedProvider::new("test", vec!["one".into(), "two".into()]);
        assert_eq!(provider.complete("x").await.unwrap().text, "one");
        assert_eq!(provider.complete("x").await.unwrap().text, "two");
        assert!(provider.complete("x").await.is_err());
    }

    #[tokio::test]
    async fn test_rate_limited_provider_kind() {
        let err = RateLimitedProvider.complete("x").await.unwrap_err();
        let tool_err = err.downcast_ref::<ToolError>().unwrap();
        assert_eq!(tool_err.kind, ErrorKind::RateLimited);
    }
}
