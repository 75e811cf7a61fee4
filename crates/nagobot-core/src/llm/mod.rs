pub mod anthropic;
pub mod openai;

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;

/// A tool call requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Response from an LLM chat completion.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub finish_reason: String,
    pub reasoning_content: Option<String>,
    pub usage: HashMap<String, u64>,
}

impl ChatResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Parameters for an LLM chat request. Messages use the OpenAI wire shape
/// (`role` + `content`, assistant entries may carry `tool_calls`, tool
/// entries carry `tool_call_id` and `name`).
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<serde_json::Value>,
    pub tools: Vec<serde_json::Value>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

/// Interface to an LLM service. One operation; transport-specific adapters
/// live in this module.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse>;
    fn default_model(&self) -> &str;
}

/// Decode a tool-call arguments string, wrapping unparseable input as
/// `{"raw": <string>}` so the tool can explain the malformation to the model.
pub(crate) fn parse_arguments(raw: &str) -> serde_json::Value {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(v) if v.is_object() => v,
        _ => serde_json::json!({ "raw": raw }),
    }
}

/// Wrap `provider.chat` with retries for transient failures: up to 2 retries
/// with linear 2s × attempt backoff. Both the backoff wait and the call
/// itself are pre-empted by cancellation.
pub async fn chat_with_retry(
    provider: &dyn Provider,
    req: &ChatRequest,
    token: &CancellationToken,
) -> Result<ChatResponse> {
    const MAX_RETRIES: u32 = 2;
    let mut last_err = None;

    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            let delay = Duration::from_secs(2 * attempt as u64);
            warn!(
                "LLM call failed, retrying (attempt {attempt}): {}",
                last_err.as_ref().map(|e: &anyhow::Error| e.to_string()).unwrap_or_default()
            );
            tokio::select! {
                _ = token.cancelled() => anyhow::bail!("interrupted"),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let result = tokio::select! {
            _ = token.cancelled() => anyhow::bail!("interrupted"),
            r = provider.chat(req) => r,
        };
        match result {
            Ok(resp) => return Ok(resp),
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("LLM call failed")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyProvider {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl Provider for FlakyProvider {
        async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                anyhow::bail!("transient");
            }
            Ok(ChatResponse {
                content: "ok".into(),
                finish_reason: "stop".into(),
                ..Default::default()
            })
        }

        fn default_model(&self) -> &str {
            "mock"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_from_transient_failures() {
        let provider = FlakyProvider {
            calls: AtomicUsize::new(0),
            fail_first: 2,
        };
        let token = CancellationToken::new();
        let resp = chat_with_retry(&provider, &ChatRequest::default(), &token)
            .await
            .unwrap();
        assert_eq!(resp.content, "ok");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_two_retries() {
        let provider = FlakyProvider {
            calls: AtomicUsize::new(0),
            fail_first: 10,
        };
        let token = CancellationToken::new();
        let err = chat_with_retry(&provider, &ChatRequest::default(), &token)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("transient"));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_backoff_is_preempted_by_cancellation() {
        let provider = FlakyProvider {
            calls: AtomicUsize::new(0),
            fail_first: 10,
        };
        let token = CancellationToken::new();
        token.cancel();
        let err = chat_with_retry(&provider, &ChatRequest::default(), &token)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("interrupted"));
    }

    #[test]
    fn malformed_arguments_become_raw_wrapper() {
        let parsed = parse_arguments("{not json");
        assert_eq!(parsed["raw"], "{not json");

        let parsed = parse_arguments("{\"path\": \"/tmp/x\"}");
        assert_eq!(parsed["path"], "/tmp/x");
    }
}
