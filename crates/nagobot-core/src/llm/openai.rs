use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::{parse_arguments, ChatRequest, ChatResponse, Provider, ToolCallRequest};

const DEFAULT_API_BASE: &str = "https://openrouter.ai/api/v1";
const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4-5";

/// Provider speaking the OpenAI chat-completions wire format. Works with
/// OpenRouter, DeepSeek, vLLM, llama.cpp and other compatible servers.
pub struct OpenAiProvider {
    api_key: String,
    api_base: String,
    default_model: String,
    extra_headers: HashMap<String, String>,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(
        api_key: &str,
        api_base: Option<&str>,
        default_model: Option<&str>,
        extra_headers: HashMap<String, String>,
    ) -> Self {
        Self {
            api_key: api_key.to_string(),
            api_base: api_base
                .filter(|b| !b.is_empty())
                .unwrap_or(DEFAULT_API_BASE)
                .trim_end_matches('/')
                .to_string(),
            default_model: default_model
                .filter(|m| !m.is_empty())
                .unwrap_or(DEFAULT_MODEL)
                .to_string(),
            extra_headers,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let model = if req.model.is_empty() {
            &self.default_model
        } else {
            &req.model
        };
        let max_tokens = if req.max_tokens == 0 { 4096 } else { req.max_tokens };
        let temperature = if req.temperature == 0.0 { 0.7 } else { req.temperature };

        let mut body = serde_json::json!({
            "model": model,
            "messages": req.messages,
            "max_tokens": max_tokens,
            "temperature": temperature,
        });
        if !req.tools.is_empty() {
            body["tools"] = serde_json::Value::Array(req.tools.clone());
            body["tool_choice"] = serde_json::Value::String("auto".into());
        }

        let url = format!("{}/chat/completions", self.api_base);
        let mut request = self.client.post(&url).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        for (k, v) in &self.extra_headers {
            request = request.header(k, v);
        }

        let resp = request.send().await.context("http request")?;
        let status = resp.status();
        let text = resp.text().await.context("read response")?;

        if !status.is_success() {
            return Ok(ChatResponse {
                content: format!("Error calling LLM (HTTP {}): {text}", status.as_u16()),
                finish_reason: "error".into(),
                ..Default::default()
            });
        }

        parse_response(&text)
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}

#[derive(Deserialize)]
struct RawResponse {
    #[serde(default)]
    choices: Vec<RawChoice>,
    #[serde(default)]
    usage: Option<RawUsage>,
    #[serde(default)]
    error: Option<RawError>,
}

#[derive(Deserialize)]
struct RawChoice {
    message: RawMessage,
    #[serde(default)]
    finish_reason: String,
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<RawToolCall>,
}

#[derive(Deserialize)]
struct RawToolCall {
    id: String,
    function: RawFunction,
}

#[derive(Deserialize)]
struct RawFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize)]
struct RawUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

#[derive(Deserialize)]
struct RawError {
    message: String,
}

fn parse_response(data: &str) -> Result<ChatResponse> {
    let raw: RawResponse = serde_json::from_str(data).context("parse response")?;

    if let Some(err) = raw.error {
        return Ok(ChatResponse {
            content: format!("Error calling LLM: {}", err.message),
            finish_reason: "error".into(),
            ..Default::default()
        });
    }

    let Some(choice) = raw.choices.into_iter().next() else {
        return Ok(ChatResponse {
            content: "Error: no choices in LLM response".into(),
            finish_reason: "error".into(),
            ..Default::default()
        });
    };

    let mut usage = HashMap::new();
    if let Some(u) = raw.usage {
        usage.insert("prompt_tokens".into(), u.prompt_tokens);
        usage.insert("completion_tokens".into(), u.completion_tokens);
        usage.insert("total_tokens".into(), u.total_tokens);
    }

    let tool_calls = choice
        .message
        .tool_calls
        .into_iter()
        .map(|tc| ToolCallRequest {
            id: tc.id,
            name: tc.function.name,
            arguments: parse_arguments(&tc.function.arguments),
        })
        .collect();

    Ok(ChatResponse {
        content: choice.message.content.unwrap_or_default(),
        tool_calls,
        finish_reason: choice.finish_reason,
        reasoning_content: choice
            .message
            .reasoning_content
            .filter(|r| !r.is_empty()),
        usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_response() {
        let data = r#"{
            "choices": [{"message": {"content": "hello"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 2, "total_tokens": 12}
        }"#;
        let resp = parse_response(data).unwrap();
        assert_eq!(resp.content, "hello");
        assert_eq!(resp.finish_reason, "stop");
        assert!(!resp.has_tool_calls());
        assert_eq!(resp.usage["total_tokens"], 12);
    }

    #[test]
    fn parses_tool_calls_with_arguments() {
        let data = r#"{
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "read_file", "arguments": "{\"path\": \"/tmp/x\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        }"#;
        let resp = parse_response(data).unwrap();
        assert!(resp.has_tool_calls());
        assert_eq!(resp.tool_calls[0].id, "call_1");
        assert_eq!(resp.tool_calls[0].name, "read_file");
        assert_eq!(resp.tool_calls[0].arguments["path"], "/tmp/x");
    }

    #[test]
    fn malformed_tool_arguments_are_wrapped_raw() {
        let data = r#"{
            "choices": [{
                "message": {
                    "tool_calls": [{
                        "id": "call_1",
                        "function": {"name": "exec", "arguments": "oops{"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        }"#;
        let resp = parse_response(data).unwrap();
        assert_eq!(resp.tool_calls[0].arguments["raw"], "oops{");
    }

    #[test]
    fn api_error_body_maps_to_error_finish_reason() {
        let data = r#"{"error": {"message": "rate limited"}}"#;
        let resp = parse_response(data).unwrap();
        assert_eq!(resp.finish_reason, "error");
        assert!(resp.content.contains("rate limited"));
    }

    #[test]
    fn empty_choices_is_an_error_response() {
        let resp = parse_response(r#"{"choices": []}"#).unwrap();
        assert_eq!(resp.finish_reason, "error");
    }
}
