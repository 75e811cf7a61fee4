use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::{parse_arguments, ChatRequest, ChatResponse, Provider, ToolCallRequest};

const DEFAULT_API_BASE: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
const API_VERSION: &str = "2023-06-01";

/// Provider speaking the Anthropic Messages API: the system prompt is lifted
/// out, tool calls become `tool_use` content blocks, tool results become
/// user messages with `tool_result` blocks, and consecutive same-role
/// messages are merged.
pub struct AnthropicProvider {
    api_key: String,
    api_base: String,
    default_model: String,
    extra_headers: HashMap<String, String>,
    client: reqwest::Client,
}

impl AnthropicProvider {
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
impl Provider for AnthropicProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let model = if req.model.is_empty() {
            &self.default_model
        } else {
            &req.model
        };
        let max_tokens = if req.max_tokens == 0 { 4096 } else { req.max_tokens };

        let (system, messages) = convert_messages(&req.messages);

        let mut body = serde_json::json!({
            "model": model,
            "max_tokens": max_tokens,
            "messages": messages,
        });
        if !system.is_empty() {
            body["system"] = serde_json::Value::String(system);
        }
        if !req.tools.is_empty() {
            body["tools"] = serde_json::Value::Array(convert_tools(&req.tools));
            body["tool_choice"] = serde_json::json!({"type": "auto"});
        }

        let url = format!("{}/v1/messages", self.api_base);
        let mut request = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body);
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

/// Lift the system prompt out and convert OpenAI-shaped messages to
/// Anthropic content-block messages.
fn convert_messages(msgs: &[serde_json::Value]) -> (String, Vec<serde_json::Value>) {
    let mut system = String::new();
    let mut result: Vec<serde_json::Value> = Vec::new();

    for msg in msgs {
        let role = msg.get("role").and_then(|r| r.as_str()).unwrap_or("");

        match role {
            "system" => {
                if let Some(content) = msg.get("content").and_then(|c| c.as_str()) {
                    if !system.is_empty() {
                        system.push_str("\n\n");
                    }
                    system.push_str(content);
                }
            }
            "assistant" => result.push(convert_assistant_message(msg)),
            "tool" => {
                let tool_result = serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": msg.get("tool_call_id").cloned().unwrap_or_default(),
                    "content": msg.get("content").cloned().unwrap_or_default(),
                });
                // Merge consecutive tool results into one user message.
                if let Some(prev) = result.last_mut() {
                    if prev.get("role").and_then(|r| r.as_str()) == Some("user") {
                        if let Some(blocks) =
                            prev.get_mut("content").and_then(|c| c.as_array_mut())
                        {
                            blocks.push(tool_result);
                            continue;
                        }
                    }
                }
                result.push(serde_json::json!({
                    "role": "user",
                    "content": [tool_result],
                }));
            }
            "user" => {
                result.push(serde_json::json!({
                    "role": "user",
                    "content": msg.get("content").cloned().unwrap_or_default(),
                }));
            }
            _ => {}
        }
    }

    (system, merge_consecutive_roles(result))
}

/// Convert an assistant message (optionally with `tool_calls`) to
/// Anthropic content blocks.
fn convert_assistant_message(msg: &serde_json::Value) -> serde_json::Value {
    let mut blocks: Vec<serde_json::Value> = Vec::new();

    if let Some(content) = msg.get("content").and_then(|c| c.as_str()) {
        if !content.is_empty() {
            blocks.push(serde_json::json!({"type": "text", "text": content}));
        }
    }

    if let Some(tool_calls) = msg.get("tool_calls").and_then(|tc| tc.as_array()) {
        for tc in tool_calls {
            let function = tc.get("function").cloned().unwrap_or_default();
            let name = function.get("name").and_then(|n| n.as_str()).unwrap_or("");
            let args_str = function
                .get("arguments")
                .and_then(|a| a.as_str())
                .unwrap_or("");
            blocks.push(serde_json::json!({
                "type": "tool_use",
                "id": tc.get("id").cloned().unwrap_or_default(),
                "name": name,
                "input": parse_arguments(args_str),
            }));
        }
    }

    if blocks.is_empty() {
        blocks.push(serde_json::json!({"type": "text", "text": ""}));
    }

    serde_json::json!({"role": "assistant", "content": blocks})
}

/// Convert OpenAI function descriptors to Anthropic tool descriptors.
fn convert_tools(tools: &[serde_json::Value]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .filter_map(|t| t.get("function"))
        .map(|f| {
            serde_json::json!({
                "name": f.get("name").cloned().unwrap_or_default(),
                "description": f.get("description").cloned().unwrap_or_default(),
                "input_schema": f.get("parameters").cloned().unwrap_or_default(),
            })
        })
        .collect()
}

/// The Messages API requires alternating user/assistant turns; merge
/// consecutive same-role messages into one block list.
fn merge_consecutive_roles(msgs: Vec<serde_json::Value>) -> Vec<serde_json::Value> {
    let mut result: Vec<serde_json::Value> = Vec::new();

    for msg in msgs {
        let role = msg.get("role").and_then(|r| r.as_str()).unwrap_or("");
        let same_role = result
            .last()
            .and_then(|prev| prev.get("role"))
            .and_then(|r| r.as_str())
            == Some(role);

        if same_role {
            let prev = result.last_mut().unwrap();
            let mut merged = to_content_blocks(prev.get("content"));
            merged.extend(to_content_blocks(msg.get("content")));
            prev["content"] = serde_json::Value::Array(merged);
        } else {
            result.push(msg);
        }
    }

    result
}

fn to_content_blocks(content: Option<&serde_json::Value>) -> Vec<serde_json::Value> {
    match content {
        Some(serde_json::Value::Array(blocks)) => blocks.clone(),
        Some(serde_json::Value::String(text)) => {
            vec![serde_json::json!({"type": "text", "text": text})]
        }
        _ => Vec::new(),
    }
}

#[derive(Deserialize)]
struct RawResponse {
    #[serde(default)]
    content: Vec<RawBlock>,
    #[serde(default)]
    stop_reason: String,
    #[serde(default)]
    usage: Option<RawUsage>,
    #[serde(default)]
    error: Option<RawError>,
}

#[derive(Deserialize)]
struct RawBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    input: serde_json::Value,
}

#[derive(Deserialize)]
struct RawUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
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

    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls = Vec::new();
    for block in raw.content {
        match block.block_type.as_str() {
            "text" => {
                if !block.text.is_empty() {
                    text_parts.push(block.text);
                }
            }
            "tool_use" => {
                let arguments = if block.input.is_object() {
                    block.input
                } else {
                    serde_json::json!({ "raw": block.input.to_string() })
                };
                tool_calls.push(ToolCallRequest {
                    id: block.id,
                    name: block.name,
                    arguments,
                });
            }
            _ => {}
        }
    }

    let mut usage = HashMap::new();
    if let Some(u) = raw.usage {
        usage.insert("prompt_tokens".into(), u.input_tokens);
        usage.insert("completion_tokens".into(), u.output_tokens);
        usage.insert("total_tokens".into(), u.input_tokens + u.output_tokens);
    }

    // Map the Messages API stop_reason onto the finish_reason vocabulary.
    let finish_reason = match raw.stop_reason.as_str() {
        "end_turn" => "stop".to_string(),
        "tool_use" => "tool_calls".to_string(),
        other => other.to_string(),
    };

    Ok(ChatResponse {
        content: text_parts.join("\n"),
        tool_calls,
        finish_reason,
        reasoning_content: None,
        usage,
    })
}
