pub mod cron;
pub mod filesystem;
pub mod message;
pub mod shell;
pub mod spawn;
pub mod web;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Output of a tool execution: text for the model plus any file paths to
/// attach to the turn's final outbound message.
#[derive(Debug, Clone, Default)]
pub struct ToolResult {
    pub content: String,
    pub media: Vec<String>,
}

impl ToolResult {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            media: Vec::new(),
        }
    }
}

/// A tool callable by the LLM agent. The token is the turn's cancellation
/// context; long-running tools (`exec`, `web_fetch`) race their I/O
/// against it.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;
    async fn execute(
        &self,
        token: &CancellationToken,
        params: serde_json::Value,
    ) -> Result<ToolResult>;
}

/// Registry of available tools. Populated once at startup, read-only after.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Tool descriptors in the OpenAI function-calling shape.
    pub fn definitions(&self) -> Vec<serde_json::Value> {
        self.tools
            .values()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name(),
                        "description": t.description(),
                        "parameters": t.parameters_schema(),
                    }
                })
            })
            .collect()
    }

    /// Run a tool by name under the turn's cancellation context. Failures
    /// never propagate: unknown tools, parameter mismatches and execution
    /// errors all come back as a `ToolResult` the model can read and react
    /// to.
    pub async fn execute(
        &self,
        token: &CancellationToken,
        name: &str,
        params: serde_json::Value,
    ) -> ToolResult {
        let Some(tool) = self.tools.get(name) else {
            return ToolResult::text(format!("Error: Tool '{name}' not found"));
        };

        let errors = validate_params(&params, &tool.parameters_schema());
        if !errors.is_empty() {
            return ToolResult::text(format!(
                "Error: Invalid parameters for tool '{name}': {}",
                errors.join("; ")
            ));
        }

        match tool.execute(token, params).await {
            Ok(result) => result,
            Err(e) => {
                error!("Tool execution error in {name}: {e}");
                ToolResult::text(format!("Error executing {name}: {e}"))
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate tool parameters against a JSON schema, returning error strings.
fn validate_params(params: &serde_json::Value, schema: &serde_json::Value) -> Vec<String> {
    let mut errors = Vec::new();
    validate_value(params, schema, "", &mut errors);
    errors
}

fn validate_value(
    val: &serde_json::Value,
    schema: &serde_json::Value,
    path: &str,
    errors: &mut Vec<String>,
) {
    let display_path = if path.is_empty() { "root" } else { path };

    if let Some(expected_type) = schema.get("type").and_then(|t| t.as_str()) {
        let type_ok = match expected_type {
            "object" => val.is_object(),
            "array" => val.is_array(),
            "string" => val.is_string(),
            "integer" => val.is_i64() || val.is_u64(),
            "number" => val.is_number(),
            "boolean" => val.is_boolean(),
            "null" => val.is_null(),
            _ => true,
        };
        if !type_ok {
            errors.push(format!("{display_path}: expected type '{expected_type}'"));
            return;
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(|e| e.as_array()) {
        if !allowed.contains(val) {
            errors.push(format!("{display_path}: value not in allowed enum"));
        }
    }

    if let Some(n) = val.as_f64() {
        if let Some(min) = schema.get("minimum").and_then(|m| m.as_f64()) {
            if n < min {
                errors.push(format!("{display_path}: value {n} < minimum {min}"));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(|m| m.as_f64()) {
            if n > max {
                errors.push(format!("{display_path}: value {n} > maximum {max}"));
            }
        }
    }

    if let Some(obj) = val.as_object() {
        if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
            for req in required {
                if let Some(field) = req.as_str() {
                    if !obj.contains_key(field) {
                        let field_path = if path.is_empty() {
                            field.to_string()
                        } else {
                            format!("{path}.{field}")
                        };
                        errors.push(format!("{field_path}: required field missing"));
                    }
                }
            }
        }
        if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
            for (key, prop_schema) in props {
                if let Some(prop_val) = obj.get(key) {
                    let prop_path = if path.is_empty() {
                        key.clone()
                    } else {
                        format!("{path}.{key}")
                    };
                    validate_value(prop_val, prop_schema, &prop_path, errors);
                }
            }
        }
    }

    if let Some(arr) = val.as_array() {
        if let Some(items_schema) = schema.get("items") {
            for (i, item) in arr.iter().enumerate() {
                let item_path = format!("{display_path}[{i}]");
                validate_value(item, items_schema, &item_path, errors);
            }
        }
    }
}

/// Extract a `Vec<String>` from a parameter that may be a JSON array, a
/// JSON-encoded array string, or a single bare string (models stringify
/// arrays now and then).
pub(crate) fn parse_string_list(params: &serde_json::Value, key: &str) -> Vec<String> {
    match params.get(key) {
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        Some(serde_json::Value::String(s)) => {
            if let Ok(list) = serde_json::from_str::<Vec<String>>(s) {
                list
            } else if s.is_empty() {
                Vec::new()
            } else {
                vec![s.clone()]
            }
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the input back."
        }

        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            })
        }

        async fn execute(
            &self,
            _token: &CancellationToken,
            params: serde_json::Value,
        ) -> Result<ToolResult> {
            let text = params.get("text").and_then(|v| v.as_str()).unwrap_or("");
            if text == "boom" {
                anyhow::bail!("exploded");
            }
            Ok(ToolResult::text(text))
        }
    }

    #[tokio::test]
    async fn execute_runs_registered_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        let result = registry
            .execute(
                &CancellationToken::new(),
                "echo",
                serde_json::json!({"text": "hi"}),
            )
            .await;
        assert_eq!(result.content, "hi");
    }

    #[tokio::test]
    async fn unknown_tool_is_an_isolated_error() {
        let registry = ToolRegistry::new();
        let result = registry
            .execute(&CancellationToken::new(), "nope", serde_json::json!({}))
            .await;
        assert!(result.content.contains("not found"));
    }

    #[tokio::test]
    async fn tool_errors_are_captured_as_text() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        let result = registry
            .execute(
                &CancellationToken::new(),
                "echo",
                serde_json::json!({"text": "boom"}),
            )
            .await;
        assert!(result.content.contains("Error executing echo"));
        assert!(result.content.contains("exploded"));
        assert!(result.media.is_empty());
    }

    #[tokio::test]
    async fn missing_required_param_is_reported() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        let result = registry
            .execute(&CancellationToken::new(), "echo", serde_json::json!({}))
            .await;
        assert!(result.content.contains("required field missing"));
    }

    #[test]
    fn definitions_use_function_calling_shape() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        let defs = registry.definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0]["type"], "function");
        assert_eq!(defs[0]["function"]["name"], "echo");
    }

    #[test]
    fn validate_rejects_wrong_type_and_range() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "count": {"type": "integer", "minimum": 1, "maximum": 10}
            },
            "required": ["count"]
        });
        assert!(!validate_params(&serde_json::json!({"count": "x"}), &schema).is_empty());
        assert!(!validate_params(&serde_json::json!({"count": 15}), &schema).is_empty());
        assert!(validate_params(&serde_json::json!({"count": 5}), &schema).is_empty());
    }

    #[test]
    fn string_lists_accept_arrays_and_json_strings() {
        let params = serde_json::json!({"files": ["/a", "/b"]});
        assert_eq!(parse_string_list(&params, "files"), vec!["/a", "/b"]);

        let params = serde_json::json!({"files": "[\"/a\", \"/b\"]"});
        assert_eq!(parse_string_list(&params, "files"), vec!["/a", "/b"]);

        let params = serde_json::json!({"files": "/only"});
        assert_eq!(parse_string_list(&params, "files"), vec!["/only"]);

        let params = serde_json::json!({});
        assert!(parse_string_list(&params, "files").is_empty());
    }
}
