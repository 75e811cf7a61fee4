use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::{Tool, ToolResult};
use crate::agent::subagent::SubagentManager;

/// Tool for handing tasks to the subagent manager. Carries the origin
/// (channel, chat_id) so completion announcements route back correctly.
pub struct SpawnTool {
    manager: Arc<SubagentManager>,
    default_channel: Arc<RwLock<String>>,
    default_chat_id: Arc<RwLock<String>>,
}

impl SpawnTool {
    pub fn new(manager: Arc<SubagentManager>) -> Self {
        Self {
            manager,
            default_channel: Arc::new(RwLock::new(String::new())),
            default_chat_id: Arc::new(RwLock::new(String::new())),
        }
    }

    pub async fn set_context(&self, channel: &str, chat_id: &str) {
        *self.default_channel.write().await = channel.to_string();
        *self.default_chat_id.write().await = chat_id.to_string();
    }
}

#[async_trait]
impl Tool for SpawnTool {
    fn name(&self) -> &str {
        "spawn"
    }

    fn description(&self) -> &str {
        "Spawn a background subagent to work on a task independently. The subagent \
         has its own restricted tool set (files and shell, no messaging) and \
         reports back when done. Use this for long tasks that can run while the \
         conversation continues."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "Detailed description of the task for the subagent"
                },
                "label": {
                    "type": "string",
                    "description": "Optional short label for the task (for display)"
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(
        &self,
        _token: &CancellationToken,
        params: serde_json::Value,
    ) -> Result<ToolResult> {
        let task = params
            .get("task")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: task"))?;
        let label = params.get("label").and_then(|v| v.as_str()).unwrap_or("");

        let channel = {
            let ch = self.default_channel.read().await;
            if ch.is_empty() { "cli".to_string() } else { ch.clone() }
        };
        let chat_id = {
            let ci = self.default_chat_id.read().await;
            if ci.is_empty() { "direct".to_string() } else { ci.clone() }
        };

        let status = self.manager.spawn(task, label, &channel, &chat_id).await;
        Ok(ToolResult::text(status))
    }
}
