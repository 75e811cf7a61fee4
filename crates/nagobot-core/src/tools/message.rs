use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{parse_string_list, Tool, ToolResult};
use crate::bus::OutboundMessage;

/// Tool for sending messages to chat channels. The agent loop binds the
/// current (channel, chat_id) before each turn; explicit parameters
/// override it.
pub struct MessageTool {
    outbound_tx: mpsc::Sender<OutboundMessage>,
    default_channel: Arc<RwLock<String>>,
    default_chat_id: Arc<RwLock<String>>,
}

impl MessageTool {
    pub fn new(outbound_tx: mpsc::Sender<OutboundMessage>) -> Self {
        Self {
            outbound_tx,
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
impl Tool for MessageTool {
    fn name(&self) -> &str {
        "message"
    }

    fn description(&self) -> &str {
        "Send a message to the user on a chat channel. Supports file attachments \
         via the files parameter. Defaults to the current channel/chat unless \
         overridden with explicit channel and chat_id parameters."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "The message content to send"
                },
                "files": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Optional: absolute file paths to attach (images, documents, etc.)"
                },
                "channel": {
                    "type": "string",
                    "description": "Optional: target channel. Defaults to current channel."
                },
                "chat_id": {
                    "type": "string",
                    "description": "Optional: target chat/user ID. Defaults to current chat."
                }
            },
            "required": ["content"]
        })
    }

    async fn execute(
        &self,
        token: &CancellationToken,
        params: serde_json::Value,
    ) -> Result<ToolResult> {
        let content = params
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: content"))?;

        let channel = match params.get("channel").and_then(|v| v.as_str()) {
            Some(c) if !c.is_empty() => c.to_string(),
            _ => self.default_channel.read().await.clone(),
        };
        let chat_id = match params.get("chat_id").and_then(|v| v.as_str()) {
            Some(c) if !c.is_empty() => c.to_string(),
            _ => self.default_chat_id.read().await.clone(),
        };

        if channel.is_empty() || chat_id.is_empty() {
            return Ok(ToolResult::text(
                "Error: No target channel/chat specified and no default context set.",
            ));
        }

        let media = parse_string_list(&params, "files");
        let media_count = media.len();

        let mut msg = OutboundMessage::new(&channel, &chat_id, content);
        msg.media = media;

        // The outbound queue is bounded; don't sit on a full queue past
        // the turn's cancellation.
        let sent = tokio::select! {
            _ = token.cancelled() => {
                return Ok(ToolResult::text("Error: Message cancelled"));
            }
            r = self.outbound_tx.send(msg) => r,
        };
        if sent.is_err() {
            return Ok(ToolResult::text(
                "Error: Message bus is closed, message not delivered.",
            ));
        }

        info!("Message sent to {channel}:{chat_id}");
        Ok(ToolResult::text(format!(
            "Message sent to {channel}:{chat_id} (files: {media_count})"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sends_to_bound_context() {
        let (tx, mut rx) = mpsc::channel(4);
        let tool = MessageTool::new(tx);
        tool.set_context("telegram", "99").await;

        let result = tool
            .execute(&CancellationToken::new(), serde_json::json!({"content": "hello"}))
            .await
            .unwrap();
        assert!(result.content.contains("telegram:99"));

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.channel, "telegram");
        assert_eq!(msg.chat_id, "99");
        assert_eq!(msg.content, "hello");
    }

    #[tokio::test]
    async fn explicit_target_overrides_context() {
        let (tx, mut rx) = mpsc::channel(4);
        let tool = MessageTool::new(tx);
        tool.set_context("telegram", "99").await;

        tool.execute(&CancellationToken::new(), serde_json::json!({
            "content": "hi",
            "channel": "discord",
            "chat_id": "7"
        }))
        .await
        .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.channel, "discord");
        assert_eq!(msg.chat_id, "7");
    }

    #[tokio::test]
    async fn attaches_files_from_json_string() {
        let (tx, mut rx) = mpsc::channel(4);
        let tool = MessageTool::new(tx);
        tool.set_context("cli", "default").await;

        tool.execute(&CancellationToken::new(), serde_json::json!({
            "content": "with files",
            "files": "[\"/tmp/a.png\", \"/tmp/b.pdf\"]"
        }))
        .await
        .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.media, vec!["/tmp/a.png", "/tmp/b.pdf"]);
    }

    #[tokio::test]
    async fn missing_context_is_reported() {
        let (tx, _rx) = mpsc::channel(4);
        let tool = MessageTool::new(tx);
        let result = tool
            .execute(&CancellationToken::new(), serde_json::json!({"content": "hello"}))
            .await
            .unwrap();
        assert!(result.content.contains("No target channel/chat"));
    }
}
