use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use nagobot_core::bus::{InboundMessage, OutboundMessage};

/// Interface every chat transport adapter implements.
///
/// Adapters publish an [`InboundMessage`] for each user event (with
/// `channel` set to the adapter's name), deliver outbound messages in
/// `send`, and gate senders through an allow-list. Methods take `&self` so
/// adapters can live behind `Arc`; use interior mutability for state.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel name (e.g. "telegram", "discord").
    fn name(&self) -> &str;

    /// Start listening for user events, publishing them through the sender.
    async fn start(&self, inbound_tx: mpsc::Sender<InboundMessage>) -> Result<()>;

    /// Stop the channel and release its resources.
    async fn stop(&self) -> Result<()>;

    /// Deliver one outbound message. Attachments in `msg.media` are
    /// absolute paths streamed from disk by the adapter.
    async fn send(&self, msg: &OutboundMessage) -> Result<()>;

    /// Whether a sender may use this bot.
    fn is_allowed(&self, sender_id: &str) -> bool;
}

/// Allow-list check shared by adapters: an empty list admits everyone.
pub fn is_allowed(sender_id: &str, allow_list: &[String]) -> bool {
    allow_list.is_empty() || allow_list.iter().any(|a| a == sender_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allow_list_admits_everyone() {
        assert!(is_allowed("anyone", &[]));
    }

    #[test]
    fn allow_list_matches_exact_ids() {
        let list = vec!["42".to_string(), "alice".to_string()];
        assert!(is_allowed("42", &list));
        assert!(is_allowed("alice", &list));
        assert!(!is_allowed("mallory", &list));
    }
}
