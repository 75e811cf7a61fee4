use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Default buffer size for the inbound and outbound queues.
const DEFAULT_BUFFER: usize = 64;

/// Content truncation limit for the second delivery-recovery attempt.
const TRUNCATE_BYTES: usize = 1500;

/// Fixed user-facing apology used when delivery recovery runs out of options.
pub const DELIVERY_APOLOGY: &str =
    "Sorry, I wasn't able to deliver my full response. Please try again.";

/// Message received from a chat channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    pub sender_id: String,
    pub chat_id: String,
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub media: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl InboundMessage {
    pub fn new(channel: &str, sender_id: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel: channel.into(),
            sender_id: sender_id.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            timestamp: Some(default_timestamp()),
            media: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Unique session key for this message's conversation.
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }
}

/// Message to send to a chat channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub media: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl OutboundMessage {
    pub fn new(channel: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            reply_to: None,
            media: Vec::new(),
            metadata: HashMap::new(),
        }
    }
}

pub fn default_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Callback for outbound messages on a specific channel.
#[async_trait]
pub trait OutboundHandler: Send + Sync {
    async fn handle(&self, msg: &OutboundMessage) -> Result<()>;
}

/// Async message bus decoupling chat channels from the agent core.
///
/// Two bounded queues: inbound (consumed by the agent loop) and outbound
/// (consumed by `dispatch_outbound`). Producers block when a queue is full.
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    outbound_rx: Mutex<Option<mpsc::Receiver<OutboundMessage>>>,
    subscribers: RwLock<HashMap<String, Vec<Arc<dyn OutboundHandler>>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_BUFFER)
    }

    pub fn with_buffer(buffer: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(buffer);
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer);
        Self {
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Send a message from a channel to the agent. Blocks while the queue is full.
    pub async fn publish_inbound(&self, msg: InboundMessage) {
        if self.inbound_tx.send(msg).await.is_err() {
            warn!("Inbound queue closed, message dropped");
        }
    }

    /// Send a response from the agent toward channels. Blocks while the queue is full.
    pub async fn publish_outbound(&self, msg: OutboundMessage) {
        if self.outbound_tx.send(msg).await.is_err() {
            warn!("Outbound queue closed, message dropped");
        }
    }

    /// Producer handle for components that only inject inbound messages
    /// (subagents, scheduler, heartbeat).
    pub fn inbound_sender(&self) -> mpsc::Sender<InboundMessage> {
        self.inbound_tx.clone()
    }

    pub fn outbound_sender(&self) -> mpsc::Sender<OutboundMessage> {
        self.outbound_tx.clone()
    }

    /// Hand the inbound receiver to the single consumer (the agent loop).
    /// Returns `None` on the second call.
    pub async fn take_inbound(&self) -> Option<mpsc::Receiver<InboundMessage>> {
        self.inbound_rx.lock().await.take()
    }

    /// Hand over the outbound receiver, for embedders that drain outbound
    /// messages themselves instead of running `dispatch_outbound`.
    pub async fn take_outbound(&self) -> Option<mpsc::Receiver<OutboundMessage>> {
        self.outbound_rx.lock().await.take()
    }

    /// Register a handler for outbound messages on a channel. Handlers for
    /// the same channel fan out in registration order.
    pub async fn subscribe(&self, channel: &str, handler: Arc<dyn OutboundHandler>) {
        let mut subs = self.subscribers.write().await;
        subs.entry(channel.to_string()).or_default().push(handler);
    }

    /// Drain the outbound queue, dispatching each message to its channel's
    /// handlers. Blocks until the token is cancelled.
    pub async fn dispatch_outbound(&self, token: CancellationToken) {
        let mut rx = match self.take_outbound().await {
            Some(rx) => rx,
            None => {
                error!("Outbound dispatcher already running");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Outbound dispatcher stopping");
                    return;
                }
                msg = rx.recv() => {
                    let Some(msg) = msg else {
                        info!("Outbound queue closed, dispatcher shutting down");
                        return;
                    };
                    let handlers = {
                        let subs = self.subscribers.read().await;
                        subs.get(&msg.channel).cloned().unwrap_or_default()
                    };
                    for handler in handlers {
                        deliver_with_recovery(handler.as_ref(), &msg).await;
                    }
                }
            }
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Deliver a message through a handler, degrading on failure:
/// retry without media, then with truncated content, then a fixed apology.
async fn deliver_with_recovery(handler: &dyn OutboundHandler, msg: &OutboundMessage) {
    let err = match handler.handle(msg).await {
        Ok(()) => return,
        Err(e) => e,
    };
    warn!("Outbound delivery failed on {}: {err}", msg.channel);

    if !msg.media.is_empty() {
        let mut stripped = msg.clone();
        stripped.media.clear();
        if handler.handle(&stripped).await.is_ok() {
            info!("Delivered to {} after stripping media", msg.channel);
            return;
        }
    }

    if msg.content.len() > TRUNCATE_BYTES {
        let mut short = msg.clone();
        let mut end = TRUNCATE_BYTES;
        while end > 0 && !msg.content.is_char_boundary(end) {
            end -= 1;
        }
        short.content = format!("{}... [truncated]", &msg.content[..end]);
        short.media.clear();
        if handler.handle(&short).await.is_ok() {
            info!("Delivered to {} after truncating content", msg.channel);
            return;
        }
    }

    let apology = OutboundMessage::new(&msg.channel, &msg.chat_id, DELIVERY_APOLOGY);
    if handler.handle(&apology).await.is_err() {
        error!(
            "Giving up on outbound delivery to {}:{}",
            msg.channel, msg.chat_id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{timeout, Duration};

    struct RecordingHandler {
        seen: Mutex<Vec<OutboundMessage>>,
        /// Fail any delivery that still carries media or content longer than this.
        max_content: usize,
        reject_media: bool,
    }

    impl RecordingHandler {
        fn accepting() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                max_content: usize::MAX,
                reject_media: false,
            })
        }

        fn rejecting_media() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                max_content: usize::MAX,
                reject_media: true,
            })
        }

        async fn delivered(&self) -> Vec<OutboundMessage> {
            self.seen.lock().await.clone()
        }
    }

    #[async_trait]
    impl OutboundHandler for RecordingHandler {
        async fn handle(&self, msg: &OutboundMessage) -> Result<()> {
            if self.reject_media && !msg.media.is_empty() {
                anyhow::bail!("attachment rejected");
            }
            if msg.content.len() > self.max_content {
                anyhow::bail!("payload too large");
            }
            self.seen.lock().await.push(msg.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatch_routes_by_channel_in_registration_order() {
        let bus = Arc::new(MessageBus::new());
        let first = RecordingHandler::accepting();
        let second = RecordingHandler::accepting();
        bus.subscribe("tg", first.clone()).await;
        bus.subscribe("tg", second.clone()).await;

        let token = CancellationToken::new();
        let dispatcher = {
            let bus = bus.clone();
            let token = token.clone();
            tokio::spawn(async move { bus.dispatch_outbound(token).await })
        };

        bus.publish_outbound(OutboundMessage::new("tg", "1", "hello"))
            .await;
        bus.publish_outbound(OutboundMessage::new("discord", "1", "elsewhere"))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(first.delivered().await.len(), 1);
        assert_eq!(second.delivered().await.len(), 1);
        assert_eq!(first.delivered().await[0].content, "hello");

        token.cancel();
        dispatcher.await.unwrap();
    }

    #[tokio::test]
    async fn recovery_strips_media_before_apologizing() {
        let handler = RecordingHandler::rejecting_media();
        let mut msg = OutboundMessage::new("tg", "1", "see attachment");
        msg.media.push("/tmp/pic.png".into());

        deliver_with_recovery(handler.as_ref(), &msg).await;

        let seen = handler.delivered().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].content, "see attachment");
        assert!(seen[0].media.is_empty());
    }

    #[tokio::test]
    async fn recovery_truncates_oversized_content() {
        let handler = Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
            max_content: 2000,
            reject_media: false,
        });
        let msg = OutboundMessage::new("tg", "1", &"x".repeat(5000));

        deliver_with_recovery(handler.as_ref(), &msg).await;

        let seen = handler.delivered().await;
        assert_eq!(seen.len(), 1);
        assert!(seen[0].content.len() <= 2000);
        assert!(seen[0].content.ends_with("... [truncated]"));
    }

    #[tokio::test]
    async fn recovery_falls_back_to_apology() {
        struct PickyHandler {
            attempts: AtomicUsize,
            seen: Mutex<Vec<String>>,
        }

        #[async_trait]
        impl OutboundHandler for PickyHandler {
            async fn handle(&self, msg: &OutboundMessage) -> Result<()> {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                if msg.content == DELIVERY_APOLOGY {
                    self.seen.lock().await.push(msg.content.clone());
                    return Ok(());
                }
                anyhow::bail!("nope")
            }
        }

        let handler = PickyHandler {
            attempts: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        };
        let mut msg = OutboundMessage::new("tg", "1", &"y".repeat(3000));
        msg.media.push("/tmp/a.png".into());

        deliver_with_recovery(&handler, &msg).await;

        // original, no-media, truncated, apology
        assert_eq!(handler.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(handler.seen.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn full_inbound_buffer_blocks_producers() {
        let bus = MessageBus::with_buffer(1);
        bus.publish_inbound(InboundMessage::new("cli", "u", "1", "first"))
            .await;

        // Queue is full and nothing consumes: the second publish must not complete.
        let blocked = timeout(
            Duration::from_millis(100),
            bus.publish_inbound(InboundMessage::new("cli", "u", "1", "second")),
        )
        .await;
        assert!(blocked.is_err(), "publish should block on a full queue");

        let mut rx = bus.take_inbound().await.unwrap();
        assert_eq!(rx.recv().await.unwrap().content, "first");
    }

    #[test]
    fn session_key_joins_channel_and_chat() {
        let msg = InboundMessage::new("telegram", "42", "chat9", "hi");
        assert_eq!(msg.session_key(), "telegram:chat9");
    }
}
