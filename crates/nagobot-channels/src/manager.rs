//! Channel manager: owns the registered adapters, subscribes each one's
//! send path on the bus, and drives adapter lifecycle.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{error, info, warn};

use nagobot_core::bus::{MessageBus, OutboundHandler, OutboundMessage};

use crate::base::Channel;

/// Bridges one channel's `send` onto the bus subscription model, so the
/// dispatcher's recovery chain applies to every adapter.
struct ChannelSendHandler {
    channel: Arc<dyn Channel>,
}

#[async_trait]
impl OutboundHandler for ChannelSendHandler {
    async fn handle(&self, msg: &OutboundMessage) -> Result<()> {
        self.channel.send(msg).await
    }
}

/// Coordinates the lifecycle of all enabled channels.
pub struct ChannelManager {
    bus: Arc<MessageBus>,
    channels: HashMap<String, Arc<dyn Channel>>,
}

impl ChannelManager {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self {
            bus,
            channels: HashMap::new(),
        }
    }

    /// Register a channel and subscribe its send handler on the bus.
    /// Call before `start_all`.
    pub async fn register(&mut self, channel: Arc<dyn Channel>) {
        let name = channel.name().to_string();
        self.bus
            .subscribe(
                &name,
                Arc::new(ChannelSendHandler {
                    channel: channel.clone(),
                }),
            )
            .await;
        info!("Registered channel: {name}");
        self.channels.insert(name, channel);
    }

    pub fn enabled_channels(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    /// Start every channel; each `start` runs as its own task.
    pub async fn start_all(&self) -> Result<()> {
        for (name, channel) in &self.channels {
            let ch = channel.clone();
            let tx = self.bus.inbound_sender();
            let ch_name = name.clone();
            tokio::spawn(async move {
                if let Err(e) = ch.start(tx).await {
                    error!("Channel {ch_name} failed: {e}");
                }
            });
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        for (name, channel) in &self.channels {
            info!("Stopping channel: {name}");
            if let Err(e) = channel.stop().await {
                warn!("Error stopping channel {name}: {e}");
            }
        }
    }
}
