//! Transport adapters.
//!
//! A [`Channel`] connects the daemon to one messaging network. Inbound
//! traffic arrives as [`ChannelEvent`]s on a shared sink; outbound replies go
//! through the [`ChannelRouter`], which picks the channel owning the target
//! conversation.

mod ingest;
mod spool;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub use ingest::{Ingestor, is_bot_content};
pub use spool::{SpoolChannel, SpoolInbound, SpoolOutbound};

/// Errors from transport operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {0} is not connected")]
    NotConnected(String),

    #[error("No channel owns {0}")]
    NoOwner(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A chat message received by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub id: String,
    pub chat_jid: String,
    pub sender: String,
    pub sender_name: String,
    pub content: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub is_from_me: bool,
}

/// Conversation details observed by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMetadata {
    pub chat_jid: String,
    pub timestamp: i64,
    pub name: Option<String>,
    pub channel: Option<String>,
    pub is_group: Option<bool>,
}

/// Everything a transport reports back to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Message(InboundMessage),
    Metadata(ChatMetadata),
}

/// Contract every transport adapter fulfils.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Start receiving; events are delivered on `events` until disconnect.
    async fn connect(&self, events: mpsc::Sender<ChannelEvent>) -> Result<(), ChannelError>;

    async fn disconnect(&self) -> Result<(), ChannelError>;

    async fn send_message(&self, jid: &str, text: &str) -> Result<(), ChannelError>;

    fn is_connected(&self) -> bool;

    fn owns_jid(&self, jid: &str) -> bool;
}

/// Routes outbound traffic to the channel owning each conversation.
#[derive(Clone, Default)]
pub struct ChannelRouter {
    channels: Vec<Arc<dyn Channel>>,
}

impl ChannelRouter {
    pub fn new(channels: Vec<Arc<dyn Channel>>) -> Self {
        Self { channels }
    }

    pub fn channels(&self) -> &[Arc<dyn Channel>] {
        &self.channels
    }

    /// The first channel claiming `jid`, connected or not.
    pub fn owner(&self, jid: &str) -> Option<&Arc<dyn Channel>> {
        self.channels.iter().find(|c| c.owns_jid(jid))
    }

    /// Whether `jid` has an owner that is currently connected.
    pub fn is_reachable(&self, jid: &str) -> bool {
        self.owner(jid).is_some_and(|c| c.is_connected())
    }

    pub async fn send(&self, jid: &str, text: &str) -> Result<(), ChannelError> {
        let channel = self
            .owner(jid)
            .ok_or_else(|| ChannelError::NoOwner(jid.to_string()))?;
        if !channel.is_connected() {
            return Err(ChannelError::NotConnected(channel.name().to_string()));
        }
        channel.send_message(jid, text).await
    }

    /// Connect every channel. Failures are logged; the poll loop retries
    /// disconnected channels later.
    pub async fn connect_all(&self, events: &mpsc::Sender<ChannelEvent>) -> usize {
        let mut connected = 0;
        for channel in &self.channels {
            match channel.connect(events.clone()).await {
                Ok(()) => {
                    info!(channel = channel.name(), "Channel connected");
                    connected += 1;
                }
                Err(e) => warn!(channel = channel.name(), error = %e, "Channel failed to connect"),
            }
        }
        connected
    }

    /// Reconnect channels that dropped.
    pub async fn reconnect_missing(&self, events: &mpsc::Sender<ChannelEvent>) {
        for channel in self.channels.iter().filter(|c| !c.is_connected()) {
            match channel.connect(events.clone()).await {
                Ok(()) => info!(channel = channel.name(), "Channel reconnected"),
                Err(e) => warn!(channel = channel.name(), error = %e, "Channel still disconnected"),
            }
        }
    }

    pub async fn disconnect_all(&self) {
        for channel in &self.channels {
            if let Err(e) = channel.disconnect().await {
                warn!(channel = channel.name(), error = %e, "Channel failed to disconnect");
            }
        }
    }
}
