//! Directory-backed transport.
//!
//! Inbound messages are JSON files dropped into `inbox/`; replies are written
//! to `outbox/` with the same atomic rename protocol the Command Bus uses.
//! Anything able to write files can act as a chat network, which makes the
//! daemon usable without a real messaging integration.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use nestbox_core::db::unix_timestamp_ms;
use nestbox_core::ipc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Channel, ChannelError, ChannelEvent, ChatMetadata, InboundMessage};

const CHANNEL_NAME: &str = "spool";

/// One inbound file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoolInbound {
    pub chat_jid: String,
    pub sender: String,
    pub sender_name: String,
    pub content: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub chat_name: Option<String>,
    #[serde(default)]
    pub is_group: Option<bool>,
    #[serde(default)]
    pub is_from_me: bool,
}

/// One outbound file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoolOutbound {
    pub chat_jid: String,
    pub text: String,
    pub timestamp: i64,
}

struct Inner {
    inbox: PathBuf,
    outbox: PathBuf,
    rejected: PathBuf,
    connected: AtomicBool,
    sink: Mutex<Option<mpsc::Sender<ChannelEvent>>>,
}

/// Transport reading `inbox/` and writing `outbox/` under one root.
pub struct SpoolChannel {
    inner: Arc<Inner>,
    poll_interval: Duration,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SpoolChannel {
    pub fn new(root: &Path, poll_interval: Duration) -> Self {
        let inbox = root.join("inbox");
        Self {
            inner: Arc::new(Inner {
                rejected: inbox.join("rejected"),
                inbox,
                outbox: root.join("outbox"),
                connected: AtomicBool::new(false),
                sink: Mutex::new(None),
            }),
            poll_interval,
            worker: Mutex::new(None),
        }
    }

    pub fn inbox(&self) -> &Path {
        &self.inner.inbox
    }

    pub fn outbox(&self) -> &Path {
        &self.inner.outbox
    }

    /// Deliver every complete inbox file once. Returns the number delivered.
    pub async fn drain_inbox(&self) -> Result<usize, ChannelError> {
        self.inner.drain().await
    }
}

impl Inner {
    fn sink(&self) -> Option<mpsc::Sender<ChannelEvent>> {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn drain(&self) -> Result<usize, ChannelError> {
        let sink = self
            .sink()
            .ok_or_else(|| ChannelError::NotConnected(CHANNEL_NAME.to_string()))?;

        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.inbox)?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file() && ipc::is_document(p))
            .collect();
        files.sort();

        let mut delivered = 0;
        for path in files {
            let parsed = std::fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|bytes| {
                    serde_json::from_slice::<SpoolInbound>(&bytes).map_err(|e| e.to_string())
                });
            let inbound = match parsed {
                Ok(inbound) => inbound,
                Err(reason) => {
                    warn!(file = %path.display(), reason = %reason, "Rejecting spool file");
                    self.reject(&path);
                    continue;
                }
            };

            let id = inbound.id.clone().unwrap_or_else(|| {
                path.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default()
            });
            let timestamp = inbound.timestamp.unwrap_or_else(unix_timestamp_ms);

            let events = [
                ChannelEvent::Metadata(ChatMetadata {
                    chat_jid: inbound.chat_jid.clone(),
                    timestamp,
                    name: inbound.chat_name,
                    channel: Some(CHANNEL_NAME.to_string()),
                    is_group: inbound.is_group,
                }),
                ChannelEvent::Message(InboundMessage {
                    id,
                    chat_jid: inbound.chat_jid,
                    sender: inbound.sender,
                    sender_name: inbound.sender_name,
                    content: inbound.content,
                    timestamp,
                    is_from_me: inbound.is_from_me,
                }),
            ];
            for event in events {
                if sink.send(event).await.is_err() {
                    self.connected.store(false, Ordering::SeqCst);
                    return Err(ChannelError::NotConnected(CHANNEL_NAME.to_string()));
                }
            }

            if let Err(e) = std::fs::remove_file(&path) {
                warn!(file = %path.display(), error = %e, "Failed to remove spool file");
            }
            delivered += 1;
        }

        if delivered > 0 {
            debug!(delivered, "Spool inbox drained");
        }
        Ok(delivered)
    }

    fn reject(&self, path: &Path) {
        let Some(name) = path.file_name() else {
            return;
        };
        let target = self.rejected.join(name);
        let moved = std::fs::create_dir_all(&self.rejected).and_then(|()| std::fs::rename(path, &target));
        if let Err(e) = moved {
            warn!(file = %path.display(), error = %e, "Failed to move rejected spool file");
            let _ = std::fs::remove_file(path);
        }
    }
}

#[async_trait]
impl Channel for SpoolChannel {
    fn name(&self) -> &str {
        CHANNEL_NAME
    }

    async fn connect(&self, events: mpsc::Sender<ChannelEvent>) -> Result<(), ChannelError> {
        std::fs::create_dir_all(&self.inner.inbox)?;
        std::fs::create_dir_all(&self.inner.outbox)?;

        *self
            .inner
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(events);
        self.inner.connected.store(true, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        let interval = self.poll_interval;
        let worker = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            while inner.connected.load(Ordering::SeqCst) {
                ticker.tick().await;
                if let Err(e) = inner.drain().await {
                    warn!(error = %e, "Spool inbox poll failed");
                }
            }
        });

        let previous = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(worker);
        if let Some(previous) = previous {
            previous.abort();
        }

        info!(inbox = %self.inner.inbox.display(), "Spool channel listening");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ChannelError> {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            worker.abort();
        }
        Ok(())
    }

    async fn send_message(&self, jid: &str, text: &str) -> Result<(), ChannelError> {
        let message = SpoolOutbound {
            chat_jid: jid.to_string(),
            text: text.to_string(),
            timestamp: unix_timestamp_ms(),
        };
        ipc::write_document(&self.inner.outbox, &message)
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        debug!(chat = %jid, len = text.len(), "Spool message written");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst) && self.inner.inbox.is_dir()
    }

    fn owns_jid(&self, _jid: &str) -> bool {
        true
    }
}
