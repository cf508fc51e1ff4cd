//! Storage of inbound transport events.

use std::sync::Arc;

use tracing::{debug, trace};

use super::{ChannelEvent, ChatMetadata, InboundMessage};
use crate::groups::GroupRegistry;
use crate::storage::{Database, DatabaseError, NewMessage};

/// Whether `content` was written by the assistant itself.
pub fn is_bot_content(content: &str, assistant_name: &str) -> bool {
    content
        .strip_prefix(assistant_name)
        .is_some_and(|rest| rest.starts_with(':'))
}

/// Writes transport events into the store.
///
/// Metadata is kept for every conversation so the administrative group can
/// discover new chats; message content only for registered groups.
pub struct Ingestor {
    db: Database,
    registry: Arc<GroupRegistry>,
    assistant_name: String,
}

impl Ingestor {
    pub fn new(db: Database, registry: Arc<GroupRegistry>, assistant_name: impl Into<String>) -> Self {
        Self {
            db,
            registry,
            assistant_name: assistant_name.into(),
        }
    }

    pub async fn handle(&self, event: ChannelEvent) -> Result<(), DatabaseError> {
        match event {
            ChannelEvent::Message(message) => self.store_message(message).await,
            ChannelEvent::Metadata(metadata) => self.store_metadata(metadata).await,
        }
    }

    async fn store_metadata(&self, metadata: ChatMetadata) -> Result<(), DatabaseError> {
        trace!(chat = %metadata.chat_jid, "Chat metadata");
        self.db
            .upsert_chat(
                &metadata.chat_jid,
                metadata.name.as_deref(),
                metadata.channel.as_deref(),
                metadata.is_group,
                metadata.timestamp,
            )
            .await
    }

    async fn store_message(&self, message: InboundMessage) -> Result<(), DatabaseError> {
        self.db
            .upsert_chat(&message.chat_jid, None, None, None, message.timestamp)
            .await?;

        if self.registry.by_jid(&message.chat_jid).await.is_none() {
            trace!(chat = %message.chat_jid, "Message for unregistered chat not stored");
            return Ok(());
        }

        let is_bot_message =
            message.is_from_me || is_bot_content(&message.content, &self.assistant_name);
        debug!(
            chat = %message.chat_jid,
            id = %message.id,
            bot = is_bot_message,
            "Storing message"
        );
        self.db
            .insert_message(&NewMessage {
                id: message.id,
                chat_jid: message.chat_jid,
                sender: message.sender,
                sender_name: message.sender_name,
                content: message.content,
                timestamp: message.timestamp,
                is_from_me: message.is_from_me,
                is_bot_message,
            })
            .await
    }
}
