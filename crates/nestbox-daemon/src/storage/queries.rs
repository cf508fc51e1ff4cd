//! Chat, message and cursor queries.

use std::collections::HashMap;

use super::db::{Database, DatabaseError};
use super::models::{Chat, NewMessage, StoredMessage};

impl Database {
    // =========================================================================
    // Chat queries
    // =========================================================================

    /// Record activity for a conversation, creating it if needed.
    ///
    /// A missing `name` or `channel` leaves the stored value untouched.
    pub async fn upsert_chat(
        &self,
        jid: &str,
        name: Option<&str>,
        channel: Option<&str>,
        is_group: Option<bool>,
        timestamp: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO chats (jid, name, channel, is_group, last_message_time)
            VALUES (?, ?, ?, COALESCE(?, 0), ?)
            ON CONFLICT(jid) DO UPDATE SET
                name = COALESCE(excluded.name, chats.name),
                channel = COALESCE(excluded.channel, chats.channel),
                is_group = COALESCE(?, chats.is_group),
                last_message_time = MAX(chats.last_message_time, excluded.last_message_time)
            ",
        )
        .bind(jid)
        .bind(name)
        .bind(channel)
        .bind(is_group)
        .bind(timestamp)
        .bind(is_group)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// All known conversations, most recently active first.
    pub async fn list_chats(&self) -> Result<Vec<Chat>, DatabaseError> {
        let chats = sqlx::query_as::<_, Chat>(
            "SELECT * FROM chats ORDER BY last_message_time DESC, jid ASC",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(chats)
    }

    // =========================================================================
    // Message queries
    // =========================================================================

    /// Store a message. Re-delivery of the same `(id, chat_jid)` overwrites.
    pub async fn insert_message(&self, message: &NewMessage) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            INSERT OR REPLACE INTO messages
                (id, chat_jid, sender, sender_name, content, timestamp, is_from_me, is_bot_message)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&message.id)
        .bind(&message.chat_jid)
        .bind(&message.sender)
        .bind(&message.sender_name)
        .bind(&message.content)
        .bind(message.timestamp)
        .bind(message.is_from_me)
        .bind(message.is_bot_message)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Non-bot messages newer than `since`, oldest first.
    ///
    /// A batch cut at `limit` is extended through every message sharing the
    /// last timestamp, so a cursor set to that timestamp skips nothing.
    pub async fn messages_since(
        &self,
        chat_jid: &str,
        since: i64,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        let mut messages = sqlx::query_as::<_, StoredMessage>(
            r"
            SELECT * FROM messages
            WHERE chat_jid = ? AND timestamp > ? AND is_bot_message = 0
            ORDER BY timestamp ASC, id ASC
            LIMIT ?
            ",
        )
        .bind(chat_jid)
        .bind(since)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        if u32::try_from(messages.len()) == Ok(limit)
            && let Some(last) = messages.last()
        {
            let tail = sqlx::query_as::<_, StoredMessage>(
                r"
                SELECT * FROM messages
                WHERE chat_jid = ? AND timestamp = ? AND id > ? AND is_bot_message = 0
                ORDER BY id ASC
                ",
            )
            .bind(chat_jid)
            .bind(last.timestamp)
            .bind(&last.id)
            .fetch_all(self.pool())
            .await?;
            messages.extend(tail);
        }

        Ok(messages)
    }

    /// The latest `limit` non-bot messages, oldest first.
    pub async fn recent_messages(
        &self,
        chat_jid: &str,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        let mut messages = sqlx::query_as::<_, StoredMessage>(
            r"
            SELECT * FROM messages
            WHERE chat_jid = ? AND is_bot_message = 0
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            ",
        )
        .bind(chat_jid)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        messages.reverse();

        Ok(messages)
    }

    // =========================================================================
    // Cursor queries
    // =========================================================================

    /// Persisted cursor for a group, if one was ever written.
    pub async fn get_cursor(&self, group_folder: &str) -> Result<Option<i64>, DatabaseError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT last_timestamp FROM cursors WHERE group_folder = ?")
                .bind(group_folder)
                .fetch_optional(self.pool())
                .await?;

        Ok(row.map(|(ts,)| ts))
    }

    /// Persist a cursor value, overwriting (rollbacks may move it backwards).
    pub async fn set_cursor(&self, group_folder: &str, timestamp: i64) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO cursors (group_folder, last_timestamp) VALUES (?, ?)
            ON CONFLICT(group_folder) DO UPDATE SET last_timestamp = excluded.last_timestamp
            ",
        )
        .bind(group_folder)
        .bind(timestamp)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Every persisted cursor keyed by group folder.
    pub async fn all_cursors(&self) -> Result<HashMap<String, i64>, DatabaseError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT group_folder, last_timestamp FROM cursors")
                .fetch_all(self.pool())
                .await?;

        Ok(rows.into_iter().collect())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn message(id: &str, chat: &str, ts: i64, bot: bool) -> NewMessage {
        NewMessage {
            id: id.to_string(),
            chat_jid: chat.to_string(),
            sender: "alice@s".to_string(),
            sender_name: "Alice".to_string(),
            content: format!("message {id}"),
            timestamp: ts,
            is_from_me: false,
            is_bot_message: bot,
        }
    }

    #[tokio::test]
    async fn messages_since_skips_bot_and_older_messages() {
        let db = Database::open_in_memory().await.unwrap();
        db.insert_message(&message("1", "g1", 100, false)).await.unwrap();
        db.insert_message(&message("2", "g1", 200, true)).await.unwrap();
        db.insert_message(&message("3", "g1", 300, false)).await.unwrap();
        db.insert_message(&message("4", "g2", 400, false)).await.unwrap();

        let got = db.messages_since("g1", 100, 100).await.unwrap();
        let ids: Vec<_> = got.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["3"]);
    }

    #[tokio::test]
    async fn full_batch_runs_through_its_last_millisecond() {
        let db = Database::open_in_memory().await.unwrap();
        db.insert_message(&message("a", "g1", 100, false)).await.unwrap();
        db.insert_message(&message("b", "g1", 200, false)).await.unwrap();
        db.insert_message(&message("c", "g1", 200, false)).await.unwrap();
        db.insert_message(&message("d", "g1", 200, false)).await.unwrap();
        db.insert_message(&message("e", "g1", 300, false)).await.unwrap();

        let got = db.messages_since("g1", 0, 2).await.unwrap();
        let ids: Vec<_> = got.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);

        // Nothing is left behind once the cursor moves to the last timestamp.
        let rest = db.messages_since("g1", 200, 2).await.unwrap();
        let ids: Vec<_> = rest.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["e"]);
    }

    #[tokio::test]
    async fn recent_messages_are_oldest_first() {
        let db = Database::open_in_memory().await.unwrap();
        for (i, ts) in [10, 20, 30, 40].into_iter().enumerate() {
            db.insert_message(&message(&i.to_string(), "g", ts, false))
                .await
                .unwrap();
        }
        let got = db.recent_messages("g", 2).await.unwrap();
        let stamps: Vec<_> = got.iter().map(|m| m.timestamp).collect();
        assert_eq!(stamps, vec![30, 40]);
    }

    #[tokio::test]
    async fn cursor_can_move_backwards() {
        let db = Database::open_in_memory().await.unwrap();
        assert_eq!(db.get_cursor("main").await.unwrap(), None);
        db.set_cursor("main", 500).await.unwrap();
        db.set_cursor("main", 300).await.unwrap();
        assert_eq!(db.get_cursor("main").await.unwrap(), Some(300));
        assert_eq!(db.all_cursors().await.unwrap().get("main"), Some(&300));
    }

    #[tokio::test]
    async fn chat_upsert_keeps_name_and_latest_time() {
        let db = Database::open_in_memory().await.unwrap();
        db.upsert_chat("c@g.us", Some("Family"), Some("spool"), Some(true), 100)
            .await
            .unwrap();
        db.upsert_chat("c@g.us", None, None, None, 50).await.unwrap();

        let chats = db.list_chats().await.unwrap();
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].name.as_deref(), Some("Family"));
        assert_eq!(chats[0].is_group, 1);
        assert_eq!(chats[0].last_message_time, 100);
    }
}
