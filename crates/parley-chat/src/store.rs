use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use parley_db::Database;
use parley_db::models::MessageRow;
use parley_types::models::Message;

use crate::convert;
use crate::error::{ChatError, Result};
use crate::locks::KeyedLocks;
use crate::run_blocking;

/// Append-only message log per chat with per-message read state.
///
/// Every mutation of one chat's sequence runs under that chat's lock,
/// so overlapping sends and read-marks on the same chat execute one at
/// a time in arrival order. Different chats proceed concurrently.
pub struct MessageStore {
    db: Arc<Database>,
    chat_locks: KeyedLocks<Uuid>,
}

impl MessageStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            chat_locks: KeyedLocks::new(),
        }
    }

    /// Append a message. The timestamp is assigned server-side at
    /// acceptance and clamped to never run backwards within the chat;
    /// the sender starts out in the read set.
    pub async fn append_message(
        &self,
        chat_id: Uuid,
        sender_id: Uuid,
        text: Option<String>,
        file_url: Option<String>,
    ) -> Result<Message> {
        // Empty strings count as absent, matching lenient client input
        let text = text.filter(|t| !t.is_empty());
        let file_url = file_url.filter(|f| !f.is_empty());
        if text.is_none() && file_url.is_none() {
            return Err(ChatError::InvalidRequest(
                "message needs text or a file".into(),
            ));
        }

        let lock = self.chat_locks.get(&chat_id);
        let _guard = lock.lock().await;

        let accepted_at = Utc::now();
        run_blocking(self.db.clone(), move |db| {
            let chat_key = chat_id.to_string();
            if db.get_chat(&chat_key)?.is_none() {
                return Err(ChatError::NotFound);
            }
            if !db.is_chat_member(&chat_key, &sender_id.to_string())? {
                return Err(ChatError::NotAMember);
            }

            // Clamp against the newest message so wall-clock skew can
            // never produce a decreasing timestamp within the chat
            let mut timestamp = accepted_at;
            if let Some(last) = db.last_message_timestamp(&chat_key)? {
                let last = convert::parse_timestamp(&last, &format!("chat '{}'", chat_key));
                if last > timestamp {
                    timestamp = last;
                }
            }

            let id = Uuid::new_v4();
            db.insert_message(
                &id.to_string(),
                &chat_key,
                &sender_id.to_string(),
                text.as_deref(),
                file_url.as_deref(),
                &timestamp.to_rfc3339(),
            )?;

            let sender_username = db
                .get_user_by_id(&sender_id.to_string())?
                .map(|u| u.username)
                .unwrap_or_else(|| "unknown".to_string());

            debug!("Appended message {} to chat {}", id, chat_id);

            Ok(Message {
                id,
                chat_id,
                sender_id,
                sender_username,
                text,
                file_url,
                timestamp,
                read_by: vec![sender_id],
            })
        })
        .await
    }

    /// Add `reader_id` to the read set of each referenced message.
    /// Idempotent: already-read messages are no-ops, unknown ids and
    /// ids belonging to other chats are silently skipped. Returns the
    /// ids actually updated.
    pub async fn mark_read(
        &self,
        chat_id: Uuid,
        reader_id: Uuid,
        message_ids: &[Uuid],
    ) -> Result<Vec<Uuid>> {
        let lock = self.chat_locks.get(&chat_id);
        let _guard = lock.lock().await;

        let requested: Vec<String> = message_ids.iter().map(Uuid::to_string).collect();
        run_blocking(self.db.clone(), move |db| {
            let chat_key = chat_id.to_string();
            if db.get_chat(&chat_key)?.is_none() {
                return Err(ChatError::NotFound);
            }
            if !db.is_chat_member(&chat_key, &reader_id.to_string())? {
                return Err(ChatError::NotAMember);
            }

            let updated = db.mark_messages_read(&chat_key, &reader_id.to_string(), &requested)?;
            Ok(updated
                .iter()
                .map(|id| convert::parse_id(id, "message"))
                .collect())
        })
        .await
    }

    /// Full history for a chat, oldest first, in append order.
    pub async fn list_messages(&self, chat_id: Uuid) -> Result<Vec<Message>> {
        run_blocking(self.db.clone(), move |db| {
            let chat_key = chat_id.to_string();
            if db.get_chat(&chat_key)?.is_none() {
                return Err(ChatError::NotFound);
            }

            let rows = db.messages_for_chat(&chat_key)?;
            let message_ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();

            let mut read_map: HashMap<String, Vec<Uuid>> = HashMap::new();
            for read in db.reads_for_messages(&message_ids)? {
                read_map
                    .entry(read.message_id)
                    .or_default()
                    .push(convert::parse_id(&read.user_id, "read mark"));
            }

            Ok(rows
                .into_iter()
                .map(|row| {
                    let read_by = read_map.remove(&row.id).unwrap_or_default();
                    message_from_row(row, read_by)
                })
                .collect())
        })
        .await
    }
}

fn message_from_row(row: MessageRow, read_by: Vec<Uuid>) -> Message {
    let context = format!("message '{}'", row.id);
    Message {
        id: convert::parse_id(&row.id, "message"),
        chat_id: convert::parse_id(&row.chat_id, &context),
        sender_id: convert::parse_id(&row.sender_id, &context),
        sender_username: row.sender_username,
        text: row.text,
        file_url: row.file_url,
        timestamp: convert::parse_timestamp(&row.created_at, &context),
        read_by,
    }
}
