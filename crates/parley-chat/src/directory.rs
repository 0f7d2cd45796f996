use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use parley_db::Database;
use parley_db::models::ChatRow;
use parley_types::models::Chat;

use crate::convert;
use crate::error::{ChatError, Result};
use crate::locks::KeyedLocks;
use crate::run_blocking;

/// Resolves and creates chat entities and answers membership questions.
///
/// Private chat creation is serialized per unordered user pair so
/// concurrent calls for the same pair cannot race-create duplicates;
/// the UNIQUE pair_key column in SQLite backstops the invariant.
pub struct ChatDirectory {
    db: Arc<Database>,
    pair_locks: KeyedLocks<(Uuid, Uuid)>,
}

impl ChatDirectory {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            pair_locks: KeyedLocks::new(),
        }
    }

    /// Look up the private chat for `{a, b}` (argument order does not
    /// matter), creating it if absent.
    pub async fn find_or_create_private_chat(&self, a: Uuid, b: Uuid) -> Result<Chat> {
        if a == b {
            return Err(ChatError::InvalidRequest(
                "cannot open a private chat with yourself".into(),
            ));
        }

        let pair = sorted_pair(a, b);
        let pair_key = format!("{}:{}", pair.0, pair.1);

        let lock = self.pair_locks.get(&pair);
        let _guard = lock.lock().await;

        run_blocking(self.db.clone(), move |db| {
            let users = db.get_users_by_ids(&[a.to_string(), b.to_string()])?;
            if users.len() != 2 {
                return Err(ChatError::NotFound);
            }

            if let Some(row) = db.find_private_chat(&pair_key)? {
                let member_ids = db.chat_member_ids(&row.id)?;
                return Ok(chat_from_row(row, &member_ids));
            }

            let id = Uuid::new_v4();
            let now = Utc::now();
            let member_ids = vec![a.to_string(), b.to_string()];
            db.insert_chat(
                &id.to_string(),
                false,
                None,
                Some(&pair_key),
                &member_ids,
                &now.to_rfc3339(),
            )?;
            info!("Created private chat {} for {} / {}", id, a, b);

            Ok(Chat {
                id,
                is_group: false,
                name: None,
                member_ids: vec![a, b],
                created_at: now,
            })
        })
        .await
    }

    /// Create a group chat. The creator is implicitly a member even if
    /// the caller left themselves out of the list. Groups are never
    /// deduplicated.
    pub async fn create_group_chat(
        &self,
        name: &str,
        member_ids: &[Uuid],
        creator_id: Uuid,
    ) -> Result<Chat> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(ChatError::InvalidRequest("group name is required".into()));
        }
        if member_ids.is_empty() {
            return Err(ChatError::InvalidRequest(
                "group needs at least one member".into(),
            ));
        }

        // Dedupe while preserving the caller's ordering
        let mut members: Vec<Uuid> = Vec::with_capacity(member_ids.len() + 1);
        for &id in member_ids {
            if !members.contains(&id) {
                members.push(id);
            }
        }
        if !members.contains(&creator_id) {
            members.push(creator_id);
        }

        run_blocking(self.db.clone(), move |db| {
            let member_strings: Vec<String> = members.iter().map(Uuid::to_string).collect();
            let found = db.get_users_by_ids(&member_strings)?;
            if found.len() != member_strings.len() {
                return Err(ChatError::InvalidRequest(
                    "unknown user in member list".into(),
                ));
            }

            let id = Uuid::new_v4();
            let now = Utc::now();
            db.insert_chat(
                &id.to_string(),
                true,
                Some(&name),
                None,
                &member_strings,
                &now.to_rfc3339(),
            )?;
            info!("Created group chat {} '{}' ({} members)", id, name, members.len());

            Ok(Chat {
                id,
                is_group: true,
                name: Some(name),
                member_ids: members,
                created_at: now,
            })
        })
        .await
    }

    /// Authorization guard used before any chat mutation.
    /// Unknown chats simply answer `false`.
    pub async fn is_member(&self, chat_id: Uuid, user_id: Uuid) -> Result<bool> {
        run_blocking(self.db.clone(), move |db| {
            Ok(db.is_chat_member(&chat_id.to_string(), &user_id.to_string())?)
        })
        .await
    }

    /// All chats (private and group) containing the user, for the
    /// initial room subscription and the REST chat list.
    pub async fn load_chats_for_user(&self, user_id: Uuid) -> Result<Vec<Chat>> {
        run_blocking(self.db.clone(), move |db| {
            let rows = db.chats_for_user(&user_id.to_string())?;
            let chat_ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();

            let mut members_by_chat: HashMap<String, Vec<String>> = HashMap::new();
            for m in db.members_for_chats(&chat_ids)? {
                members_by_chat.entry(m.chat_id).or_default().push(m.user_id);
            }

            Ok(rows
                .into_iter()
                .map(|row| {
                    let member_ids = members_by_chat.remove(&row.id).unwrap_or_default();
                    chat_from_row(row, &member_ids)
                })
                .collect())
        })
        .await
    }
}

fn sorted_pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a <= b { (a, b) } else { (b, a) }
}

pub(crate) fn chat_from_row(row: ChatRow, member_ids: &[String]) -> Chat {
    let context = format!("chat '{}'", row.id);
    Chat {
        id: convert::parse_id(&row.id, "chat"),
        is_group: row.is_group,
        name: row.name,
        member_ids: member_ids
            .iter()
            .map(|m| convert::parse_id(m, &context))
            .collect(),
        created_at: convert::parse_timestamp(&row.created_at, &context),
    }
}
