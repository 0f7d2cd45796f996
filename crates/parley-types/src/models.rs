use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Public view of a user. The password hash never leaves parley-db.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub bio: String,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A conversation: private (exactly two members) or group (named).
/// Membership is fixed at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: Uuid,
    pub is_group: bool,
    pub name: Option<String>,
    pub member_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Chat {
    pub fn has_member(&self, user_id: Uuid) -> bool {
        self.member_ids.contains(&user_id)
    }
}

/// A message in a chat. Append-only; `read_by` only ever grows and
/// always contains the sender. At least one of `text` / `file_url` is
/// present (the store rejects empty messages).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub sender_username: String,
    pub text: Option<String>,
    pub file_url: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub read_by: Vec<Uuid>,
}

/// Online/offline state plus last-seen timestamp.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PresenceStatus {
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}
