/// Database row types — these map directly to SQLite rows.
/// Distinct from parley-types API models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub online: bool,
    pub last_seen: Option<String>,
    pub bio: String,
    pub avatar_url: Option<String>,
    pub created_at: String,
}

pub struct ChatRow {
    pub id: String,
    pub is_group: bool,
    pub name: Option<String>,
    pub created_at: String,
}

pub struct ChatMemberRow {
    pub chat_id: String,
    pub user_id: String,
    pub username: String,
    pub position: i64,
}

pub struct MessageRow {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub sender_username: String,
    pub text: Option<String>,
    pub file_url: Option<String>,
    pub created_at: String,
}

pub struct ReadRow {
    pub message_id: String,
    pub user_id: String,
}
