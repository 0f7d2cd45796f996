use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            online      INTEGER NOT NULL DEFAULT 0,
            last_seen   TEXT,
            bio         TEXT NOT NULL DEFAULT '',
            avatar_url  TEXT,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- pair_key is the sorted 'a:b' id pair for private chats, NULL
        -- for groups. The UNIQUE constraint is the durable backstop for
        -- one-private-chat-per-pair; the directory lock is the fast path.
        CREATE TABLE IF NOT EXISTS chats (
            id          TEXT PRIMARY KEY,
            is_group    INTEGER NOT NULL DEFAULT 0,
            name        TEXT,
            pair_key    TEXT UNIQUE,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS chat_members (
            chat_id     TEXT NOT NULL REFERENCES chats(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            position    INTEGER NOT NULL,
            UNIQUE(chat_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_chat_members_user
            ON chat_members(user_id);

        -- Display order is insertion order (rowid), never created_at:
        -- equal or skewed timestamps must not reorder a chat's history.
        CREATE TABLE IF NOT EXISTS messages (
            id          TEXT PRIMARY KEY,
            chat_id     TEXT NOT NULL REFERENCES chats(id),
            sender_id   TEXT NOT NULL REFERENCES users(id),
            text        TEXT,
            file_url    TEXT,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_chat
            ON messages(chat_id);

        CREATE TABLE IF NOT EXISTS message_reads (
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(message_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_message_reads_message
            ON message_reads(message_id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
