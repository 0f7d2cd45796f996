use crate::Database;
use crate::models::{ChatMemberRow, ChatRow, MessageRow, ReadRow, UserRow};
use anyhow::{Result, anyhow};

impl Database {
    // -- Users --

    /// Timestamps are written explicitly as RFC 3339; the schema's
    /// datetime('now') default produces a naive format the API layers
    /// would have to special-case.
    pub fn create_user(&self, id: &str, username: &str, password_hash: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password, created_at) VALUES (?1, ?2, ?3, ?4)",
                (id, username, password_hash, chrono::Utc::now().to_rfc3339()),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{USER_SELECT} WHERE username = ?1"))?;
            let row = stmt.query_row([username], user_from_row).optional()?;
            Ok(row)
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{USER_SELECT} WHERE id = ?1"))?;
            let row = stmt.query_row([id], user_from_row).optional()?;
            Ok(row)
        })
    }

    /// Batch-fetch users by id; missing ids are simply absent from the result.
    pub fn get_users_by_ids(&self, ids: &[String]) -> Result<Vec<UserRow>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let sql = format!("{USER_SELECT} WHERE id IN ({})", placeholders(ids.len()));
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(ids.iter()), user_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn list_users_except(&self, id: &str) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("{USER_SELECT} WHERE id != ?1 ORDER BY username"))?;
            let rows = stmt
                .query_map([id], user_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Connect path: flip online, leave last_seen untouched.
    pub fn set_user_online(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            let n = conn.execute("UPDATE users SET online = 1 WHERE id = ?1", [id])?;
            if n == 0 {
                return Err(anyhow!("User not found: {}", id));
            }
            Ok(())
        })
    }

    /// Disconnect path: flip offline and stamp last_seen.
    pub fn set_user_offline(&self, id: &str, last_seen: &str) -> Result<()> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE users SET online = 0, last_seen = ?2 WHERE id = ?1",
                (id, last_seen),
            )?;
            if n == 0 {
                return Err(anyhow!("User not found: {}", id));
            }
            Ok(())
        })
    }

    // -- Chats --

    /// Insert a chat and its member list in one transaction.
    /// `pair_key` is the sorted id pair for private chats, None for groups.
    pub fn insert_chat(
        &self,
        id: &str,
        is_group: bool,
        name: Option<&str>,
        pair_key: Option<&str>,
        member_ids: &[String],
        created_at: &str,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO chats (id, is_group, name, pair_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id, is_group, name, pair_key, created_at],
            )?;
            for (position, user_id) in member_ids.iter().enumerate() {
                tx.execute(
                    "INSERT INTO chat_members (chat_id, user_id, position) VALUES (?1, ?2, ?3)",
                    rusqlite::params![id, user_id, position as i64],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_chat(&self, id: &str) -> Result<Option<ChatRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{CHAT_SELECT} WHERE id = ?1"))?;
            let row = stmt.query_row([id], chat_from_row).optional()?;
            Ok(row)
        })
    }

    pub fn find_private_chat(&self, pair_key: &str) -> Result<Option<ChatRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{CHAT_SELECT} WHERE pair_key = ?1"))?;
            let row = stmt.query_row([pair_key], chat_from_row).optional()?;
            Ok(row)
        })
    }

    pub fn chats_for_user(&self, user_id: &str) -> Result<Vec<ChatRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.is_group, c.name, c.created_at
                 FROM chats c
                 JOIN chat_members cm ON cm.chat_id = c.id
                 WHERE cm.user_id = ?1
                 ORDER BY c.rowid",
            )?;
            let rows = stmt
                .query_map([user_id], chat_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Batch-fetch the member lists for a set of chats, usernames resolved.
    pub fn members_for_chats(&self, chat_ids: &[String]) -> Result<Vec<ChatMemberRow>> {
        if chat_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT cm.chat_id, cm.user_id, u.username, cm.position
                 FROM chat_members cm
                 LEFT JOIN users u ON u.id = cm.user_id
                 WHERE cm.chat_id IN ({})
                 ORDER BY cm.chat_id, cm.position",
                placeholders(chat_ids.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(chat_ids.iter()), |row| {
                    Ok(ChatMemberRow {
                        chat_id: row.get(0)?,
                        user_id: row.get(1)?,
                        username: row.get::<_, Option<String>>(2)?.unwrap_or_else(|| "unknown".to_string()),
                        position: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn chat_member_ids(&self, chat_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM chat_members WHERE chat_id = ?1 ORDER BY position",
            )?;
            let rows = stmt
                .query_map([chat_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn is_chat_member(&self, chat_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM chat_members WHERE chat_id = ?1 AND user_id = ?2",
                    (chat_id, user_id),
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    // -- Messages --

    /// Insert a message with the sender pre-marked as having read it.
    pub fn insert_message(
        &self,
        id: &str,
        chat_id: &str,
        sender_id: &str,
        text: Option<&str>,
        file_url: Option<&str>,
        created_at: &str,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO messages (id, chat_id, sender_id, text, file_url, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![id, chat_id, sender_id, text, file_url, created_at],
            )?;
            tx.execute(
                "INSERT INTO message_reads (message_id, user_id) VALUES (?1, ?2)",
                (id, sender_id),
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Timestamp of the chat's newest message (by insertion order).
    pub fn last_message_timestamp(&self, chat_id: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let ts = conn
                .query_row(
                    "SELECT created_at FROM messages WHERE chat_id = ?1
                     ORDER BY rowid DESC LIMIT 1",
                    [chat_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(ts)
        })
    }

    /// Full history for a chat, oldest first, in insertion order.
    pub fn messages_for_chat(&self, chat_id: &str) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            // JOIN users to fetch sender_username in a single query (eliminates N+1)
            let mut stmt = conn.prepare(
                "SELECT m.id, m.chat_id, m.sender_id, u.username, m.text, m.file_url, m.created_at
                 FROM messages m
                 LEFT JOIN users u ON m.sender_id = u.id
                 WHERE m.chat_id = ?1
                 ORDER BY m.rowid",
            )?;
            let rows = stmt
                .query_map([chat_id], |row| {
                    Ok(MessageRow {
                        id: row.get(0)?,
                        chat_id: row.get(1)?,
                        sender_id: row.get(2)?,
                        sender_username: row.get::<_, Option<String>>(3)?.unwrap_or_else(|| "unknown".to_string()),
                        text: row.get(4)?,
                        file_url: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Batch-fetch read marks for a set of message IDs.
    pub fn reads_for_messages(&self, message_ids: &[String]) -> Result<Vec<ReadRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT message_id, user_id FROM message_reads WHERE message_id IN ({})",
                placeholders(message_ids.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(message_ids.iter()), |row| {
                    Ok(ReadRow {
                        message_id: row.get(0)?,
                        user_id: row.get(1)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Add `user_id` to the read set of each referenced message that
    /// belongs to `chat_id`. Idempotent; ids from other chats and
    /// unknown ids are skipped. Returns the ids actually updated.
    pub fn mark_messages_read(
        &self,
        chat_id: &str,
        user_id: &str,
        message_ids: &[String],
    ) -> Result<Vec<String>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut updated = Vec::new();
            for message_id in message_ids {
                let n = tx.execute(
                    "INSERT OR IGNORE INTO message_reads (message_id, user_id)
                     SELECT ?1, ?2
                     WHERE EXISTS (SELECT 1 FROM messages WHERE id = ?1 AND chat_id = ?3)",
                    rusqlite::params![message_id, user_id, chat_id],
                )?;
                if n > 0 {
                    updated.push(message_id.clone());
                }
            }
            tx.commit()?;
            Ok(updated)
        })
    }
}

const USER_SELECT: &str =
    "SELECT id, username, password, online, last_seen, bio, avatar_url, created_at FROM users";

const CHAT_SELECT: &str = "SELECT id, is_group, name, created_at FROM chats";

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        password: row.get(2)?,
        online: row.get(3)?,
        last_seen: row.get(4)?,
        bio: row.get(5)?,
        avatar_url: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn chat_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatRow> {
    Ok(ChatRow {
        id: row.get(0)?,
        is_group: row.get(1)?,
        name: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn placeholders(n: usize) -> String {
    (1..=n)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::Database;
    use tempfile::TempDir;

    fn open_db() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("parley.db")).unwrap();
        (dir, db)
    }

    fn seed_users(db: &Database, names: &[&str]) -> Vec<String> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let id = format!("00000000-0000-0000-0000-00000000000{}", i + 1);
                db.create_user(&id, name, "hash").unwrap();
                id
            })
            .collect()
    }

    #[test]
    fn migrations_are_idempotent_on_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("parley.db");
        {
            let db = Database::open(&path).unwrap();
            db.create_user("u1", "ada", "hash").unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert!(db.get_user_by_username("ada").unwrap().is_some());
    }

    #[test]
    fn created_at_is_stored_as_rfc3339() {
        let (_dir, db) = open_db();
        db.create_user("u1", "ada", "hash").unwrap();
        let user = db.get_user_by_username("ada").unwrap().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&user.created_at).is_ok());
    }

    #[test]
    fn duplicate_username_rejected() {
        let (_dir, db) = open_db();
        db.create_user("u1", "ada", "hash").unwrap();
        assert!(db.create_user("u2", "ada", "hash").is_err());
    }

    #[test]
    fn presence_flags_round_trip() {
        let (_dir, db) = open_db();
        let ids = seed_users(&db, &["ada"]);

        db.set_user_online(&ids[0]).unwrap();
        let user = db.get_user_by_id(&ids[0]).unwrap().unwrap();
        assert!(user.online);
        assert!(user.last_seen.is_none());

        db.set_user_offline(&ids[0], "2026-08-27T12:00:00Z").unwrap();
        let user = db.get_user_by_id(&ids[0]).unwrap().unwrap();
        assert!(!user.online);
        assert_eq!(user.last_seen.as_deref(), Some("2026-08-27T12:00:00Z"));
    }

    #[test]
    fn pair_key_is_unique() {
        let (_dir, db) = open_db();
        let ids = seed_users(&db, &["ada", "bob"]);

        db.insert_chat("c1", false, None, Some("a:b"), &ids, "2026-01-01T00:00:00Z")
            .unwrap();
        let err = db.insert_chat("c2", false, None, Some("a:b"), &ids, "2026-01-01T00:00:00Z");
        assert!(err.is_err());

        // Groups carry no pair_key and never collide
        db.insert_chat("c3", true, Some("team"), None, &ids, "2026-01-01T00:00:00Z")
            .unwrap();
        db.insert_chat("c4", true, Some("team"), None, &ids, "2026-01-01T00:00:00Z")
            .unwrap();
    }

    #[test]
    fn messages_keep_insertion_order_despite_timestamps() {
        let (_dir, db) = open_db();
        let ids = seed_users(&db, &["ada", "bob"]);
        db.insert_chat("c1", false, None, Some("k"), &ids, "2026-01-01T00:00:00Z")
            .unwrap();

        // Second message carries an *earlier* timestamp than the first
        db.insert_message("m1", "c1", &ids[0], Some("first"), None, "2026-01-01T00:00:10Z")
            .unwrap();
        db.insert_message("m2", "c1", &ids[1], Some("second"), None, "2026-01-01T00:00:05Z")
            .unwrap();

        let rows = db.messages_for_chat("c1").unwrap();
        let texts: Vec<_> = rows.iter().map(|r| r.text.as_deref().unwrap()).collect();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[test]
    fn sender_is_in_read_set_at_insert() {
        let (_dir, db) = open_db();
        let ids = seed_users(&db, &["ada", "bob"]);
        db.insert_chat("c1", false, None, Some("k"), &ids, "2026-01-01T00:00:00Z")
            .unwrap();
        db.insert_message("m1", "c1", &ids[0], Some("hi"), None, "2026-01-01T00:00:00Z")
            .unwrap();

        let reads = db.reads_for_messages(&["m1".to_string()]).unwrap();
        assert_eq!(reads.len(), 1);
        assert_eq!(reads[0].user_id, ids[0]);
    }

    #[test]
    fn mark_read_is_idempotent_and_scoped_to_chat() {
        let (_dir, db) = open_db();
        let ids = seed_users(&db, &["ada", "bob"]);
        db.insert_chat("c1", false, None, Some("k1"), &ids, "2026-01-01T00:00:00Z")
            .unwrap();
        db.insert_chat("c2", true, Some("team"), None, &ids, "2026-01-01T00:00:00Z")
            .unwrap();
        db.insert_message("m1", "c1", &ids[0], Some("hi"), None, "2026-01-01T00:00:00Z")
            .unwrap();
        db.insert_message("m2", "c2", &ids[0], Some("yo"), None, "2026-01-01T00:00:00Z")
            .unwrap();

        // m2 lives in another chat, "m9" does not exist: both skipped
        let requested = vec!["m1".to_string(), "m2".to_string(), "m9".to_string()];
        let updated = db.mark_messages_read("c1", &ids[1], &requested).unwrap();
        assert_eq!(updated, vec!["m1".to_string()]);

        // Re-marking is a no-op, not an error
        let updated = db.mark_messages_read("c1", &ids[1], &requested).unwrap();
        assert!(updated.is_empty());
    }

    #[test]
    fn chats_for_user_sees_private_and_group() {
        let (_dir, db) = open_db();
        let ids = seed_users(&db, &["ada", "bob", "eve"]);
        db.insert_chat("c1", false, None, Some("k"), &ids[..2], "2026-01-01T00:00:00Z")
            .unwrap();
        db.insert_chat("c2", true, Some("team"), None, &ids, "2026-01-01T00:00:00Z")
            .unwrap();

        let chats = db.chats_for_user(&ids[0]).unwrap();
        assert_eq!(chats.len(), 2);
        let chats = db.chats_for_user(&ids[2]).unwrap();
        assert_eq!(chats.len(), 1);
        assert!(chats[0].is_group);

        assert!(db.is_chat_member("c1", &ids[0]).unwrap());
        assert!(!db.is_chat_member("c1", &ids[2]).unwrap());
    }
}
