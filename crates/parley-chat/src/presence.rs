use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use parley_db::Database;
use parley_types::models::PresenceStatus;

use crate::convert;
use crate::error::{ChatError, Result};
use crate::run_blocking;

/// Persists the online flag and last-seen timestamp. Connection handles
/// live in the gateway's registry, not here; with one active connection
/// per user, a disconnect from either of two superseding sessions flips
/// the user offline (last-writer-wins).
pub struct PresenceTracker {
    db: Arc<Database>,
}

impl PresenceTracker {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Mark the user online. Leaves last_seen untouched; idempotent.
    pub async fn on_connect(&self, user_id: Uuid) -> Result<()> {
        run_blocking(self.db.clone(), move |db| {
            let key = user_id.to_string();
            if db.get_user_by_id(&key)?.is_none() {
                return Err(ChatError::NotFound);
            }
            db.set_user_online(&key)?;
            Ok(())
        })
        .await
    }

    /// Mark the user offline and stamp last_seen with the current time.
    pub async fn on_disconnect(&self, user_id: Uuid) -> Result<()> {
        let now = Utc::now();
        run_blocking(self.db.clone(), move |db| {
            let key = user_id.to_string();
            if db.get_user_by_id(&key)?.is_none() {
                return Err(ChatError::NotFound);
            }
            db.set_user_offline(&key, &now.to_rfc3339())?;
            Ok(())
        })
        .await
    }

    pub async fn status(&self, user_id: Uuid) -> Result<PresenceStatus> {
        run_blocking(self.db.clone(), move |db| {
            let user = db
                .get_user_by_id(&user_id.to_string())?
                .ok_or(ChatError::NotFound)?;
            let context = format!("user '{}'", user.id);
            Ok(PresenceStatus {
                online: user.online,
                last_seen: user
                    .last_seen
                    .map(|raw| convert::parse_timestamp(&raw, &context)),
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, PresenceTracker, Uuid) {
        let tmp = TempDir::new().unwrap();
        let db = Arc::new(Database::open(&tmp.path().join("parley.db")).unwrap());
        let user_id = Uuid::new_v4();
        db.create_user(&user_id.to_string(), "ada", "hash").unwrap();
        (tmp, PresenceTracker::new(db), user_id)
    }

    #[tokio::test]
    async fn repeated_connects_stay_online() {
        let (_tmp, presence, user_id) = setup();

        presence.on_connect(user_id).await.unwrap();
        presence.on_connect(user_id).await.unwrap();

        let status = presence.status(user_id).await.unwrap();
        assert!(status.online);
        assert!(status.last_seen.is_none());
    }

    #[tokio::test]
    async fn disconnect_stamps_monotonic_last_seen() {
        let (_tmp, presence, user_id) = setup();

        presence.on_connect(user_id).await.unwrap();
        presence.on_disconnect(user_id).await.unwrap();
        let first = presence.status(user_id).await.unwrap();
        assert!(!first.online);
        let first_seen = first.last_seen.unwrap();

        presence.on_disconnect(user_id).await.unwrap();
        let second = presence.status(user_id).await.unwrap();
        assert!(second.last_seen.unwrap() >= first_seen);
    }

    #[tokio::test]
    async fn reconnect_keeps_last_seen() {
        let (_tmp, presence, user_id) = setup();

        presence.on_connect(user_id).await.unwrap();
        presence.on_disconnect(user_id).await.unwrap();
        let seen = presence.status(user_id).await.unwrap().last_seen.unwrap();

        presence.on_connect(user_id).await.unwrap();
        let status = presence.status(user_id).await.unwrap();
        assert!(status.online);
        assert_eq!(status.last_seen.unwrap(), seen);
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let (_tmp, presence, _user_id) = setup();
        let err = presence.on_connect(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound));
    }
}
