use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast, mpsc};
use uuid::Uuid;

use parley_types::events::ServerEvent;

/// Connection registry and room router: tracks every connected session
/// and fans events out to them. Populated on connect, pruned on
/// disconnect; injected into the session loop and the REST layer
/// rather than living in ambient globals.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Broadcast channel for gateway events — every connection receives
    /// the stream and filters chat-scoped events against its own
    /// subscription set
    broadcast_tx: broadcast::Sender<ServerEvent>,

    /// Currently online users: user_id -> username
    online_users: RwLock<HashMap<Uuid, String>>,

    /// Per-user targeted send channels: user_id -> (conn_id, sender).
    /// One active connection per user; a later connection supersedes
    /// the earlier entry.
    user_channels: RwLock<HashMap<Uuid, (Uuid, mpsc::UnboundedSender<ServerEvent>)>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                online_users: RwLock::new(HashMap::new()),
                user_channels: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to the gateway event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Broadcast an event to all connected clients, best-effort.
    pub fn broadcast(&self, event: ServerEvent) {
        let _ = self.inner.broadcast_tx.send(event);
    }

    /// Register a per-user targeted channel. Returns (conn_id, receiver).
    pub async fn register_user_channel(
        &self,
        user_id: Uuid,
    ) -> (Uuid, mpsc::UnboundedReceiver<ServerEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .user_channels
            .write()
            .await
            .insert(user_id, (conn_id, tx));
        (conn_id, rx)
    }

    /// Send a targeted event to a specific user's active connection.
    pub async fn send_to_user(&self, user_id: Uuid, event: ServerEvent) {
        let channels = self.inner.user_channels.read().await;
        if let Some((_, tx)) = channels.get(&user_id) {
            let _ = tx.send(event);
        }
    }

    /// Register a user as online and tell everyone.
    pub async fn user_online(&self, user_id: Uuid, username: String) {
        self.inner
            .online_users
            .write()
            .await
            .insert(user_id, username.clone());

        self.broadcast(ServerEvent::Presence {
            user_id,
            username,
            online: true,
        });
    }

    /// Register a user as offline and tell everyone. The offline
    /// broadcast is unconditional (either of two superseding sessions
    /// disconnecting flips the user offline), but the targeted channel
    /// is only pruned when this connection still owns it, so a newer
    /// connection's channel is never torn down by the old one.
    pub async fn user_offline(&self, user_id: Uuid, username: String, conn_id: Uuid) {
        self.inner.online_users.write().await.remove(&user_id);

        let mut channels = self.inner.user_channels.write().await;
        if let Some((stored_conn_id, _)) = channels.get(&user_id)
            && *stored_conn_id == conn_id
        {
            channels.remove(&user_id);
        }
        drop(channels);

        self.broadcast(ServerEvent::Presence {
            user_id,
            username,
            online: false,
        });
    }

    /// Snapshot of currently online users.
    pub async fn online_users(&self) -> Vec<(Uuid, String)> {
        self.inner
            .online_users
            .read()
            .await
            .iter()
            .map(|(id, name)| (*id, name.clone()))
            .collect()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn presence_broadcasts_reach_every_subscriber() {
        let dispatcher = Dispatcher::new();
        let mut rx_a = dispatcher.subscribe();
        let mut rx_b = dispatcher.subscribe();

        let user_id = Uuid::new_v4();
        dispatcher.user_online(user_id, "ada".into()).await;

        for rx in [&mut rx_a, &mut rx_b] {
            match rx.recv().await.unwrap() {
                ServerEvent::Presence { user_id: uid, online, .. } => {
                    assert_eq!(uid, user_id);
                    assert!(online);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn targeted_send_reaches_only_that_user() {
        let dispatcher = Dispatcher::new();
        let ada = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (_conn_a, mut rx_a) = dispatcher.register_user_channel(ada).await;
        let (_conn_b, mut rx_b) = dispatcher.register_user_channel(bob).await;

        dispatcher
            .send_to_user(ada, ServerEvent::Ready { user_id: ada, username: "ada".into() })
            .await;

        assert!(matches!(rx_a.recv().await, Some(ServerEvent::Ready { .. })));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_disconnect_does_not_prune_superseding_channel() {
        let dispatcher = Dispatcher::new();
        let ada = Uuid::new_v4();

        let (old_conn, _old_rx) = dispatcher.register_user_channel(ada).await;
        let (_new_conn, mut new_rx) = dispatcher.register_user_channel(ada).await;

        // The old connection disconnecting must not remove the new channel
        dispatcher.user_offline(ada, "ada".into(), old_conn).await;

        dispatcher
            .send_to_user(ada, ServerEvent::Ready { user_id: ada, username: "ada".into() })
            .await;
        assert!(matches!(new_rx.recv().await, Some(ServerEvent::Ready { .. })));

        // But the user still reads as offline (last-writer-wins presence)
        assert!(dispatcher.online_users().await.is_empty());
    }
}
