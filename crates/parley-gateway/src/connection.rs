use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_chat::{ChatDirectory, MessageStore, PresenceTracker};
use parley_types::api::Claims;
use parley_types::events::{ClientCommand, ServerEvent};

use crate::dispatcher::Dispatcher;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How long a fresh connection gets to present its Identify token.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Domain collaborators handed to every session.
#[derive(Clone)]
pub struct GatewayServices {
    pub directory: Arc<ChatDirectory>,
    pub store: Arc<MessageStore>,
    pub presence: Arc<PresenceTracker>,
}

/// Chat-scoped events only reach connections subscribed to that chat;
/// everything else (presence, ready) is global.
pub fn should_deliver(event: &ServerEvent, subscribed: &HashSet<Uuid>) -> bool {
    match event.chat_id() {
        Some(chat_id) => subscribed.contains(&chat_id),
        None => true,
    }
}

/// Drive a single WebSocket session: Unauthenticated -> Authenticated
/// -> Closed. Closing is terminal; a reconnect builds a fresh session.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    services: GatewayServices,
    jwt_secret: String,
) {
    let (mut sender, mut receiver) = socket.split();

    // Step 1: Wait for Identify command with JWT. Failure closes the
    // socket with nothing emitted.
    let (user_id, username) = match wait_for_identify(&mut receiver, &jwt_secret).await {
        Some(identity) => identity,
        None => {
            warn!("WebSocket client failed to identify, closing");
            return;
        }
    };

    // A token for a user the store no longer knows is treated the same
    // as a failed handshake.
    if let Err(e) = services.presence.on_connect(user_id).await {
        warn!("{} ({}) presence on_connect failed: {}, closing", username, user_id, e);
        return;
    }

    info!("{} ({}) connected to gateway", username, user_id);

    // Step 2: Send Ready event
    let ready = ServerEvent::Ready {
        user_id,
        username: username.clone(),
    };
    if sender
        .send(Message::Text(serde_json::to_string(&ready).unwrap().into()))
        .await
        .is_err()
    {
        return;
    }

    // Seed the subscription set with every chat the user belongs to
    let subscribed_chats: Arc<std::sync::RwLock<HashSet<Uuid>>> = match services
        .directory
        .load_chats_for_user(user_id)
        .await
    {
        Ok(chats) => Arc::new(std::sync::RwLock::new(
            chats.iter().map(|c| c.id).collect(),
        )),
        Err(e) => {
            warn!("{} ({}) failed to load chats: {}, closing", username, user_id, e);
            return;
        }
    };

    // Register per-user channel, then show this client who is already here
    let (conn_id, mut user_rx) = dispatcher.register_user_channel(user_id).await;

    for (uid, uname) in dispatcher.online_users().await {
        let event = ServerEvent::Presence {
            user_id: uid,
            username: uname,
            online: true,
        };
        if sender
            .send(Message::Text(serde_json::to_string(&event).unwrap().into()))
            .await
            .is_err()
        {
            return;
        }
    }

    // Now mark ourselves online (broadcasts to everyone else)
    dispatcher.user_online(user_id, username.clone()).await;

    let mut broadcast_rx = dispatcher.subscribe();
    let send_subscriptions = subscribed_chats.clone();

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward broadcasts + targeted events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(RecvError::Lagged(n)) => {
                            warn!("Broadcast receiver lagged by {} events", n);
                            continue;
                        }
                        Err(_) => break,
                    };

                    {
                        let subs = send_subscriptions.read()
                            .expect("subscription lock poisoned");
                        if !should_deliver(&event, &subs) {
                            continue;
                        }
                    }

                    if sender
                        .send(Message::Text(serde_json::to_string(&event).unwrap().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                result = user_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };

                    if sender
                        .send(Message::Text(serde_json::to_string(&event).unwrap().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let dispatcher_recv = dispatcher.clone();
    let services_recv = services.clone();
    let username_recv = username.clone();
    let recv_subscriptions = subscribed_chats.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(
                            &dispatcher_recv,
                            &services_recv,
                            user_id,
                            &username_recv,
                            cmd,
                            &recv_subscriptions,
                        )
                        .await;
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            username_recv,
                            user_id,
                            e,
                            truncate_for_log(&text, 200)
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Closed: flip presence, tell everyone, prune the registry entry
    if let Err(e) = services.presence.on_disconnect(user_id).await {
        warn!("{} ({}) presence on_disconnect failed: {}", username, user_id, e);
    }
    dispatcher.user_offline(user_id, username.clone(), conn_id).await;
    info!("{} ({}) disconnected from gateway", username, user_id);
}

/// Byte-truncate for logs without splitting a multibyte character.
fn truncate_for_log(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

async fn wait_for_identify(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<(Uuid, String)> {
    use jsonwebtoken::{DecodingKey, Validation, decode};

    let timeout = tokio::time::timeout(IDENTIFY_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(ClientCommand::Identify { token }) =
                    serde_json::from_str::<ClientCommand>(&text)
                {
                    let token_data = decode::<Claims>(
                        &token,
                        &DecodingKey::from_secret(jwt_secret.as_bytes()),
                        &Validation::default(),
                    )
                    .ok()?;

                    return Some((token_data.claims.sub, token_data.claims.username));
                }
            }
        }
        None
    });

    timeout.await.ok().flatten()
}

/// Dispatch one client intent. Validation and membership failures are
/// silently dropped (debug-logged only): no error event goes back to
/// the client and nothing is broadcast.
async fn handle_command(
    dispatcher: &Dispatcher,
    services: &GatewayServices,
    user_id: Uuid,
    username: &str,
    cmd: ClientCommand,
    subscriptions: &Arc<std::sync::RwLock<HashSet<Uuid>>>,
) {
    match cmd {
        ClientCommand::Identify { .. } => {} // Already handled

        ClientCommand::JoinPrivateChat { other_user_id } => {
            let chat = match services
                .directory
                .find_or_create_private_chat(user_id, other_user_id)
                .await
            {
                Ok(chat) => chat,
                Err(e) => {
                    debug!("{} ({}) join-private-chat dropped: {}", username, user_id, e);
                    return;
                }
            };

            subscriptions
                .write()
                .expect("subscription lock poisoned")
                .insert(chat.id);

            match services.store.list_messages(chat.id).await {
                Ok(messages) => {
                    dispatcher
                        .send_to_user(
                            user_id,
                            ServerEvent::ChatMessages {
                                chat_id: chat.id,
                                messages,
                            },
                        )
                        .await;
                }
                Err(e) => {
                    debug!("{} ({}) history load dropped: {}", username, user_id, e);
                }
            }
        }

        ClientCommand::JoinChat { chat_id } => {
            match services.directory.is_member(chat_id, user_id).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("{} ({}) join-chat {} dropped: not a member", username, user_id, chat_id);
                    return;
                }
                Err(e) => {
                    debug!("{} ({}) join-chat dropped: {}", username, user_id, e);
                    return;
                }
            }

            subscriptions
                .write()
                .expect("subscription lock poisoned")
                .insert(chat_id);

            match services.store.list_messages(chat_id).await {
                Ok(messages) => {
                    dispatcher
                        .send_to_user(user_id, ServerEvent::ChatMessages { chat_id, messages })
                        .await;
                }
                Err(e) => {
                    debug!("{} ({}) history load dropped: {}", username, user_id, e);
                }
            }
        }

        ClientCommand::SendMessage {
            chat_id,
            text,
            file_url,
        } => {
            match services
                .store
                .append_message(chat_id, user_id, text, file_url)
                .await
            {
                Ok(message) => {
                    dispatcher.broadcast(ServerEvent::NewMessage { message });
                }
                Err(e) => {
                    debug!("{} ({}) send-message dropped: {}", username, user_id, e);
                }
            }
        }

        ClientCommand::ReadMessages {
            chat_id,
            message_ids,
        } => {
            match services.store.mark_read(chat_id, user_id, &message_ids).await {
                // Broadcast the requested ids even when nothing changed,
                // so clients converge on a no-op re-mark
                Ok(_updated) => {
                    dispatcher.broadcast(ServerEvent::ReadUpdate {
                        chat_id,
                        message_ids,
                        user_id,
                    });
                }
                Err(e) => {
                    debug!("{} ({}) read-messages dropped: {}", username, user_id, e);
                }
            }
        }

        ClientCommand::Leave { chat_id } => {
            subscriptions
                .write()
                .expect("subscription lock poisoned")
                .remove(&chat_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_types::models::Message as ChatMessage;

    fn message_event(chat_id: Uuid) -> ServerEvent {
        ServerEvent::NewMessage {
            message: ChatMessage {
                id: Uuid::new_v4(),
                chat_id,
                sender_id: Uuid::new_v4(),
                sender_username: "ada".into(),
                text: Some("hi".into()),
                file_url: None,
                timestamp: chrono::Utc::now(),
                read_by: vec![],
            },
        }
    }

    #[test]
    fn chat_events_filtered_by_subscription() {
        let chat_a = Uuid::new_v4();
        let chat_b = Uuid::new_v4();
        let subs: HashSet<Uuid> = [chat_a].into_iter().collect();

        assert!(should_deliver(&message_event(chat_a), &subs));
        assert!(!should_deliver(&message_event(chat_b), &subs));
    }

    #[test]
    fn log_truncation_respects_char_boundaries() {
        // 2-byte chars, so an odd cutoff lands mid-character
        let long = "é".repeat(150);
        let cut = truncate_for_log(&long, 199);
        assert!(cut.len() <= 199);
        assert!(long.starts_with(cut));

        assert_eq!(truncate_for_log("short", 200), "short");
    }

    #[test]
    fn presence_always_delivered() {
        let subs = HashSet::new();
        let event = ServerEvent::Presence {
            user_id: Uuid::new_v4(),
            username: "ada".into(),
            online: false,
        };
        assert!(should_deliver(&event, &subs));
    }
}
