//! End-to-end delivery flow over the real components: directory +
//! store + dispatcher, with subscription filtering as the session loop
//! applies it.

use std::collections::HashSet;
use std::sync::Arc;

use tempfile::TempDir;
use uuid::Uuid;

use parley_chat::{ChatDirectory, MessageStore, PresenceTracker};
use parley_db::Database;
use parley_gateway::connection::should_deliver;
use parley_gateway::dispatcher::Dispatcher;
use parley_types::events::ServerEvent;

struct Harness {
    _tmp: TempDir,
    db: Arc<Database>,
    directory: ChatDirectory,
    store: MessageStore,
    presence: PresenceTracker,
    dispatcher: Dispatcher,
}

fn harness() -> Harness {
    let tmp = TempDir::new().unwrap();
    let db = Arc::new(Database::open(&tmp.path().join("parley.db")).unwrap());
    Harness {
        _tmp: tmp,
        db: db.clone(),
        directory: ChatDirectory::new(db.clone()),
        store: MessageStore::new(db.clone()),
        presence: PresenceTracker::new(db),
        dispatcher: Dispatcher::new(),
    }
}

fn create_user(h: &Harness, name: &str) -> Uuid {
    let id = Uuid::new_v4();
    h.db.create_user(&id.to_string(), name, "hash").unwrap();
    id
}

#[tokio::test]
async fn private_chat_flow_from_join_to_read_update() {
    let h = harness();
    let ada = create_user(&h, "ada");
    let bob = create_user(&h, "bob");

    h.presence.on_connect(ada).await.unwrap();
    h.presence.on_connect(bob).await.unwrap();

    let mut ada_rx = h.dispatcher.subscribe();
    let mut bob_rx = h.dispatcher.subscribe();

    // Ada opens the private chat with Bob: one chat, empty history
    let chat = h
        .directory
        .find_or_create_private_chat(ada, bob)
        .await
        .unwrap();
    assert!(h.store.list_messages(chat.id).await.unwrap().is_empty());
    assert_eq!(h.directory.load_chats_for_user(bob).await.unwrap().len(), 1);

    let bob_subs: HashSet<Uuid> = [chat.id].into_iter().collect();

    // Ada sends "hello"
    let message = h
        .store
        .append_message(chat.id, ada, Some("hello".into()), None)
        .await
        .unwrap();
    h.dispatcher.broadcast(ServerEvent::NewMessage {
        message: message.clone(),
    });

    // Bob's subscribed connection receives it
    let event = bob_rx.recv().await.unwrap();
    assert!(should_deliver(&event, &bob_subs));
    match &event {
        ServerEvent::NewMessage { message: received } => {
            assert_eq!(received.text.as_deref(), Some("hello"));
            assert_eq!(received.sender_id, ada);
            assert_eq!(received.read_by, vec![ada]);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // Bob marks it read; both sides get the ReadUpdate
    let updated = h.store.mark_read(chat.id, bob, &[message.id]).await.unwrap();
    assert_eq!(updated, vec![message.id]);
    h.dispatcher.broadcast(ServerEvent::ReadUpdate {
        chat_id: chat.id,
        message_ids: vec![message.id],
        user_id: bob,
    });

    // Ada saw the NewMessage then the ReadUpdate
    assert!(matches!(
        ada_rx.recv().await.unwrap(),
        ServerEvent::NewMessage { .. }
    ));
    match ada_rx.recv().await.unwrap() {
        ServerEvent::ReadUpdate { chat_id, message_ids, user_id } => {
            assert_eq!(chat_id, chat.id);
            assert_eq!(message_ids, vec![message.id]);
            assert_eq!(user_id, bob);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(matches!(
        bob_rx.recv().await.unwrap(),
        ServerEvent::ReadUpdate { .. }
    ));

    // The read set converged to {ada, bob}
    let history = h.store.list_messages(chat.id).await.unwrap();
    assert_eq!(history.len(), 1);
    let read_by = &history[0].read_by;
    assert!(read_by.contains(&ada) && read_by.contains(&bob));
}

#[tokio::test]
async fn events_do_not_leak_across_chats() {
    let h = harness();
    let ada = create_user(&h, "ada");
    let bob = create_user(&h, "bob");
    let eve = create_user(&h, "eve");

    let ab = h.directory.find_or_create_private_chat(ada, bob).await.unwrap();
    let ae = h.directory.find_or_create_private_chat(ada, eve).await.unwrap();

    // Bob is subscribed to the ada/bob chat only
    let bob_subs: HashSet<Uuid> = [ab.id].into_iter().collect();
    let eve_subs: HashSet<Uuid> = [ae.id].into_iter().collect();

    let message = h
        .store
        .append_message(ae.id, ada, Some("for eve".into()), None)
        .await
        .unwrap();
    let event = ServerEvent::NewMessage { message };

    assert!(!should_deliver(&event, &bob_subs));
    assert!(should_deliver(&event, &eve_subs));
}
