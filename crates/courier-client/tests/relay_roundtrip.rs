//! End-to-end: two messengers talking through an in-process relay.

use std::sync::Arc;
use std::time::Duration;

use courier_client::{ClientConfig, ConnectionState, Messenger, PeerState};
use courier_server::api::{self, AppState};
use courier_server::{HubSettings, RelayHub, ServerConfig};
use courier_shared::UserId;
use courier_store::{OutboxStatus, ViewEntry};

async fn start_relay() -> String {
    let config = ServerConfig::default();
    let hub = Arc::new(RelayHub::in_memory(HubSettings::from(&config)).unwrap());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(api::serve_listener(AppState::new(hub, config), listener));
    format!("ws://{addr}/ws")
}

fn client_config(url: &str, user: &str, dir: &tempfile::TempDir) -> ClientConfig {
    let mut config = ClientConfig::new(url, UserId::new(user));
    config.db_path = Some(dir.path().join(format!("{user}.db")));
    config.send_delay = Duration::ZERO;
    config.request_timeout = Duration::from_secs(5);
    config.reconnect_base_delay = Duration::from_millis(50);
    config.reconnect_max_delay = Duration::from_millis(200);
    config
}

/// Poll `check` until it yields a value or ten seconds pass.
async fn eventually<T>(what: &str, mut check: impl FnMut() -> Option<T>) -> T {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(value) = check() {
            return value;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn confirmed_contents(view: &[ViewEntry]) -> Vec<String> {
    view.iter()
        .filter_map(|entry| match entry {
            ViewEntry::Confirmed(m) => Some(m.content.clone()),
            ViewEntry::Pending(_) => None,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_message_to_offline_peer_arrives_on_connect() {
    let url = start_relay().await;
    let dir = tempfile::tempdir().unwrap();
    let bob_id = UserId::new("bob");

    let alice = Messenger::start(client_config(&url, "alice", &dir))
        .await
        .unwrap();
    let queued = alice.send_message(&bob_id, "hi").unwrap();
    assert_eq!(queued.status, OutboxStatus::Pending);

    let sent = eventually("alice's message to be confirmed", || {
        alice
            .outbox()
            .unwrap()
            .into_iter()
            .find(|m| m.client_id == queued.client_id && m.status == OutboxStatus::Sent)
    })
    .await;
    let conversation_id = sent.conversation_id.clone().unwrap();

    // Bob was never connected; the relay kept the message for his first sync.
    let bob = Messenger::start(client_config(&url, "bob", &dir))
        .await
        .unwrap();
    let view = eventually("bob to fetch the missed message", || {
        let view = bob.conversation_view(&conversation_id).ok()?;
        (!view.is_empty()).then_some(view)
    })
    .await;
    assert_eq!(confirmed_contents(&view), vec!["hi".to_string()]);

    let ViewEntry::Confirmed(received) = &view[0] else {
        panic!("expected a confirmed message");
    };
    assert_eq!(received.client_id.as_ref(), Some(&queued.client_id));
    assert!(received.server_timestamp > 0);
    let conversation = eventually("bob's cursor to reach the message", || {
        let conversation = bob.conversation_with(&UserId::new("alice")).ok()??;
        (conversation.sync_cursor == received.server_timestamp).then_some(conversation)
    })
    .await;
    assert_eq!(conversation.id, conversation_id);

    // Both online now: the next message is pushed live.
    alice.send_message(&bob_id, "are you there?").unwrap();
    eventually("live delivery to bob", || {
        let view = bob.conversation_view(&conversation_id).ok()?;
        (confirmed_contents(&view).len() == 2).then_some(())
    })
    .await;

    // Alice saw bob come online.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while alice.presence_of(&bob_id).await.state != PeerState::Online {
        assert!(tokio::time::Instant::now() < deadline, "bob never showed online");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Exactly one bubble per message on the sender's side.
    let alice_view = eventually("alice's second message to be confirmed", || {
        let view = alice.conversation_view(&conversation_id).ok()?;
        (confirmed_contents(&view).len() == 2).then_some(view)
    })
    .await;
    assert_eq!(alice_view.len(), 2);
    assert_eq!(confirmed_contents(&alice_view), vec!["hi", "are you there?"]);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_outbox_survives_restart_while_offline() {
    // A port nobody listens on.
    let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_url = format!("ws://{}/ws", dead.local_addr().unwrap());
    drop(dead);

    let dir = tempfile::tempdir().unwrap();
    let bob_id = UserId::new("bob");

    let mut offline = client_config(&dead_url, "alice", &dir);
    offline.reconnect_attempts = 1;
    let alice = Messenger::start(offline).await.unwrap();
    let queued = alice.send_message(&bob_id, "written offline").unwrap();

    eventually("the transport to give up", || {
        matches!(alice.connection_state(), ConnectionState::Unreachable { .. }).then_some(())
    })
    .await;
    let outbox = alice.outbox().unwrap();
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].status, OutboxStatus::Pending);
    assert_eq!(outbox[0].retry_count, 0);
    alice.shutdown().await;
    drop(alice);

    // Same database, reachable relay.
    let url = start_relay().await;
    let alice = Messenger::start(client_config(&url, "alice", &dir))
        .await
        .unwrap();
    let sent = eventually("the queued message to be delivered", || {
        alice
            .outbox()
            .unwrap()
            .into_iter()
            .find(|m| m.client_id == queued.client_id && m.status == OutboxStatus::Sent)
    })
    .await;

    let view = alice
        .conversation_view(&sent.conversation_id.unwrap())
        .unwrap();
    assert_eq!(confirmed_contents(&view), vec!["written offline"]);

    alice.shutdown().await;
}
