use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use beach_bottle::message_log::Sender;
use beach_bottle::registry::SessionRegistry;
use beach_bottle::session::{PeerIdentity, SessionContext, SessionEvent};
use beach_bottle::storage::{FsStorage, PeerAddress};
use beach_bottle::transport::memory::MemoryNetwork;
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const RETRY: Duration = Duration::from_millis(100);

fn addr(value: &str) -> PeerAddress {
    PeerAddress::new(value).unwrap()
}

fn node(
    base: &Path,
    network: &MemoryNetwork,
    local: &str,
) -> (SessionRegistry, UnboundedReceiver<SessionEvent>) {
    let mut context = SessionContext::new(
        Arc::new(FsStorage::new(base, addr(local))),
        Arc::new(network.clone()),
    )
    .with_identity(PeerIdentity {
        username: local.to_string(),
        profile: json!({}),
    });
    context.retry_interval = RETRY;
    context.block_size = 2;
    SessionRegistry::new(context)
}

async fn wait_for<F>(events: &mut UnboundedReceiver<SessionEvent>, mut predicate: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("event stream open");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event arrives in time")
}

fn is_ready(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::SessionReady { .. })
}

fn is_received(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::MessageReceived { .. })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peers_rendezvous_through_shared_directory() {
    let medium = tempfile::tempdir().unwrap();
    let network = MemoryNetwork::new();
    let (mut alice, mut alice_events) = node(medium.path(), &network, "alice");
    let (mut bob, mut bob_events) = node(medium.path(), &network, "bob");

    alice.establish(addr("bob")).await.unwrap();
    bob.establish(addr("alice")).await.unwrap();
    wait_for(&mut alice_events, is_ready).await;
    wait_for(&mut bob_events, is_ready).await;

    let session = alice.get(&addr("bob")).expect("session registered");
    for text in ["one", "two", "three"] {
        session.send_message(json!(text)).await.unwrap();
        wait_for(&mut bob_events, is_received).await;
    }

    let history = bob.get(&addr("alice")).unwrap().history().await.unwrap();
    let bodies: Vec<_> = history.iter().map(|message| message.body.clone()).collect();
    assert_eq!(bodies, vec![json!("one"), json!("two"), json!("three")]);
    assert!(history.iter().all(|message| message.sender == Sender::Remote));
    assert_eq!(
        history
            .iter()
            .map(|message| (message.block, message.index))
            .collect::<Vec<_>>(),
        vec![(0, 0), (0, 1), (1, 0)]
    );

    // each side keeps its own copy under its own root
    assert!(medium.path().join("alice").exists());
    assert!(medium.path().join("bob").exists());

    alice.end_all().await;
    bob.end_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restarted_peer_recovers_history_on_reconnect() {
    let medium = tempfile::tempdir().unwrap();
    let network = MemoryNetwork::new();
    let (mut alice, mut alice_events) = node(medium.path(), &network, "alice");
    let (mut bob, mut bob_events) = node(medium.path(), &network, "bob");

    alice.establish(addr("bob")).await.unwrap();
    bob.establish(addr("alice")).await.unwrap();
    wait_for(&mut alice_events, is_ready).await;
    wait_for(&mut bob_events, is_ready).await;

    bob.get(&addr("alice"))
        .unwrap()
        .send_message(json!({"text": "before restart"}))
        .await
        .unwrap();
    wait_for(&mut alice_events, is_received).await;

    alice.end_all().await;
    drop(alice_events);

    let (mut alice, mut alice_events) = node(medium.path(), &network, "alice");
    alice.establish(addr("bob")).await.unwrap();
    let ready = wait_for(&mut alice_events, is_ready).await;
    match ready {
        SessionEvent::SessionReady { peer, history } => {
            assert_eq!(peer, addr("bob"));
            assert_eq!(history.len(), 1);
            assert_eq!(history[0].body, json!({"text": "before restart"}));
            assert_eq!(history[0].sender, Sender::Remote);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    alice.end_all().await;
    bob.end_all().await;
}
