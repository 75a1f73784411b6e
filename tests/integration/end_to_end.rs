// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::cast_possible_truncation
)]

//! End-to-end tests: two Supervisors talking through an in-process relay
//! over real WebSockets.

use std::time::Duration;

use relaywire::events::{Event, EventKind};
use relaywire::supervisor::{Supervisor, SupervisorConfig};
use relaywire::transfer::{TransferDirection, TransferState, TransferUpdate};
use relaywire::transport::ws::WsConnector;
use relaywire_proto::frame::MessageKind;
use tokio::sync::mpsc;

type Client = Supervisor<WsConnector>;

const WAIT: Duration = Duration::from_secs(10);

async fn start_relay() -> (String, tokio::task::JoinHandle<()>) {
    let (addr, handle) = relaywire_relay::relay::start_server("127.0.0.1:0")
        .await
        .expect("failed to start relay");
    (format!("ws://{addr}/ws"), handle)
}

fn client(url: &str, username: &str) -> Client {
    let connector = WsConnector::new(url, Duration::from_secs(5)).unwrap();
    Supervisor::new(SupervisorConfig::new(username), connector)
}

/// Forward every event of `kind` into a channel.
fn collect(client: &Client, kind: EventKind) -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.subscribe(kind, move |event| {
        let _ = tx.send(event.clone());
    });
    rx
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Poll until both sides hold a session key for each other.
async fn wait_for_keys(alice: &Client, bob: &Client) {
    tokio::time::timeout(WAIT, async {
        loop {
            if alice.keys().session_key_for("bob").is_some()
                && bob.keys().session_key_for("alice").is_some()
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("key exchange did not complete");
}

/// Skip user-list events until one matches `expected`.
async fn wait_for_users(rx: &mut mpsc::UnboundedReceiver<Event>, expected: &[&str]) {
    loop {
        if let Event::UserListUpdated { users } = next_event(rx).await {
            if users == expected {
                return;
            }
        }
    }
}

async fn connected_pair(url: &str) -> (Client, Client) {
    let alice = client(url, "alice");
    let bob = client(url, "bob");
    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    wait_for_keys(&alice, &bob).await;
    (alice, bob)
}

#[tokio::test]
async fn sealed_message_reaches_only_its_recipient() {
    let (url, _relay) = start_relay().await;
    let (alice, bob) = connected_pair(&url).await;

    let carol = client(&url, "carol");
    let mut carol_failures = collect(&carol, EventKind::DecryptionFailed);
    let mut carol_messages = collect(&carol, EventKind::MessageReceived);
    carol.connect().await.unwrap();
    tokio::time::timeout(WAIT, async {
        while alice.keys().session_key_for("carol").is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("carol never joined");

    let mut bob_messages = collect(&bob, EventKind::MessageReceived);
    alice.send_direct("bob", "hello").await.unwrap();

    assert_eq!(
        next_event(&mut bob_messages).await,
        Event::MessageReceived {
            from: "alice".into(),
            text: "hello".into(),
            kind: MessageKind::User,
            direct: true,
        }
    );

    // Carol sees the envelope on the wire but it is not addressed to her.
    alice.send_message("done").await.unwrap();
    let Event::MessageReceived { text, direct, .. } = next_event(&mut carol_messages).await else {
        panic!("expected a message");
    };
    assert_eq!(text, "done");
    assert!(!direct);
    assert!(carol_failures.try_recv().is_err());

    for c in [alice, bob, carol] {
        c.close().await;
    }
}

#[tokio::test]
async fn plaintext_chat_carries_relay_stamped_sender() {
    let (url, _relay) = start_relay().await;
    let (alice, bob) = connected_pair(&url).await;
    let mut bob_messages = collect(&bob, EventKind::MessageReceived);

    alice.send_message("hi everyone").await.unwrap();

    assert_eq!(
        next_event(&mut bob_messages).await,
        Event::MessageReceived {
            from: "alice".into(),
            text: "hi everyone".into(),
            kind: MessageKind::User,
            direct: false,
        }
    );

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn user_list_follows_joins_and_leaves() {
    let (url, _relay) = start_relay().await;
    let alice = client(&url, "alice");
    let mut lists = collect(&alice, EventKind::UserListUpdated);
    alice.connect().await.unwrap();

    let bob = client(&url, "bob");
    bob.connect().await.unwrap();

    wait_for_users(&mut lists, &["alice", "bob"]).await;

    bob.close().await;
    wait_for_users(&mut lists, &["alice"]).await;

    alice.close().await;
}

#[tokio::test]
async fn sealed_file_arrives_intact() {
    let (url, _relay) = start_relay().await;
    let (alice, bob) = connected_pair(&url).await;
    let mut alice_transfers = collect(&alice, EventKind::TransferProgress);
    let mut bob_transfers = collect(&bob, EventKind::TransferProgress);

    let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    let sent = bob
        .send_file_to("alice", "report.bin", data.as_slice(), 20_000)
        .await
        .unwrap();
    assert_eq!(sent, 20_000);

    let mut incoming: Vec<TransferUpdate> = Vec::new();
    loop {
        let Event::TransferProgress(update) = next_event(&mut alice_transfers).await else {
            unreachable!()
        };
        let terminal = update.state.is_terminal();
        incoming.push(update);
        if terminal {
            break;
        }
    }

    // Started, then one update per chunk: 8192 + 8192 + 3616.
    let transferred: Vec<u64> = incoming.iter().map(|u| u.transferred).collect();
    assert_eq!(transferred, vec![0, 8192, 16_384, 20_000]);
    assert_eq!(incoming[0].state, TransferState::Started);
    assert_eq!(incoming[0].peer, "bob");

    let done = incoming.pop().unwrap();
    assert_eq!(done.state, TransferState::Completed);
    assert_eq!(done.direction, TransferDirection::Incoming);
    assert_eq!(done.data.as_deref(), Some(data.as_slice()));

    // The sender saw its own side finish too.
    let mut last_outgoing = None;
    while let Ok(Event::TransferProgress(update)) = bob_transfers.try_recv() {
        assert_eq!(update.direction, TransferDirection::Outgoing);
        last_outgoing = Some(update);
    }
    let last_outgoing = last_outgoing.unwrap();
    assert_eq!(last_outgoing.state, TransferState::Completed);
    assert_eq!(last_outgoing.transferred, 20_000);

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn sealed_send_without_key_is_refused() {
    let (url, _relay) = start_relay().await;
    let alice = client(&url, "alice");
    alice.connect().await.unwrap();

    let err = alice.send_direct("nobody", "psst").await.unwrap_err();
    assert!(err.to_string().contains("nobody"), "got: {err}");

    alice.close().await;
}
