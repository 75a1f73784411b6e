// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::significant_drop_tightening
)]

//! Reconnect behaviour against a relay that drops connections.
//!
//! ## Disconnect simulation
//!
//! Aborting a server's `JoinHandle` does not close WebSocket connections that
//! live on their own tasks. Both helpers below therefore track every
//! per-connection task and abort those, which drops the TCP stream and makes
//! the client's reader see the connection end.
//!
//! - [`RecordingRelay`] accepts WebSockets itself and records every frame it
//!   receives, tagged with the connection it arrived on. Used to check frame
//!   order across a reconnect.
//! - [`TcpProxy`] sits in front of the real relay so a client can be cut off
//!   while other clients stay connected.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use relaywire::events::{Event, EventKind};
use relaywire::supervisor::{Backoff, ConnectionState, Supervisor, SupervisorConfig};
use relaywire::transport::ws::WsConnector;
use relaywire_proto::codec;
use relaywire_proto::frame::{ChatMessage, Frame};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type Client = Supervisor<WsConnector>;

const WAIT: Duration = Duration::from_secs(10);

// =============================================================================
// Recording relay
// =============================================================================

struct RecordingRelay {
    addr: SocketAddr,
    frames: mpsc::UnboundedReceiver<(usize, Frame)>,
    accept_handle: JoinHandle<()>,
    conn_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl RecordingRelay {
    async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, frames) = mpsc::unbounded_channel();
        let conn_handles: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));
        let handles = Arc::clone(&conn_handles);

        let accept_handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                let mut handles = handles.lock();
                let connection = handles.len();
                handles.push(tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    while let Some(Ok(msg)) = ws.next().await {
                        if msg.is_binary() {
                            let frame = codec::decode(&msg.into_data()).unwrap();
                            let _ = tx.send((connection, frame));
                        }
                    }
                }));
            }
        });

        Self {
            addr,
            frames,
            accept_handle,
            conn_handles,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    /// Drop every open connection; new ones are still accepted.
    fn drop_connections(&self) {
        for handle in self.conn_handles.lock().iter() {
            handle.abort();
        }
    }

    fn connections_accepted(&self) -> usize {
        self.conn_handles.lock().len()
    }

    async fn next_frame(&mut self) -> (usize, Frame) {
        tokio::time::timeout(WAIT, self.frames.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("relay stopped")
    }
}

impl Drop for RecordingRelay {
    fn drop(&mut self) {
        self.accept_handle.abort();
        self.drop_connections();
    }
}

// =============================================================================
// TCP proxy
// =============================================================================

/// Forwards a local port to a backend. `kill()` severs every proxied
/// connection and stops accepting.
struct TcpProxy {
    client_addr: String,
    accept_handle: JoinHandle<()>,
    conn_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TcpProxy {
    async fn new(proxy_port: u16, backend_addr: &str) -> Self {
        let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{proxy_port}"))
            .await
            .unwrap_or_else(|e| panic!("proxy: failed to bind to port {proxy_port}: {e}"));
        let client_addr = listener.local_addr().unwrap().to_string();
        let backend = backend_addr.to_string();
        let conn_handles: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));
        let handles = Arc::clone(&conn_handles);

        let accept_handle = tokio::spawn(async move {
            while let Ok((mut client_stream, _)) = listener.accept().await {
                let backend = backend.clone();
                handles.lock().push(tokio::spawn(async move {
                    let Ok(mut backend_stream) = tokio::net::TcpStream::connect(&backend).await
                    else {
                        return;
                    };
                    let _ =
                        tokio::io::copy_bidirectional(&mut client_stream, &mut backend_stream)
                            .await;
                }));
            }
        });

        Self {
            client_addr,
            accept_handle,
            conn_handles,
        }
    }

    fn kill(self) {
        self.accept_handle.abort();
        for handle in self.conn_handles.lock().iter() {
            handle.abort();
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

async fn find_free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

fn client(url: &str, username: &str, base_delay: Duration) -> Client {
    let config = SupervisorConfig {
        backoff: Backoff {
            base: base_delay,
            cap: base_delay * 8,
        },
        ..SupervisorConfig::new(username)
    };
    Supervisor::new(config, WsConnector::new(url, Duration::from_secs(5)).unwrap())
}

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

async fn wait_for_state(client: &Client, state: ConnectionState) {
    tokio::time::timeout(WAIT, async {
        while client.state() != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never reached {state:?}, stuck in {:?}", client.state()));
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn queued_chat_follows_hello_after_reconnect() {
    let mut relay = RecordingRelay::start().await;
    let alice = client(&relay.url(), "alice", Duration::from_millis(150));
    let mut lost = collect(&alice, EventKind::ConnectionLost);
    let mut reconnected = collect(&alice, EventKind::Reconnected);

    alice.connect().await.unwrap();
    assert!(matches!(relay.next_frame().await, (0, Frame::Hello(_))));
    assert!(matches!(relay.next_frame().await, (0, Frame::KeyBundle(_))));

    relay.drop_connections();
    next_event(&mut lost).await;
    wait_for_state(&alice, ConnectionState::ReconnectScheduled).await;

    alice.send_message("sent while away").await.unwrap();
    assert_eq!(alice.queued_frames(), 1);

    assert_eq!(
        next_event(&mut reconnected).await,
        Event::Reconnected { attempts: 1 }
    );

    let mut second: Vec<Frame> = Vec::new();
    while second.len() < 3 {
        let (connection, frame) = relay.next_frame().await;
        assert_eq!(connection, 1, "frame arrived on a stale connection");
        second.push(frame);
    }
    let Frame::Hello(hello) = &second[0] else {
        panic!("first frame after reconnect was {:?}", second[0]);
    };
    assert_eq!(hello.username, "alice");
    assert!(matches!(second[1], Frame::KeyBundle(_)));
    assert_eq!(
        second[2],
        Frame::Chat(ChatMessage::user("alice", "sent while away"))
    );

    assert_eq!(alice.queued_frames(), 0);
    assert!(lost.try_recv().is_err(), "connection loss reported twice");
    assert_eq!(relay.connections_accepted(), 2);

    alice.close().await;
}

#[tokio::test]
async fn close_during_reconnect_timer_stops_retries() {
    let mut relay = RecordingRelay::start().await;
    let alice = client(&relay.url(), "alice", Duration::from_millis(300));
    let mut lost = collect(&alice, EventKind::ConnectionLost);

    alice.connect().await.unwrap();
    relay.next_frame().await;

    relay.drop_connections();
    next_event(&mut lost).await;
    wait_for_state(&alice, ConnectionState::ReconnectScheduled).await;

    alice.close().await;
    alice.close().await;
    assert_eq!(alice.state(), ConnectionState::Closed);

    // Well past the first retry delay (600ms).
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(relay.connections_accepted(), 1);
    assert_eq!(alice.state(), ConnectionState::Closed);
    assert!(alice.send_message("too late").await.is_err());
}

#[tokio::test]
async fn reconnect_through_restarted_proxy_delivers_queued_chat() {
    let (relay_addr, _relay) = relaywire_relay::relay::start_server("127.0.0.1:0")
        .await
        .expect("failed to start relay");
    let relay_addr = relay_addr.to_string();

    let proxy_port = find_free_port().await;
    let proxy = TcpProxy::new(proxy_port, &relay_addr).await;

    let alice = client(
        &format!("ws://{}/ws", proxy.client_addr),
        "alice",
        Duration::from_millis(100),
    );
    let bob = client(
        &format!("ws://{relay_addr}/ws"),
        "bob",
        Duration::from_millis(100),
    );
    let mut bob_messages = collect(&bob, EventKind::MessageReceived);
    let mut alice_lost = collect(&alice, EventKind::ConnectionLost);
    let mut alice_reconnected = collect(&alice, EventKind::Reconnected);

    alice.connect().await.unwrap();
    bob.connect().await.unwrap();

    proxy.kill();
    next_event(&mut alice_lost).await;
    wait_for_state(&alice, ConnectionState::ReconnectScheduled).await;
    alice.send_message("after the outage").await.unwrap();

    // Let one retry fail against the dead port, then bring the proxy back.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let _proxy = TcpProxy::new(proxy_port, &relay_addr).await;

    let Event::Reconnected { attempts } = next_event(&mut alice_reconnected).await else {
        unreachable!()
    };
    assert!(attempts >= 1);

    let Event::MessageReceived { from, text, .. } = next_event(&mut bob_messages).await else {
        unreachable!()
    };
    assert_eq!(from, "alice");
    assert_eq!(text, "after the outage");
    assert!(alice_lost.try_recv().is_err());

    alice.close().await;
    bob.close().await;
}
