//! Relay server core: connection registry, WebSocket handler and fan-out.
//!
//! A client opens a WebSocket on `/ws` and must send [`Frame::Hello`] first.
//! Once registered, every frame it sends is forwarded to all other
//! registered clients. The relay stamps the registered username onto frames
//! that claim a sender, keeps a directory of the public keys announced in
//! Hello frames, and pushes a fresh [`KeyDirectorySnapshot`] and
//! [`UserListUpdate`] to everyone whenever a client joins or leaves.
//!
//! Envelope contents are never interpreted.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use relaywire_proto::codec;
use relaywire_proto::frame::{Frame, Hello, KeyDirectorySnapshot, PublicKeyBytes, UserListUpdate};
use tokio::sync::{RwLock, mpsc};

/// Identifies one WebSocket connection, so a stale connection cannot
/// unregister the one that replaced it.
pub type ConnectionId = u64;

struct Client {
    id: ConnectionId,
    username: String,
    public_key: Option<PublicKeyBytes>,
    sender: mpsc::UnboundedSender<Message>,
}

/// Shared relay state: the registered clients in join order.
pub struct RelayState {
    clients: RwLock<Vec<Client>>,
    next_id: AtomicU64,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a client under the username from its Hello.
    ///
    /// A client already registered under the same name is replaced; its
    /// sender is returned so the caller can let it drop, which ends the old
    /// writer task.
    pub async fn register(
        &self,
        hello: &Hello,
        sender: mpsc::UnboundedSender<Message>,
    ) -> (ConnectionId, Option<mpsc::UnboundedSender<Message>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut clients = self.clients.write().await;
        let previous = clients
            .iter()
            .position(|c| c.username == hello.username)
            .map(|i| clients.remove(i).sender);
        clients.push(Client {
            id,
            username: hello.username.clone(),
            public_key: hello.public_key,
            sender,
        });
        (id, previous)
    }

    /// Removes a connection. Returns `false` if it was already gone or had
    /// been replaced.
    pub async fn unregister(&self, id: ConnectionId) -> bool {
        let mut clients = self.clients.write().await;
        let before = clients.len();
        clients.retain(|c| c.id != id);
        clients.len() != before
    }

    /// Records a rotated public key announced in a key bundle.
    pub async fn update_key(&self, id: ConnectionId, public_key: PublicKeyBytes) -> bool {
        let mut clients = self.clients.write().await;
        let Some(client) = clients.iter_mut().find(|c| c.id == id) else {
            return false;
        };
        let changed = client.public_key != Some(public_key);
        client.public_key = Some(public_key);
        changed
    }

    /// Connected usernames in join order.
    pub async fn usernames(&self) -> Vec<String> {
        self.clients
            .read()
            .await
            .iter()
            .map(|c| c.username.clone())
            .collect()
    }

    /// Every announced public key, base64 encoded.
    pub async fn key_directory(&self) -> KeyDirectorySnapshot {
        let keys: BTreeMap<String, String> = self
            .clients
            .read()
            .await
            .iter()
            .filter_map(|c| c.public_key.map(|k| (c.username.clone(), BASE64.encode(k))))
            .collect();
        KeyDirectorySnapshot { keys }
    }

    /// Sends `bytes` to every client except `except`.
    ///
    /// Returns how many clients the frame was handed to.
    async fn fan_out(&self, except: Option<ConnectionId>, bytes: &[u8]) -> usize {
        let clients = self.clients.read().await;
        let mut delivered = 0;
        for client in clients.iter().filter(|c| Some(c.id) != except) {
            if client
                .sender
                .send(Message::Binary(bytes.to_vec().into()))
                .is_ok()
            {
                delivered += 1;
            } else {
                tracing::debug!(user = %client.username, "writer gone, skipping");
            }
        }
        delivered
    }

    /// Pushes the current key directory and user list to everyone.
    pub async fn broadcast_membership(&self) {
        let frames = [
            Frame::KeyDirectory(self.key_directory().await),
            Frame::UserList(UserListUpdate {
                users: self.usernames().await,
            }),
        ];
        for frame in &frames {
            match codec::encode(frame) {
                Ok(bytes) => {
                    self.fan_out(None, &bytes).await;
                }
                Err(e) => tracing::error!(frame = frame.label(), err = %e, "failed to encode membership frame"),
            }
        }
    }
}

/// Handles an upgraded WebSocket connection for a single client.
///
/// 1. Wait for a Hello.
/// 2. Register and push membership to everyone.
/// 3. Forward every later frame to all other clients.
/// 4. On disconnect, unregister and push membership again.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some(hello) = wait_for_hello(&mut ws_receiver).await else {
        tracing::warn!("connection closed before hello");
        return;
    };
    let username = hello.username.clone();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let (id, previous) = state.register(&hello, tx).await;
    if previous.is_some() {
        tracing::info!(user = %username, "replaced existing connection");
    }
    tracing::info!(user = %username, connection = id, has_key = hello.public_key.is_some(), "client registered");
    state.broadcast_membership().await;

    let writer_user = username.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(user = %writer_user, "websocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let reader_user = username.clone();
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Binary(data) => {
                    handle_binary_message(id, &reader_user, &data, &reader_state).await;
                }
                Message::Close(_) => {
                    tracing::info!(user = %reader_user, "received close frame");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }

    if state.unregister(id).await {
        tracing::info!(user = %username, connection = id, "client left");
        state.broadcast_membership().await;
    }
}

/// Waits for the first binary frame and requires it to be a Hello with a
/// non-empty username.
async fn wait_for_hello(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<Hello> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Binary(data) => {
                return match codec::decode(&data) {
                    Ok(Frame::Hello(hello)) if !hello.username.trim().is_empty() => Some(hello),
                    Ok(Frame::Hello(_)) => {
                        tracing::warn!("hello with empty username");
                        None
                    }
                    Ok(other) => {
                        tracing::warn!(frame = other.label(), "expected hello");
                        None
                    }
                    Err(e) => {
                        tracing::warn!(err = %e, "undecodable first frame");
                        None
                    }
                };
            }
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

/// Rewrites sender fields to the registered username and fans the frame out.
async fn handle_binary_message(id: ConnectionId, username: &str, data: &[u8], state: &RelayState) {
    let frame = match codec::decode(data) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(user = %username, err = %e, "dropping undecodable frame");
            return;
        }
    };

    let frame = match frame {
        Frame::Hello(_) => {
            tracing::warn!(user = %username, "duplicate hello ignored");
            return;
        }
        Frame::KeyDirectory(_) | Frame::UserList(_) => {
            tracing::warn!(user = %username, frame = frame.label(), "client sent relay-only frame");
            return;
        }
        Frame::Chat(mut chat) => {
            chat.from = username.to_string();
            Frame::Chat(chat)
        }
        Frame::Envelope(mut envelope) => {
            envelope.from = username.to_string();
            Frame::Envelope(envelope)
        }
        Frame::TransferRequest(mut request) => {
            request.sender = username.to_string();
            Frame::TransferRequest(request)
        }
        Frame::KeyBundle(mut bundle) => {
            bundle.username = username.to_string();
            if state.update_key(id, bundle.public_key).await {
                tracing::info!(user = %username, "public key rotated");
            }
            Frame::KeyBundle(bundle)
        }
        chunk @ Frame::Chunk(_) => chunk,
    };

    let bytes = match codec::encode(&frame) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(user = %username, frame = frame.label(), err = %e, "failed to re-encode frame");
            return;
        }
    };
    let delivered = state.fan_out(Some(id), &bytes).await;
    tracing::debug!(user = %username, frame = frame.label(), delivered, "forwarded");
}

/// Starts the relay on `addr` and returns the bound address and server task.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(addr: &str) -> std::io::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay with a caller-owned [`RelayState`].
///
/// Tests keep the state to inspect the registry or force disconnects.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> std::io::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(err = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}

async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<RelayState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
