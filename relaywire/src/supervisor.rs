//! Connection Supervisor: the single owner of the relay connection.
//!
//! The Supervisor wraps a [`FramedChannel`] obtained from a [`Connector`],
//! drives the reconnection state machine, announces the local identity on
//! every new connection, routes inbound frames to the key directory, the
//! encryption engine and the transfer receiver, and publishes the results on
//! its [`EventDispatcher`].
//!
//! ```text
//! Disconnected ─connect()─► Connecting ─► Connected
//!                              ▲              │ disconnect
//!                              │ timer        ▼
//!                              └──── ReconnectScheduled
//!                 close() from any state ─► Closed
//! ```
//!
//! Exactly one connection attempt is in flight at any time: only the
//! initial `connect()` (from `Disconnected`) and the reconnect timer (from
//! `ReconnectScheduled`) may move the state to `Connecting`, and both do so
//! under the lifecycle lock.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use relaywire_proto::frame::{
    ChatMessage, Chunk, DirectPayload, EncryptedEnvelope, Frame, Hello, KeyBundle, MessageKind,
    TransferRequest, now_millis, voice_transfer_name,
};

use crate::crypto::CryptoError;
use crate::crypto::envelope::EncryptionEngine;
use crate::crypto::keys::{KeyDirectory, KeyUpdate};
use crate::events::{Event, EventDispatcher, EventKind, SubscriptionId};
use crate::transfer::{
    BROADCAST_PEER, ChunkSink, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_TRANSFER_SIZE, Origin,
    TransferError, TransferReceiver, TransferSender, TransferUpdate,
};
use crate::transport::channel::{ChannelEvent, ChannelEvents, FramedChannel};
use crate::transport::{ChannelError, Connector, TransportError};

/// Default number of frames held while a reconnect is pending.
pub const DEFAULT_MAX_QUEUED_FRAMES: usize = 256;

/// Errors returned by [`Supervisor`] operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// `connect()` has never been called.
    #[error("not connected; call connect() first")]
    NotConnected,

    /// The Supervisor was closed.
    #[error("supervisor is closed")]
    Closed,

    /// Too many frames are waiting for the next connection.
    #[error("outbound queue full ({capacity} frames)")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// Sealing failed, usually because the peer's key is unknown.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The connector could not establish a connection.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The channel rejected a frame.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// A transfer failed.
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
}

/// Where the Supervisor stands in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// `connect()` has not been called yet.
    Disconnected,
    /// A connection attempt is in flight, or the new connection is still
    /// announcing itself and draining queued frames.
    Connecting,
    /// Connected; sends go straight to the channel.
    Connected,
    /// The connection was lost and a retry timer is armed.
    ReconnectScheduled,
    /// `close()` was called. Terminal.
    Closed,
}

/// Exponential backoff: `min(cap, base * 2^attempt)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay unit.
    pub base: Duration,
    /// Upper bound on any single delay.
    pub cap: Duration,
}

impl Backoff {
    /// Delay before reconnect attempt number `attempt`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
        }
    }
}

/// Runtime settings for a [`Supervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Username announced in Hello and used as envelope sender.
    pub username: String,
    /// Reconnect delays.
    pub backoff: Backoff,
    /// Frames held while a reconnect is pending.
    pub max_queued_frames: usize,
    /// Bytes per outgoing transfer chunk.
    pub chunk_size: usize,
    /// Largest incoming transfer accepted.
    pub max_transfer_size: u64,
}

impl SupervisorConfig {
    /// Defaults for `username`.
    #[must_use]
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            backoff: Backoff::default(),
            max_queued_frames: DEFAULT_MAX_QUEUED_FRAMES,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_transfer_size: DEFAULT_MAX_TRANSFER_SIZE,
        }
    }
}

struct Lifecycle {
    state: ConnectionState,
    /// Backoff exponent for the next retry; reset to 1 on every connect.
    attempt: u32,
    /// Bumped for every established connection so stale disconnect reports
    /// from an older channel are ignored.
    generation: u64,
    /// Attempts made since the connection was lost.
    retries: u32,
    ever_connected: bool,
    channel: Option<Arc<FramedChannel>>,
    /// Connect task or reconnect timer; aborted by `close()`.
    task: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
    pending: VecDeque<Frame>,
}

struct Inner<C: Connector> {
    username: String,
    connector: C,
    keys: Arc<KeyDirectory>,
    engine: EncryptionEngine,
    events: Arc<EventDispatcher>,
    receiver: parking_lot::Mutex<TransferReceiver>,
    sender: TransferSender,
    backoff: Backoff,
    max_queued_frames: usize,
    lifecycle: parking_lot::Mutex<Lifecycle>,
}

/// Owns the relay connection and everything layered on it.
///
/// Cheap to clone; clones share the same connection. Call
/// [`close`](Self::close) to stop background reconnects.
pub struct Supervisor<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for Supervisor<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> Supervisor<C> {
    /// Create a Supervisor with a fresh key directory.
    #[must_use]
    pub fn new(config: SupervisorConfig, connector: C) -> Self {
        Self::with_keys(config, connector, Arc::new(KeyDirectory::new()))
    }

    /// Create a Supervisor around an existing key directory.
    #[must_use]
    pub fn with_keys(config: SupervisorConfig, connector: C, keys: Arc<KeyDirectory>) -> Self {
        let engine = EncryptionEngine::new(config.username.clone(), Arc::clone(&keys));
        Self {
            inner: Arc::new(Inner {
                username: config.username,
                connector,
                keys,
                engine,
                events: Arc::new(EventDispatcher::new()),
                receiver: parking_lot::Mutex::new(TransferReceiver::new(config.max_transfer_size)),
                sender: TransferSender::new(config.chunk_size),
                backoff: config.backoff,
                max_queued_frames: config.max_queued_frames,
                lifecycle: parking_lot::Mutex::new(Lifecycle {
                    state: ConnectionState::Disconnected,
                    attempt: 1,
                    generation: 0,
                    retries: 0,
                    ever_connected: false,
                    channel: None,
                    task: None,
                    pump: None,
                    pending: VecDeque::new(),
                }),
            }),
        }
    }

    /// Our username.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.inner.username
    }

    /// The key directory shared with the encryption engine.
    #[must_use]
    pub fn keys(&self) -> &Arc<KeyDirectory> {
        &self.inner.keys
    }

    /// The encryption engine.
    #[must_use]
    pub fn engine(&self) -> &EncryptionEngine {
        &self.inner.engine
    }

    /// The event dispatcher.
    #[must_use]
    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.inner.events
    }

    /// Shorthand for `events().subscribe(kind, handler)`.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(kind, handler)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.lifecycle.lock().state
    }

    /// Frames waiting for the next connection.
    #[must_use]
    pub fn queued_frames(&self) -> usize {
        self.inner.lifecycle.lock().pending.len()
    }

    /// Open the first connection.
    ///
    /// On failure the error is returned and a background retry is scheduled
    /// anyway. Calling `connect()` again while connected or reconnecting is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Closed`] after `close()`, or the
    /// connector's error if the first attempt fails.
    pub async fn connect(&self) -> Result<(), SupervisorError> {
        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut lc = self.inner.lifecycle.lock();
            match lc.state {
                ConnectionState::Closed => return Err(SupervisorError::Closed),
                ConnectionState::Disconnected => lc.state = ConnectionState::Connecting,
                state => {
                    tracing::debug!(?state, "connect() ignored, already started");
                    return Ok(());
                }
            }
            let inner = Arc::clone(&self.inner);
            lc.task = Some(tokio::spawn(async move {
                let _ = done_tx.send(inner.establish().await);
            }));
        }
        done_rx.await.unwrap_or(Err(SupervisorError::Closed))
    }

    /// Stop everything: cancel any pending reconnect, close the channel and
    /// drop queued frames. Idempotent.
    pub async fn close(&self) {
        let (channel, task, pump, dropped) = {
            let mut lc = self.inner.lifecycle.lock();
            if lc.state == ConnectionState::Closed {
                return;
            }
            lc.state = ConnectionState::Closed;
            let dropped = lc.pending.len();
            lc.pending.clear();
            (lc.channel.take(), lc.task.take(), lc.pump.take(), dropped)
        };

        if let Some(task) = task {
            task.abort();
        }
        if let Some(pump) = pump {
            pump.abort();
        }
        if let Some(channel) = channel {
            channel.close().await;
        }
        tracing::info!(dropped_frames = dropped, "supervisor closed");
    }

    /// Broadcast a plaintext chat message.
    ///
    /// # Errors
    ///
    /// See [`send_object`](Self::send_object).
    pub async fn send_message(&self, text: &str) -> Result<(), SupervisorError> {
        self.send_object(Frame::Chat(ChatMessage::user(&self.inner.username, text)))
            .await
    }

    /// Send an arbitrary frame.
    ///
    /// While a reconnect is pending the frame is queued and `Ok` is returned.
    /// A send that fails on the wire is queued too, and the reconnect path
    /// starts exactly as for a disconnect seen by the reader.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::NotConnected`] before the first `connect()`,
    /// [`SupervisorError::Closed`] after `close()`,
    /// [`SupervisorError::QueueFull`] if the queue is at capacity, or
    /// [`SupervisorError::Channel`] if the frame cannot be encoded.
    pub async fn send_object(&self, frame: Frame) -> Result<(), SupervisorError> {
        self.inner.send_frame(frame).await
    }

    /// Seal `text` for `to` and send it.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::Crypto`] if `to`'s key is unknown, otherwise as
    /// [`send_object`](Self::send_object).
    pub async fn send_direct(&self, to: &str, text: &str) -> Result<(), SupervisorError> {
        let envelope = self
            .inner
            .engine
            .seal_payload(to, &DirectPayload::Text(text.to_string()))?;
        self.inner.send_frame(Frame::Envelope(envelope)).await
    }

    /// Stream `reader` to everyone as a plaintext transfer named `name`.
    ///
    /// Transfers never queue: the connection must be up for the whole
    /// stream. Progress is published as `TransferProgress` events.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::NotConnected`] if not connected, or
    /// [`SupervisorError::Transfer`] if the stream fails part way.
    pub async fn send_file<R>(&self, name: &str, reader: R, size: u64) -> Result<u64, SupervisorError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.inner.require_connected()?;
        let sink = BroadcastSink { inner: &self.inner };
        self.inner
            .send_transfer(BROADCAST_PEER, name, reader, size, &sink)
            .await
    }

    /// Stream `reader` to `peer` with every frame sealed.
    ///
    /// # Errors
    ///
    /// As [`send_file`](Self::send_file), plus [`SupervisorError::Crypto`]
    /// if `peer`'s key is unknown.
    pub async fn send_file_to<R>(
        &self,
        peer: &str,
        name: &str,
        reader: R,
        size: u64,
    ) -> Result<u64, SupervisorError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.inner.require_connected()?;
        if self.inner.keys.session_key_for(peer).is_none() {
            return Err(CryptoError::NoSessionKey(peer.to_string()).into());
        }
        let sink = SealedSink {
            inner: &self.inner,
            peer,
        };
        self.inner.send_transfer(peer, name, reader, size, &sink).await
    }

    /// Send a voice recording to `peer`. Returns the transfer name used.
    ///
    /// # Errors
    ///
    /// As [`send_file_to`](Self::send_file_to).
    pub async fn send_voice<R>(&self, peer: &str, reader: R, size: u64) -> Result<String, SupervisorError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let name = voice_transfer_name(&self.inner.username, now_millis());
        self.send_file_to(peer, &name, reader, size).await?;
        Ok(name)
    }
}

impl<C: Connector> Inner<C> {
    /// Run one connection attempt. The state must already be `Connecting`.
    async fn establish(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let relay = self.connector.describe();
        let retries = {
            let mut lc = self.lifecycle.lock();
            lc.retries += 1;
            lc.retries
        };
        tracing::info!(relay = %relay, attempt = retries, "connecting");

        match self.connector.connect().await {
            Ok((channel, events)) => self.on_connected(channel, events).await,
            Err(e) => {
                tracing::warn!(relay = %relay, err = %e, "connect failed");
                self.schedule_retry();
                Err(e.into())
            }
        }
    }

    async fn on_connected(
        self: &Arc<Self>,
        channel: FramedChannel,
        events: ChannelEvents,
    ) -> Result<(), SupervisorError> {
        let channel = Arc::new(channel);
        let generation = {
            let mut lc = self.lifecycle.lock();
            if lc.state == ConnectionState::Connecting {
                lc.generation += 1;
                let generation = lc.generation;
                lc.channel = Some(Arc::clone(&channel));
                lc.pump = Some(tokio::spawn(pump(Arc::clone(self), events, generation)));
                Some(generation)
            } else {
                None
            }
        };
        let Some(generation) = generation else {
            tracing::debug!("closed while connecting, dropping new connection");
            channel.close().await;
            return Err(SupervisorError::Closed);
        };

        // Announce ourselves before anything else goes out.
        let identity = self.keys.local_identity();
        let hello = Frame::Hello(Hello {
            username: self.username.clone(),
            public_key: Some(identity.public_key()),
        });
        let bundle = Frame::KeyBundle(identity.key_bundle(&self.username));
        for frame in [hello, bundle] {
            if let Err(e) = channel.send(&frame).await {
                self.handle_disconnect(generation, &e.to_string());
                return Err(e.into());
            }
        }

        let (reconnected, retries, drained) = {
            let mut drained = 0usize;
            loop {
                let next = {
                    let mut lc = self.lifecycle.lock();
                    if lc.generation != generation || lc.state != ConnectionState::Connecting {
                        return Err(if lc.state == ConnectionState::Closed {
                            SupervisorError::Closed
                        } else {
                            TransportError::ConnectionClosed.into()
                        });
                    }
                    if let Some(frame) = lc.pending.pop_front() {
                        frame
                    } else {
                        lc.state = ConnectionState::Connected;
                        lc.attempt = 1;
                        lc.task = None;
                        let reconnected = lc.ever_connected;
                        lc.ever_connected = true;
                        break (reconnected, lc.retries, drained);
                    }
                };
                match channel.send(&next).await {
                    Ok(()) => drained += 1,
                    Err(ChannelError::Codec(e)) => {
                        tracing::warn!(frame = next.label(), err = %e, "dropping unencodable queued frame");
                    }
                    Err(e) => {
                        self.lifecycle.lock().pending.push_front(next);
                        self.handle_disconnect(generation, &e.to_string());
                        return Err(e.into());
                    }
                }
            }
        };

        tracing::info!(
            relay = %self.connector.describe(),
            user = %self.username,
            drained,
            "connected"
        );
        if reconnected {
            self.events.publish(&Event::Reconnected { attempts: retries });
        }
        Ok(())
    }

    /// After a failed attempt: arm the next timer if still `Connecting`.
    fn schedule_retry(self: &Arc<Self>) {
        let mut lc = self.lifecycle.lock();
        if lc.state != ConnectionState::Connecting {
            return;
        }
        lc.state = ConnectionState::ReconnectScheduled;
        let delay = self.backoff.delay(lc.attempt);
        lc.attempt = lc.attempt.saturating_add(1);
        tracing::info!(?delay, attempt = lc.attempt, "reconnect scheduled");
        lc.task = Some(tokio::spawn(reconnect_after(Arc::clone(self), delay)));
    }

    /// React to the loss of connection `generation`.
    ///
    /// Reports from a channel that is no longer current are ignored, so the
    /// reader and a failing writer seeing the same loss produce one
    /// `ConnectionLost` and one scheduled reconnect.
    fn handle_disconnect(self: &Arc<Self>, generation: u64, reason: &str) {
        let channel = {
            let mut lc = self.lifecycle.lock();
            if lc.state == ConnectionState::Closed || lc.generation != generation {
                return;
            }
            let Some(channel) = lc.channel.take() else {
                return;
            };
            lc.state = ConnectionState::ReconnectScheduled;
            lc.retries = 0;
            lc.pump = None;
            channel
        };
        tracing::warn!(relay = %self.connector.describe(), reason, "connection lost");

        if !channel.is_closed() {
            tokio::spawn(async move { channel.close().await });
        }

        let abandoned = self.receiver.lock().abandon_all("connection lost");
        for update in abandoned {
            self.events.publish(&Event::TransferProgress(update));
        }
        self.events.publish(&Event::ConnectionLost {
            reason: reason.to_string(),
        });

        let mut lc = self.lifecycle.lock();
        if lc.state != ConnectionState::ReconnectScheduled || lc.generation != generation {
            return;
        }
        let delay = self.backoff.delay(lc.attempt);
        lc.attempt = lc.attempt.saturating_add(1);
        tracing::info!(?delay, "reconnect scheduled");
        lc.task = Some(tokio::spawn(reconnect_after(Arc::clone(self), delay)));
    }

    async fn send_frame(self: &Arc<Self>, frame: Frame) -> Result<(), SupervisorError> {
        loop {
            let (channel, generation) = {
                let mut lc = self.lifecycle.lock();
                match lc.state {
                    ConnectionState::Closed => return Err(SupervisorError::Closed),
                    ConnectionState::Disconnected => return Err(SupervisorError::NotConnected),
                    ConnectionState::Connecting | ConnectionState::ReconnectScheduled => {
                        if lc.pending.len() >= self.max_queued_frames {
                            tracing::warn!(frame = frame.label(), "outbound queue full");
                            return Err(SupervisorError::QueueFull {
                                capacity: self.max_queued_frames,
                            });
                        }
                        tracing::debug!(frame = frame.label(), queued = lc.pending.len() + 1, "frame queued");
                        lc.pending.push_back(frame);
                        return Ok(());
                    }
                    ConnectionState::Connected => match &lc.channel {
                        Some(channel) => (Arc::clone(channel), lc.generation),
                        None => return Err(SupervisorError::NotConnected),
                    },
                }
            };

            match channel.send(&frame).await {
                Ok(()) => return Ok(()),
                Err(e @ ChannelError::Codec(_)) => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(frame = frame.label(), err = %e, "send failed, requeueing");
                    self.handle_disconnect(generation, &e.to_string());
                }
            }
        }
    }

    /// Send without queueing. Used by transfers.
    async fn send_now(self: &Arc<Self>, frame: Frame) -> Result<(), SupervisorError> {
        let (channel, generation) = {
            let lc = self.lifecycle.lock();
            match (lc.state, &lc.channel) {
                (ConnectionState::Closed, _) => return Err(SupervisorError::Closed),
                (ConnectionState::Connected, Some(channel)) => (Arc::clone(channel), lc.generation),
                _ => return Err(SupervisorError::NotConnected),
            }
        };
        match channel.send(&frame).await {
            Ok(()) => Ok(()),
            Err(e @ ChannelError::Codec(_)) => Err(e.into()),
            Err(e) => {
                self.handle_disconnect(generation, &e.to_string());
                Err(e.into())
            }
        }
    }

    fn require_connected(&self) -> Result<(), SupervisorError> {
        match self.lifecycle.lock().state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closed => Err(SupervisorError::Closed),
            _ => Err(SupervisorError::NotConnected),
        }
    }

    async fn send_transfer<R, S>(
        &self,
        peer: &str,
        name: &str,
        mut reader: R,
        size: u64,
        sink: &S,
    ) -> Result<u64, SupervisorError>
    where
        R: AsyncRead + Unpin + Send,
        S: ChunkSink,
    {
        let request = TransferRequest {
            sender: self.username.clone(),
            name: name.to_string(),
            total_size: size,
        };
        let events = Arc::clone(&self.events);
        let sent = self
            .sender
            .send_transfer(peer, request, &mut reader, sink, move |update| {
                events.publish(&Event::TransferProgress(update));
            })
            .await?;
        Ok(sent)
    }

    /// Route one inbound frame. Returns a frame to send back, if any.
    fn route(&self, frame: Frame) -> Option<Frame> {
        match frame {
            Frame::Hello(hello) => {
                tracing::debug!(peer = %hello.username, "ignoring relayed hello");
                None
            }
            Frame::KeyBundle(bundle) => self.on_key_bundle(&bundle),
            Frame::KeyDirectory(snapshot) => {
                let changed = self.keys.apply_snapshot(&snapshot, &self.username);
                tracing::debug!(entries = snapshot.keys.len(), changed, "key directory applied");
                None
            }
            Frame::Chat(message) => {
                self.events.publish(&Event::MessageReceived {
                    from: message.from,
                    text: message.text,
                    kind: message.kind,
                    direct: false,
                });
                None
            }
            Frame::Envelope(envelope) => {
                self.on_envelope(&envelope);
                None
            }
            Frame::TransferRequest(request) => {
                let update = self.receiver.lock().on_request(&request, Origin::Plain);
                self.publish_transfer(update);
                None
            }
            Frame::Chunk(chunk) => {
                let update = self.receiver.lock().on_chunk(chunk, Origin::Plain);
                self.publish_transfer(update);
                None
            }
            Frame::UserList(list) => {
                self.events
                    .publish(&Event::UserListUpdated { users: list.users });
                None
            }
        }
    }

    fn on_key_bundle(&self, bundle: &KeyBundle) -> Option<Frame> {
        if bundle.username == self.username {
            return None;
        }
        match self.keys.record_bundle(bundle) {
            // A peer we did not know yet has not seen our bundle either.
            Ok(KeyUpdate::Inserted | KeyUpdate::Replaced) => {
                tracing::debug!(peer = %bundle.username, "answering new key bundle with ours");
                Some(Frame::KeyBundle(
                    self.keys.local_identity().key_bundle(&self.username),
                ))
            }
            Ok(KeyUpdate::Unchanged | KeyUpdate::Ignored) => None,
            Err(e) => {
                tracing::warn!(peer = %bundle.username, err = %e, "rejected key bundle");
                None
            }
        }
    }

    fn on_envelope(&self, envelope: &EncryptedEnvelope) {
        if envelope.to != self.username {
            tracing::trace!(to = %envelope.to, "envelope for someone else");
            return;
        }
        let payload = match self.engine.open_payload(&envelope.from, envelope) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(peer = %envelope.from, err = %e, "discarding envelope");
                self.events.publish(&Event::DecryptionFailed {
                    from: envelope.from.clone(),
                    reason: e.to_string(),
                });
                return;
            }
        };
        match payload {
            DirectPayload::Text(text) => {
                self.events.publish(&Event::MessageReceived {
                    from: envelope.from.clone(),
                    text,
                    kind: MessageKind::User,
                    direct: true,
                });
            }
            DirectPayload::TransferRequest(mut request) => {
                request.sender.clone_from(&envelope.from);
                let origin = Origin::Sealed(envelope.from.clone());
                let update = self.receiver.lock().on_request(&request, origin);
                self.publish_transfer(update);
            }
            DirectPayload::Chunk(chunk) => {
                let origin = Origin::Sealed(envelope.from.clone());
                let update = self.receiver.lock().on_chunk(chunk, origin);
                self.publish_transfer(update);
            }
        }
    }

    fn publish_transfer(&self, update: TransferUpdate) {
        self.events.publish(&Event::TransferProgress(update));
    }
}

/// Drain channel events for connection `generation` on behalf of `inner`.
async fn pump<C: Connector>(inner: Arc<Inner<C>>, mut events: ChannelEvents, generation: u64) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Frame(frame) => {
                tracing::trace!(frame = frame.label(), "inbound frame");
                if let Some(reply) = inner.route(frame) {
                    if let Err(e) = inner.send_frame(reply).await {
                        tracing::debug!(err = %e, "reply not sent");
                    }
                }
            }
            ChannelEvent::Closed(cause) => {
                inner.handle_disconnect(generation, &cause.to_string());
                return;
            }
        }
    }
    inner.handle_disconnect(generation, "event stream ended");
}

async fn reconnect_after<C: Connector>(inner: Arc<Inner<C>>, delay: Duration) {
    tokio::time::sleep(delay).await;
    {
        let mut lc = inner.lifecycle.lock();
        if lc.state != ConnectionState::ReconnectScheduled {
            return;
        }
        lc.state = ConnectionState::Connecting;
    }
    if let Err(e) = inner.establish().await {
        tracing::debug!(err = %e, "reconnect attempt failed");
    }
}

struct BroadcastSink<'a, C: Connector> {
    inner: &'a Arc<Inner<C>>,
}

impl<C: Connector> ChunkSink for BroadcastSink<'_, C> {
    async fn send_request(&self, request: TransferRequest) -> Result<(), TransferError> {
        self.inner
            .send_now(Frame::TransferRequest(request))
            .await
            .map_err(|e| TransferError::Send(e.to_string()))
    }

    async fn send_chunk(&self, chunk: Chunk) -> Result<(), TransferError> {
        self.inner
            .send_now(Frame::Chunk(chunk))
            .await
            .map_err(|e| TransferError::Send(e.to_string()))
    }
}

struct SealedSink<'a, C: Connector> {
    inner: &'a Arc<Inner<C>>,
    peer: &'a str,
}

impl<C: Connector> SealedSink<'_, C> {
    async fn send_sealed(&self, payload: &DirectPayload) -> Result<(), TransferError> {
        let envelope = self
            .inner
            .engine
            .seal_payload(self.peer, payload)
            .map_err(|e| TransferError::Send(e.to_string()))?;
        self.inner
            .send_now(Frame::Envelope(envelope))
            .await
            .map_err(|e| TransferError::Send(e.to_string()))
    }
}

impl<C: Connector> ChunkSink for SealedSink<'_, C> {
    async fn send_request(&self, request: TransferRequest) -> Result<(), TransferError> {
        self.send_sealed(&DirectPayload::TransferRequest(request)).await
    }

    async fn send_chunk(&self, chunk: Chunk) -> Result<(), TransferError> {
        self.send_sealed(&DirectPayload::Chunk(chunk)).await
    }
}
