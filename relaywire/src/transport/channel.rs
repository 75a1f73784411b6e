//! Framed duplex channel over a WebSocket stream.
//!
//! A [`FramedChannel`] owns one connection. A background reader task decodes
//! incoming binary messages into [`Frame`]s and pushes them, in order, onto a
//! bounded channel drained by the owner. Writes go through a single async
//! mutex so concurrent senders never interleave frames.
//!
//! The owner must keep draining [`ChannelEvents`]; a stalled consumer stalls
//! the reader, which applies backpressure to the remote side.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use relaywire_proto::codec;
use relaywire_proto::frame::Frame;

use super::ChannelError;

/// Capacity of the inbound event queue.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// How long `close()` waits for the WebSocket close handshake to be written.
const CLOSE_WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// Receiver half handed to the channel's owner.
pub type ChannelEvents = mpsc::Receiver<ChannelEvent>;

type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;

/// Why a channel closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// `close()` was called locally.
    Local,
    /// The remote side closed the connection or the stream ended.
    PeerClosed,
    /// Reading from the connection failed.
    ReadError(String),
    /// A received message could not be decoded into a frame.
    Malformed(String),
    /// Writing to the connection failed.
    WriteError(String),
}

impl std::fmt::Display for CloseCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "closed locally"),
            Self::PeerClosed => write!(f, "closed by peer"),
            Self::ReadError(e) => write!(f, "read error: {e}"),
            Self::Malformed(e) => write!(f, "malformed frame: {e}"),
            Self::WriteError(e) => write!(f, "write error: {e}"),
        }
    }
}

/// Events emitted by a [`FramedChannel`].
#[derive(Debug)]
pub enum ChannelEvent {
    /// A complete frame was received.
    Frame(Frame),
    /// The channel closed. Emitted exactly once, always last.
    Closed(CloseCause),
}

/// State shared between the channel handle and its reader task.
struct Shared {
    closed: AtomicBool,
    events: mpsc::Sender<ChannelEvent>,
}

impl Shared {
    /// Marks the channel closed and emits the single `Closed` event.
    ///
    /// Returns `false` if the channel was already closed.
    fn mark_closed(&self, cause: CloseCause) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        tracing::debug!(%cause, "framed channel closed");
        match self.events.try_send(ChannelEvent::Closed(cause)) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                let events = self.events.clone();
                tokio::spawn(async move {
                    let _ = events.send(event).await;
                });
            }
        }
        true
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// One framed duplex connection.
pub struct FramedChannel {
    sink: Mutex<FrameSink>,
    shared: Arc<Shared>,
    reader: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl FramedChannel {
    /// Wrap an established WebSocket stream and start its reader task.
    #[must_use]
    pub fn from_websocket<S>(ws: WebSocketStream<S>) -> (Self, ChannelEvents)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let shared = Arc::new(Shared {
            closed: AtomicBool::new(false),
            events: tx,
        });

        let reader = tokio::spawn(reader_loop(stream, Arc::clone(&shared)));

        let channel = Self {
            sink: Mutex::new(Box::pin(sink)),
            shared,
            reader: parking_lot::Mutex::new(Some(reader)),
        };
        (channel, rx)
    }

    /// Encode and write one frame.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::Closed`] if the channel is already closed.
    /// - [`ChannelError::Codec`] if the frame cannot be encoded; the channel stays open.
    /// - [`ChannelError::Write`] if the write fails; the channel closes itself.
    pub async fn send(&self, frame: &Frame) -> Result<(), ChannelError> {
        if self.shared.is_closed() {
            return Err(ChannelError::Closed);
        }
        let bytes = codec::encode(frame)?;

        let mut sink = self.sink.lock().await;
        if self.shared.is_closed() {
            return Err(ChannelError::Closed);
        }
        if let Err(e) = sink.send(Message::Binary(bytes.into())).await {
            drop(sink);
            tracing::warn!(err = %e, frame = frame.label(), "framed channel write failed");
            self.abort_reader();
            self.shared.mark_closed(CloseCause::WriteError(e.to_string()));
            return Err(ChannelError::Write(e.to_string()));
        }
        Ok(())
    }

    /// Close the channel.
    ///
    /// Idempotent. Aborts the reader task so a pending read is released
    /// immediately, then makes a bounded attempt to send a WebSocket close.
    /// The bound covers waiting for a writer stalled on a full connection.
    pub async fn close(&self) {
        if !self.shared.mark_closed(CloseCause::Local) {
            return;
        }
        self.abort_reader();
        let close_sink = async { self.sink.lock().await.close().await };
        if tokio::time::timeout(CLOSE_WRITE_TIMEOUT, close_sink)
            .await
            .is_err()
        {
            tracing::debug!("timed out writing WebSocket close frame");
        }
    }

    /// Returns `true` once the channel has closed for any reason.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    fn abort_reader(&self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for FramedChannel {
    fn drop(&mut self) {
        self.abort_reader();
    }
}

/// Background task that decodes incoming messages into frames.
///
/// Any read error, undecodable payload, text frame or end of stream is
/// terminal for the channel.
async fn reader_loop<S>(mut stream: SplitStream<WebSocketStream<S>>, shared: Arc<Shared>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let cause = loop {
        match stream.next().await {
            Some(Ok(Message::Binary(data))) => match codec::decode(&data) {
                Ok(frame) => {
                    if shared.is_closed() {
                        return;
                    }
                    if shared.events.send(ChannelEvent::Frame(frame)).await.is_err() {
                        // Owner dropped the receiver.
                        break CloseCause::Local;
                    }
                }
                Err(e) => {
                    tracing::warn!(err = %e, "undecodable frame, closing channel");
                    break CloseCause::Malformed(e.to_string());
                }
            },
            Some(Ok(Message::Text(_))) => {
                tracing::warn!("unexpected text message, closing channel");
                break CloseCause::Malformed("text message on binary channel".to_string());
            }
            Some(Ok(Message::Close(_))) | None => break CloseCause::PeerClosed,
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
            Some(Err(e)) => {
                tracing::warn!(err = %e, "framed channel read error");
                break CloseCause::ReadError(e.to_string());
            }
        }
    };
    shared.mark_closed(cause);
}
