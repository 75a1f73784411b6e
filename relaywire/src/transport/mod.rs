//! Transport layer for relaywire.
//!
//! A [`Connector`] produces one [`FramedChannel`](channel::FramedChannel) per
//! connection attempt. Concrete implementations:
//! - [`ws::WsConnector`]: WebSocket connection to a relay server
//! - [`loopback::LoopbackConnector`]: in-process duplex pipes for testing

pub mod channel;
pub mod loopback;
pub mod ws;

use std::future::Future;

use relaywire_proto::codec::CodecError;

use channel::{ChannelEvents, FramedChannel};

/// Errors that can occur while establishing a connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection attempt did not complete in time.
    #[error("connect timed out")]
    Timeout,

    /// Nothing is listening at the target address.
    #[error("relay {0} is unreachable")]
    Unreachable(String),

    /// The address could not be parsed.
    #[error("invalid relay address {0}")]
    InvalidAddress(String),

    /// The remote side closed the connection during setup.
    #[error("connection closed")]
    ConnectionClosed,

    /// An underlying I/O or WebSocket error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by [`FramedChannel::send`](channel::FramedChannel::send).
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The channel was closed before or during the write.
    #[error("channel closed")]
    Closed,

    /// The frame could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The underlying write failed; the channel is now closed.
    #[error("write failed: {0}")]
    Write(String),
}

/// Opens framed connections to a relay.
///
/// The Supervisor calls [`Connector::connect`] once per attempt and never
/// concurrently.
pub trait Connector: Send + Sync + 'static {
    /// Establish a new connection.
    ///
    /// Returns the channel and the receiver for its events.
    fn connect(
        &self,
    ) -> impl Future<Output = Result<(FramedChannel, ChannelEvents), TransportError>> + Send;

    /// Human-readable description of the target, for logs.
    fn describe(&self) -> String;
}
