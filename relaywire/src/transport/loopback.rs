//! Loopback transport for testing.
//!
//! Uses an in-process [`tokio::io::duplex`] pipe wrapped in WebSocket framing
//! on both ends, so the code under test runs the exact same
//! [`FramedChannel`] path as a real relay connection.

use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Role;

use super::channel::{ChannelEvents, FramedChannel};
use super::{Connector, TransportError};

/// Buffer size of each duplex pipe direction.
const PIPE_BUFFER: usize = 256 * 1024;

/// One end of a loopback connection.
pub type LoopbackEnd = (FramedChannel, ChannelEvents);

/// Create two raw WebSocket streams connected to each other.
///
/// The first stream acts as the client, the second as the server.
pub async fn websocket_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
    let (a, b) = tokio::io::duplex(PIPE_BUFFER);
    tokio::join!(
        WebSocketStream::from_raw_socket(a, Role::Client, None),
        WebSocketStream::from_raw_socket(b, Role::Server, None),
    )
}

/// Create two framed channels connected to each other.
///
/// Frames sent on one end are received by the other.
pub async fn channel_pair() -> (LoopbackEnd, LoopbackEnd) {
    let (client, server) = websocket_pair().await;
    (
        FramedChannel::from_websocket(client),
        FramedChannel::from_websocket(server),
    )
}

/// [`Connector`] that hands the far end of every new connection to a test.
///
/// Each successful `connect()` creates a fresh loopback pair; the server end
/// is delivered on the receiver returned by [`LoopbackConnector::new`].
pub struct LoopbackConnector {
    accepted: mpsc::UnboundedSender<LoopbackEnd>,
}

impl LoopbackConnector {
    /// Create a connector and the receiver on which server ends arrive.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LoopbackEnd>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        (Self { accepted }, rx)
    }
}

impl Connector for LoopbackConnector {
    async fn connect(&self) -> Result<LoopbackEnd, TransportError> {
        if self.accepted.is_closed() {
            return Err(TransportError::Unreachable(self.describe()));
        }
        let (client, server) = channel_pair().await;
        self.accepted
            .send(server)
            .map_err(|_| TransportError::Unreachable(self.describe()))?;
        Ok(client)
    }

    fn describe(&self) -> String {
        "loopback".to_string()
    }
}
