//! WebSocket connector for relay servers.

use std::time::Duration;

use tokio_tungstenite::connect_async;

use super::channel::{ChannelEvents, FramedChannel};
use super::{Connector, TransportError};

/// Default timeout for connecting to the relay server.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connects to a relay over `ws://` or `wss://`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    connect_timeout: Duration,
}

impl WsConnector {
    /// Create a connector for `url`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidAddress`] if `url` does not parse or
    /// does not use a WebSocket scheme.
    pub fn new(url: &str, connect_timeout: Duration) -> Result<Self, TransportError> {
        let parsed =
            url::Url::parse(url).map_err(|e| TransportError::InvalidAddress(format!("{url}: {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidAddress(format!(
                "{url}: expected ws:// or wss://"
            )));
        }
        Ok(Self {
            url: url.to_string(),
            connect_timeout,
        })
    }

    /// The relay URL this connector targets.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WsConnector {
    async fn connect(&self) -> Result<(FramedChannel, ChannelEvents), TransportError> {
        let (ws_stream, _response) =
            tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
                .await
                .map_err(|_| {
                    tracing::warn!(url = %self.url, "relay WebSocket connect timed out");
                    TransportError::Timeout
                })?
                .map_err(|e| {
                    tracing::warn!(url = %self.url, err = %e, "relay WebSocket connect failed");
                    map_ws_connect_error(&self.url, e)
                })?;

        tracing::debug!(url = %self.url, "relay WebSocket connected");
        Ok(FramedChannel::from_websocket(ws_stream))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(url: &str, err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Unreachable(url.to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::ConnectionClosed,
        WsError::Url(e) => TransportError::InvalidAddress(format!("{url}: {e}")),
        WsError::Http(response) => TransportError::Io(std::io::Error::other(format!(
            "relay HTTP error: status {}",
            response.status()
        ))),
        other => TransportError::Io(std::io::Error::other(format!(
            "relay connection error: {other}"
        ))),
    }
}
