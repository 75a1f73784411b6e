//! Chunked transfer protocol.
//!
//! A transfer is one [`TransferRequest`] followed by an ordered stream of
//! [`Chunk`]s sharing its logical name; the final chunk carries `last = true`.
//! Each transfer moves through Started, then InProgress, and ends in either
//! Completed or Failed. Both terminal states are final.
//!
//! The protocol is media-agnostic. Voice recordings are ordinary transfers
//! whose name starts with
//! [`VOICE_NAME_PREFIX`](relaywire_proto::frame::VOICE_NAME_PREFIX).

pub mod receiver;
pub mod sender;

use std::fmt;
use std::future::Future;

use relaywire_proto::frame::{Chunk, TransferRequest};

pub use receiver::TransferReceiver;
pub use sender::TransferSender;

/// Default bytes per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Default largest transfer a receiver will accumulate (256 MiB).
pub const DEFAULT_MAX_TRANSFER_SIZE: u64 = 256 * 1024 * 1024;

/// Peer name recorded on outgoing transfers sent to everyone.
pub const BROADCAST_PEER: &str = "*";

/// Which side of a transfer an update describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// We are sending.
    Outgoing,
    /// We are receiving.
    Incoming,
}

/// How an incoming transfer frame reached us.
///
/// A transfer only accepts chunks with the origin of its request, so a
/// sealed transfer cannot be fed by relayed plaintext or by another peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Relayed in the clear; the sender is whatever the relay stamped.
    Plain,
    /// Opened from an envelope sealed by this peer.
    Sealed(String),
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => write!(f, "plaintext"),
            Self::Sealed(peer) => write!(f, "sealed by {peer}"),
        }
    }
}

/// Lifecycle state of one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    /// Request sent or received; no chunks yet.
    Started,
    /// At least one chunk moved; more to come.
    InProgress,
    /// The last chunk moved and the size matched.
    Completed,
    /// The transfer stopped early. Carries the reason.
    Failed(String),
}

impl TransferState {
    /// Returns `true` for `Completed` and `Failed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }
}

/// Progress report for one transfer.
#[derive(Clone, PartialEq, Eq)]
pub struct TransferUpdate {
    /// Logical transfer name.
    pub name: String,
    /// The other party; [`BROADCAST_PEER`] for outgoing broadcasts, empty
    /// when a stray chunk names no known transfer.
    pub peer: String,
    /// Bytes moved so far.
    pub transferred: u64,
    /// Announced total size.
    pub total: u64,
    /// Sending or receiving.
    pub direction: TransferDirection,
    /// Where the transfer stands.
    pub state: TransferState,
    /// The reassembled payload, present only on an incoming `Completed`.
    pub data: Option<Vec<u8>>,
}

impl TransferUpdate {
    fn new(
        name: &str,
        peer: &str,
        direction: TransferDirection,
        transferred: u64,
        total: u64,
        state: TransferState,
    ) -> Self {
        Self {
            name: name.to_string(),
            peer: peer.to_string(),
            transferred,
            total,
            direction,
            state,
            data: None,
        }
    }
}

impl fmt::Debug for TransferUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferUpdate")
            .field("name", &self.name)
            .field("peer", &self.peer)
            .field("transferred", &self.transferred)
            .field("total", &self.total)
            .field("direction", &self.direction)
            .field("state", &self.state)
            .field("data_len", &self.data.as_ref().map(Vec::len))
            .finish()
    }
}

/// Errors that end a transfer.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The source could not be read.
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),

    /// A request or chunk could not be handed to the connection.
    #[error("send failed: {0}")]
    Send(String),

    /// The payload did not match the announced size.
    #[error("size mismatch: announced {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Announced size.
        expected: u64,
        /// Bytes actually seen.
        actual: u64,
    },

    /// The announced size exceeds the receiver's limit.
    #[error("transfer too large: {size} bytes (max {max})")]
    TooLarge {
        /// Announced size.
        size: u64,
        /// Configured maximum.
        max: u64,
    },

    /// A frame for an active transfer arrived by a different route than
    /// the request that started it.
    #[error("origin mismatch: transfer is {expected}, frame was {actual}")]
    OriginMismatch {
        /// Origin of the request.
        expected: Origin,
        /// Origin of the rejected frame.
        actual: Origin,
    },

    /// The chunk size is zero.
    #[error("chunk size must be non-zero")]
    InvalidChunkSize,

    /// More chunks than a `u32` index can count.
    #[error("too many chunks")]
    TooManyChunks,
}

/// Where a [`TransferSender`] puts its frames.
///
/// The Supervisor implements this twice: once broadcasting plaintext frames
/// and once sealing each frame for a single peer.
pub trait ChunkSink: Send + Sync {
    /// Send the announcement that opens a transfer.
    fn send_request(
        &self,
        request: TransferRequest,
    ) -> impl Future<Output = Result<(), TransferError>> + Send;

    /// Send one chunk.
    fn send_chunk(&self, chunk: Chunk) -> impl Future<Output = Result<(), TransferError>> + Send;
}

/// Convert a byte count to `u64`.
pub(crate) fn len_u64(len: usize) -> u64 {
    u64::try_from(len).unwrap_or(u64::MAX)
}
