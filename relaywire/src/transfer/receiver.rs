//! Receiving side of the chunked transfer protocol.

use std::collections::HashMap;

use relaywire_proto::frame::{Chunk, TransferRequest};

use super::{
    DEFAULT_MAX_TRANSFER_SIZE, Origin, TransferDirection, TransferError, TransferState,
    TransferUpdate, len_u64,
};

/// Upper bound on the buffer reserved up front for one transfer.
const MAX_PREALLOCATION: u64 = 1024 * 1024;

struct Incoming {
    peer: String,
    origin: Origin,
    total: u64,
    data: Vec<u8>,
    next_index: u32,
}

/// Reassembles incoming transfers keyed by logical name.
///
/// Every transfer remembers the [`Origin`] of its request. Requests and
/// chunks from any other origin are refused and leave it untouched.
pub struct TransferReceiver {
    max_transfer_size: u64,
    active: HashMap<String, Incoming>,
}

impl TransferReceiver {
    /// Create a receiver that refuses transfers larger than `max_transfer_size`.
    #[must_use]
    pub fn new(max_transfer_size: u64) -> Self {
        Self {
            max_transfer_size,
            active: HashMap::new(),
        }
    }

    /// Begin accumulating the transfer announced by `request`.
    ///
    /// A request reusing the name of an active transfer restarts it when it
    /// has the same origin and is refused otherwise.
    pub fn on_request(&mut self, request: &TransferRequest, origin: Origin) -> TransferUpdate {
        let peer = request.sender.as_str();
        if let Some(active) = self.active.get(&request.name).filter(|a| a.origin != origin) {
            let err = TransferError::OriginMismatch {
                expected: active.origin.clone(),
                actual: origin,
            };
            tracing::warn!(transfer = %request.name, peer = %peer, err = %err, "request for active transfer refused");
            return failed(&request.name, peer, 0, request.total_size, &err);
        }
        if request.total_size > self.max_transfer_size {
            let err = TransferError::TooLarge {
                size: request.total_size,
                max: self.max_transfer_size,
            };
            tracing::warn!(transfer = %request.name, peer = %peer, err = %err, "refusing transfer");
            return failed(&request.name, peer, 0, request.total_size, &err);
        }

        let capacity = usize::try_from(request.total_size.min(MAX_PREALLOCATION)).unwrap_or(0);
        let previous = self.active.insert(
            request.name.clone(),
            Incoming {
                peer: peer.to_string(),
                origin,
                total: request.total_size,
                data: Vec::with_capacity(capacity),
                next_index: 0,
            },
        );
        if previous.is_some() {
            tracing::warn!(transfer = %request.name, peer = %peer, "transfer restarted");
        } else {
            tracing::debug!(transfer = %request.name, peer = %peer, total = request.total_size, "transfer started");
        }

        TransferUpdate::new(
            &request.name,
            peer,
            TransferDirection::Incoming,
            0,
            request.total_size,
            TransferState::Started,
        )
    }

    /// Append a chunk to its transfer.
    ///
    /// A chunk for an unknown name yields a Failed update and is dropped.
    /// The `last` chunk yields Completed with the reassembled bytes, or
    /// Failed if the size does not match the announcement. A chunk whose
    /// origin differs from the request's yields Failed and is dropped
    /// without touching the transfer.
    pub fn on_chunk(&mut self, chunk: Chunk, origin: Origin) -> TransferUpdate {
        let Some(incoming) = self.active.get_mut(&chunk.name) else {
            tracing::warn!(transfer = %chunk.name, index = chunk.index, "chunk for unknown transfer dropped");
            return TransferUpdate::new(
                &chunk.name,
                "",
                TransferDirection::Incoming,
                0,
                0,
                TransferState::Failed("chunk for unknown transfer".to_string()),
            );
        };

        if incoming.origin != origin {
            let peer = match &origin {
                Origin::Sealed(peer) => peer.clone(),
                Origin::Plain => String::new(),
            };
            let err = TransferError::OriginMismatch {
                expected: incoming.origin.clone(),
                actual: origin,
            };
            tracing::warn!(transfer = %chunk.name, index = chunk.index, err = %err, "chunk dropped");
            return failed(&chunk.name, &peer, 0, 0, &err);
        }

        if chunk.index != incoming.next_index {
            tracing::debug!(
                transfer = %chunk.name,
                expected = incoming.next_index,
                got = chunk.index,
                "chunk index out of sequence"
            );
        }
        incoming.next_index = chunk.index.saturating_add(1);
        incoming.data.extend_from_slice(&chunk.data);

        let received = len_u64(incoming.data.len());
        let total = incoming.total;
        if received > total || (chunk.last && received != total) {
            let err = TransferError::SizeMismatch {
                expected: total,
                actual: received,
            };
            let peer = incoming.peer.clone();
            self.active.remove(&chunk.name);
            tracing::warn!(transfer = %chunk.name, peer = %peer, err = %err, "transfer failed");
            return failed(&chunk.name, &peer, received, total, &err);
        }

        if !chunk.last {
            return TransferUpdate::new(
                &chunk.name,
                &incoming.peer,
                TransferDirection::Incoming,
                received,
                total,
                TransferState::InProgress,
            );
        }

        let data = std::mem::take(&mut incoming.data);
        let mut update = TransferUpdate::new(
            &chunk.name,
            &incoming.peer,
            TransferDirection::Incoming,
            received,
            total,
            TransferState::Completed,
        );
        self.active.remove(&chunk.name);
        tracing::info!(transfer = %chunk.name, peer = %update.peer, bytes = received, "transfer received");
        update.data = Some(data);
        update
    }

    /// Number of transfers currently being accumulated.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Drop every partial transfer, e.g. after the connection was lost.
    ///
    /// Returns a Failed update for each one.
    pub fn abandon_all(&mut self, reason: &str) -> Vec<TransferUpdate> {
        self.active
            .drain()
            .map(|(name, incoming)| {
                TransferUpdate::new(
                    &name,
                    &incoming.peer,
                    TransferDirection::Incoming,
                    len_u64(incoming.data.len()),
                    incoming.total,
                    TransferState::Failed(reason.to_string()),
                )
            })
            .collect()
    }
}

impl Default for TransferReceiver {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TRANSFER_SIZE)
    }
}

fn failed(name: &str, peer: &str, transferred: u64, total: u64, err: &TransferError) -> TransferUpdate {
    TransferUpdate::new(
        name,
        peer,
        TransferDirection::Incoming,
        transferred,
        total,
        TransferState::Failed(err.to_string()),
    )
}
