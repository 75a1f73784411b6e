#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::cast_possible_truncation
)]

//! Property-based transfer tests.
//!
//! Uses proptest to verify:
//! 1. N bytes sent at chunk size C reassemble byte-identically.
//! 2. Receiver progress strictly increases and ends at exactly N.
//! 3. Chunk count is `max(1, ceil(N / C))` and only the final chunk is last.
//! 4. Sealing every frame for a peer does not change what arrives.

use std::sync::Arc;

use parking_lot::Mutex;
use proptest::prelude::*;
use relaywire::crypto::envelope::EncryptionEngine;
use relaywire::crypto::keys::{Identity, KeyDirectory};
use relaywire::transfer::{
    ChunkSink, Origin, TransferError, TransferReceiver, TransferSender, TransferState,
    TransferUpdate,
};
use relaywire_proto::frame::{Chunk, DirectPayload, EncryptedEnvelope, TransferRequest};

/// Collects frames in send order.
#[derive(Default)]
struct Collect {
    requests: Mutex<Vec<TransferRequest>>,
    chunks: Mutex<Vec<Chunk>>,
}

impl ChunkSink for Collect {
    async fn send_request(&self, request: TransferRequest) -> Result<(), TransferError> {
        self.requests.lock().push(request);
        Ok(())
    }

    async fn send_chunk(&self, chunk: Chunk) -> Result<(), TransferError> {
        self.chunks.lock().push(chunk);
        Ok(())
    }
}

/// Seals every frame for `bob`, the way a direct transfer travels.
struct Sealing {
    engine: EncryptionEngine,
    envelopes: Mutex<Vec<EncryptedEnvelope>>,
}

impl Sealing {
    fn push(&self, payload: &DirectPayload) -> Result<(), TransferError> {
        let envelope = self
            .engine
            .seal_payload("bob", payload)
            .map_err(|e| TransferError::Send(e.to_string()))?;
        self.envelopes.lock().push(envelope);
        Ok(())
    }
}

impl ChunkSink for Sealing {
    async fn send_request(&self, request: TransferRequest) -> Result<(), TransferError> {
        self.push(&DirectPayload::TransferRequest(request))
    }

    async fn send_chunk(&self, chunk: Chunk) -> Result<(), TransferError> {
        self.push(&DirectPayload::Chunk(chunk))
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
}

fn request(len: usize) -> TransferRequest {
    TransferRequest {
        sender: "alice".into(),
        name: "payload.bin".into(),
        total_size: len as u64,
    }
}

fn send<S: ChunkSink>(data: &[u8], chunk_size: usize, sink: &S) -> u64 {
    runtime().block_on(async {
        let mut reader = data;
        TransferSender::new(chunk_size)
            .send_transfer("bob", request(data.len()), &mut reader, sink, |_| {})
            .await
            .unwrap()
    })
}

/// Feed a request and its chunks to a fresh receiver.
fn receive(request: &TransferRequest, chunks: Vec<Chunk>) -> Vec<TransferUpdate> {
    let mut receiver = TransferReceiver::default();
    let mut updates = vec![receiver.on_request(request, Origin::Plain)];
    updates.extend(chunks.into_iter().map(|c| receiver.on_chunk(c, Origin::Plain)));
    updates
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn reassembles_exactly(
        data in prop::collection::vec(any::<u8>(), 0..40_000),
        chunk_size in 1usize..10_000,
    ) {
        let sink = Collect::default();
        let sent = send(&data, chunk_size, &sink);
        prop_assert_eq!(sent, data.len() as u64);

        let chunks = std::mem::take(&mut *sink.chunks.lock());
        let expected_chunks = data.len().div_ceil(chunk_size).max(1);
        prop_assert_eq!(chunks.len(), expected_chunks);
        for (i, chunk) in chunks.iter().enumerate() {
            prop_assert_eq!(chunk.index as usize, i);
            prop_assert_eq!(chunk.last, i + 1 == expected_chunks);
        }

        let request = sink.requests.lock()[0].clone();
        let updates = receive(&request, chunks);

        let progress: Vec<u64> = updates.iter().map(|u| u.transferred).collect();
        prop_assert_eq!(progress[0], 0);
        for pair in progress[1..].windows(2) {
            prop_assert!(pair[0] < pair[1], "progress went {} -> {}", pair[0], pair[1]);
        }
        prop_assert_eq!(*progress.last().unwrap(), data.len() as u64);

        let done = updates.last().unwrap();
        prop_assert_eq!(&done.state, &TransferState::Completed);
        prop_assert_eq!(done.data.as_deref(), Some(data.as_slice()));
        prop_assert!(updates[..updates.len() - 1].iter().all(|u| !u.state.is_terminal()));
    }

    #[test]
    fn sealed_transfer_reassembles(
        data in prop::collection::vec(any::<u8>(), 1..20_000),
        chunk_size in 512usize..8192,
    ) {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let alice_public = alice.public_key();
        let bob_public = bob.public_key();

        let alice_keys = Arc::new(KeyDirectory::with_identity(alice));
        alice_keys.record_peer_key("bob", bob_public);
        let bob_keys = Arc::new(KeyDirectory::with_identity(bob));
        bob_keys.record_peer_key("alice", alice_public);

        let sink = Sealing {
            engine: EncryptionEngine::new("alice", alice_keys),
            envelopes: Mutex::new(Vec::new()),
        };
        send(&data, chunk_size, &sink);

        let opener = EncryptionEngine::new("bob", bob_keys);
        let mut receiver = TransferReceiver::default();
        let mut last = None;
        for envelope in sink.envelopes.lock().iter() {
            let origin = Origin::Sealed(envelope.from.clone());
            let update = match opener.open_payload("alice", envelope).unwrap() {
                DirectPayload::TransferRequest(request) => receiver.on_request(&request, origin),
                DirectPayload::Chunk(chunk) => receiver.on_chunk(chunk, origin),
                DirectPayload::Text(_) => unreachable!(),
            };
            last = Some(update);
        }

        let done = last.unwrap();
        prop_assert_eq!(&done.state, &TransferState::Completed);
        prop_assert_eq!(done.data.as_deref(), Some(data.as_slice()));
    }
}
