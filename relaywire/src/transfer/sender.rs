//! Sending side of the chunked transfer protocol.

use tokio::io::{AsyncRead, AsyncReadExt};

use relaywire_proto::frame::{Chunk, TransferRequest};

use super::{
    ChunkSink, DEFAULT_CHUNK_SIZE, TransferDirection, TransferError, TransferState,
    TransferUpdate, len_u64,
};

/// Streams a reader out as a request followed by chunks.
#[derive(Debug, Clone, Copy)]
pub struct TransferSender {
    chunk_size: usize,
}

impl TransferSender {
    /// Create a sender that cuts payloads into `chunk_size` blocks.
    #[must_use]
    pub const fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }

    /// Send `request`, then stream `reader` through `sink`.
    ///
    /// One block is always read ahead, so the final block is marked `last`
    /// even when it is full. An empty source produces a single empty last
    /// chunk. `on_update` sees Started, then one update per chunk ending in
    /// Completed; on error it sees Failed with the bytes sent so far.
    ///
    /// Returns the number of payload bytes sent.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError`] if the reader or the sink fails, or if the
    /// source length differs from `request.total_size`.
    pub async fn send_transfer<R, S, F>(
        &self,
        peer: &str,
        request: TransferRequest,
        reader: &mut R,
        sink: &S,
        mut on_update: F,
    ) -> Result<u64, TransferError>
    where
        R: AsyncRead + Unpin + Send,
        S: ChunkSink,
        F: FnMut(TransferUpdate) + Send,
    {
        let name = request.name.clone();
        let total = request.total_size;
        let mut sent = 0u64;

        let result = self
            .stream(peer, request, reader, sink, &mut sent, &mut on_update)
            .await;

        match result {
            Ok(()) => {
                tracing::info!(transfer = %name, peer = %peer, bytes = sent, "transfer sent");
                Ok(sent)
            }
            Err(e) => {
                tracing::warn!(transfer = %name, peer = %peer, sent, err = %e, "transfer failed");
                on_update(TransferUpdate::new(
                    &name,
                    peer,
                    TransferDirection::Outgoing,
                    sent,
                    total,
                    TransferState::Failed(e.to_string()),
                ));
                Err(e)
            }
        }
    }

    async fn stream<R, S, F>(
        &self,
        peer: &str,
        request: TransferRequest,
        reader: &mut R,
        sink: &S,
        sent: &mut u64,
        on_update: &mut F,
    ) -> Result<(), TransferError>
    where
        R: AsyncRead + Unpin + Send,
        S: ChunkSink,
        F: FnMut(TransferUpdate) + Send,
    {
        if self.chunk_size == 0 {
            return Err(TransferError::InvalidChunkSize);
        }
        let name = request.name.clone();
        let total = request.total_size;

        sink.send_request(request).await?;
        on_update(TransferUpdate::new(
            &name,
            peer,
            TransferDirection::Outgoing,
            0,
            total,
            TransferState::Started,
        ));

        let mut current = read_block(reader, self.chunk_size).await?;
        let mut index = 0u32;
        loop {
            let next = if current.len() == self.chunk_size {
                read_block(reader, self.chunk_size).await?
            } else {
                Vec::new()
            };
            let last = next.is_empty();

            let after = *sent + len_u64(current.len());
            if after > total || (last && after != total) {
                return Err(TransferError::SizeMismatch {
                    expected: total,
                    actual: after,
                });
            }

            sink.send_chunk(Chunk {
                name: name.clone(),
                data: current,
                index,
                last,
            })
            .await?;
            *sent = after;

            let state = if last {
                TransferState::Completed
            } else {
                TransferState::InProgress
            };
            on_update(TransferUpdate::new(
                &name,
                peer,
                TransferDirection::Outgoing,
                *sent,
                total,
                state,
            ));

            if last {
                return Ok(());
            }
            current = next;
            index = index.checked_add(1).ok_or(TransferError::TooManyChunks)?;
        }
    }
}

impl Default for TransferSender {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

/// Read up to `size` bytes, stopping early only at end of input.
async fn read_block<R>(reader: &mut R, size: usize) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin + Send,
{
    let mut block = Vec::with_capacity(size);
    (&mut *reader)
        .take(len_u64(size))
        .read_to_end(&mut block)
        .await?;
    Ok(block)
}
