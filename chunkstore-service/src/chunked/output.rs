use std::sync::Arc;
use std::time::SystemTime;

use bytes::BytesMut;
use futures_util::TryStreamExt;

use crate::PayloadStream;
use crate::backend::common::SharedBackend;
use crate::datamodel::{StorageData, new_record_id};
use crate::error::{Error, Result};

/// Metadata shared by every chunk of one blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobHeader {
    /// Storage id of the blob.
    pub uuid: String,
    /// Name of the payload schema.
    pub schema: String,
    /// Version of the payload schema, in canonical string form.
    pub schema_version: String,
    /// The world the blob belongs to.
    pub world_id: String,
    /// Logical path of the blob.
    pub path: String,
    /// Creation timestamp recorded on every chunk.
    pub created_at: SystemTime,
}

/// Writes a byte stream as a sequence of chunk documents.
///
/// Bytes are buffered until `chunk_size` bytes have accumulated, at which point they are
/// persisted as a non-final chunk with the next index. [`close`](Self::close) persists the
/// remaining bytes as the final chunk, which carries the total size. The final chunk is always
/// written, even if it is empty: a blob whose size is a multiple of the chunk size ends with an
/// empty final chunk.
///
/// If the stream is dropped without being closed, for example because the future driving it
/// was cancelled, the final chunk is written from a task spawned on the current tokio runtime.
///
/// Chunks that were persisted before a failure are not rolled back. If the leading chunks were
/// removed while the write was in progress, for example by the orphan sweep after a long stall,
/// closing fails with [`Error::MissingChunk`] instead of finalizing a blob that cannot be read.
#[derive(Debug)]
pub struct ChunkedOutputStream {
    backend: SharedBackend,
    header: BlobHeader,
    chunk_size: usize,
    buffer: BytesMut,
    next_index: u32,
    flushed: u64,
    closed: bool,
}

impl ChunkedOutputStream {
    /// Creates a writer for the blob described by `header`.
    ///
    /// A `chunk_size` of zero is treated as one byte.
    pub fn new(backend: SharedBackend, header: BlobHeader, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            backend,
            header,
            chunk_size,
            buffer: BytesMut::with_capacity(chunk_size),
            next_index: 0,
            flushed: 0,
            closed: false,
        }
    }

    /// Returns the header of the blob being written.
    pub fn header(&self) -> &BlobHeader {
        &self.header
    }

    /// Returns the number of bytes written so far.
    ///
    /// After [`close`](Self::close) this equals the size recorded on the final chunk.
    pub fn bytes_written(&self) -> u64 {
        self.flushed + self.buffer.len() as u64
    }

    /// Buffers `data`, persisting every chunk that fills up.
    pub async fn write(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let take = (self.chunk_size - self.buffer.len()).min(data.len());
            let (head, tail) = data.split_at(take);
            self.buffer.extend_from_slice(head);
            data = tail;

            if self.buffer.len() == self.chunk_size {
                self.flush_chunk().await?;
            }
        }
        Ok(())
    }

    /// Writes the entire contents of `stream`, returning the number of bytes consumed.
    pub async fn copy_from(&mut self, mut stream: PayloadStream) -> Result<u64> {
        let mut copied = 0;
        while let Some(bytes) = stream.try_next().await? {
            self.write(&bytes).await?;
            copied += bytes.len() as u64;
        }
        Ok(copied)
    }

    /// Persists the buffered bytes as the final chunk and returns it.
    pub async fn close(mut self) -> Result<StorageData> {
        self.closed = true;
        let chunk = self.final_chunk();
        self.backend.put_chunk(chunk.clone()).await?;

        if chunk.index > 0 && self.backend.get_chunk(&chunk.uuid, 0).await?.is_none() {
            self.backend.delete_chunks(&chunk.uuid).await?;
            tracing::error!(
                storage_id = %chunk.uuid,
                index = chunk.index,
                "leading chunks vanished during write, discarding blob"
            );
            return Err(Error::MissingChunk {
                storage_id: chunk.uuid,
                index: 0,
            });
        }

        tracing::debug!(
            storage_id = %chunk.uuid,
            index = chunk.index,
            size = chunk.size,
            "wrote final chunk"
        );
        Ok(chunk)
    }

    async fn flush_chunk(&mut self) -> Result<()> {
        let data = self.buffer.split().freeze();
        let len = data.len() as u64;
        let chunk = self.make_chunk(data, false);

        self.backend.put_chunk(chunk).await?;
        tracing::trace!(storage_id = %self.header.uuid, index = self.next_index, "wrote chunk");

        // Only account for the chunk once it is persisted, so the final size always matches the
        // bytes that can actually be read back.
        self.next_index += 1;
        self.flushed += len;
        Ok(())
    }

    fn final_chunk(&mut self) -> StorageData {
        let data = self.buffer.split().freeze();
        let size = self.flushed + data.len() as u64;
        let mut chunk = self.make_chunk(data, true);
        chunk.size = size;
        chunk
    }

    fn make_chunk(&self, data: bytes::Bytes, is_final: bool) -> StorageData {
        StorageData {
            id: new_record_id(),
            uuid: self.header.uuid.clone(),
            path: self.header.path.clone(),
            world_id: self.header.world_id.clone(),
            index: self.next_index,
            data,
            schema: self.header.schema.clone(),
            schema_version: self.header.schema_version.clone(),
            is_final,
            size: 0,
            created_at: self.header.created_at,
            written_at: SystemTime::now(),
        }
    }
}

impl Drop for ChunkedOutputStream {
    fn drop(&mut self) {
        if self.closed {
            return;
        }

        let chunk = self.final_chunk();
        let backend = Arc::clone(&self.backend);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(
                    storage_id = %chunk.uuid,
                    "chunked output dropped without close, finalizing in background"
                );
                handle.spawn(async move {
                    if let Err(err) = backend.put_chunk(chunk).await {
                        tracing::error!(
                            error = &err as &dyn std::error::Error,
                            "failed to write final chunk"
                        );
                    }
                });
            }
            Err(_) => {
                tracing::error!(
                    storage_id = %chunk.uuid,
                    "chunked output dropped outside of a runtime, final chunk not written"
                );
            }
        }
    }
}
