use bytes::{Buf, Bytes};
use futures_util::StreamExt;
use tokio_util::io::StreamReader;

use crate::PayloadStream;
use crate::backend::common::SharedBackend;
use crate::error::{Error, Result};

/// Reads the chunks of one blob back as a single byte stream.
///
/// Chunks are fetched on demand by `(uuid, index)`, so memory usage is bounded by the chunk size
/// no matter how large the blob is. The stream ends after the final chunk. A chunk that is missing
/// before the final one was seen is reported as [`Error::MissingChunk`] instead of silently
/// truncating the blob.
#[derive(Debug)]
pub struct ChunkedInputStream {
    backend: SharedBackend,
    uuid: String,
    next_index: u32,
    current: Bytes,
    bytes_read: u64,
    finished: bool,
}

impl ChunkedInputStream {
    /// Creates a reader for the blob stored under `uuid`.
    ///
    /// No chunk is fetched until the first read.
    pub fn new(backend: SharedBackend, uuid: impl Into<String>) -> Self {
        Self {
            backend,
            uuid: uuid.into(),
            next_index: 0,
            current: Bytes::new(),
            bytes_read: 0,
            finished: false,
        }
    }

    /// Returns the storage id of the blob being read.
    pub fn storage_id(&self) -> &str {
        &self.uuid
    }

    /// Fetches the payload of the next chunk, or `None` after the final chunk.
    ///
    /// Bytes buffered for [`read`](Self::read) are not returned by this method.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.finished {
            return Ok(None);
        }

        let index = self.next_index;
        let Some(chunk) = self.backend.get_chunk(&self.uuid, index).await? else {
            self.finished = true;
            return Err(Error::MissingChunk {
                storage_id: self.uuid.clone(),
                index,
            });
        };

        self.next_index += 1;
        self.bytes_read += chunk.data.len() as u64;
        tracing::trace!(storage_id = %self.uuid, index, "read chunk");

        if chunk.is_final {
            self.finished = true;
            if chunk.size != self.bytes_read {
                return Err(Error::SizeMismatch {
                    storage_id: self.uuid.clone(),
                    expected: chunk.size,
                    actual: self.bytes_read,
                });
            }
        }

        Ok(Some(chunk.data))
    }

    /// Reads bytes into `buf`, returning how many were read. `0` signals end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.current.is_empty() {
            match self.next_chunk().await? {
                Some(data) => self.current = data,
                None => return Ok(0),
            }
        }

        let len = buf.len().min(self.current.len());
        buf[..len].copy_from_slice(&self.current[..len]);
        self.current.advance(len);
        Ok(len)
    }

    /// Reads the remainder of the blob into memory.
    pub async fn read_to_end(mut self) -> Result<Vec<u8>> {
        let mut contents = std::mem::take(&mut self.current).to_vec();
        while let Some(data) = self.next_chunk().await? {
            contents.extend_from_slice(&data);
        }
        Ok(contents)
    }

    /// Converts this reader into a [`PayloadStream`] yielding one item per non-empty chunk.
    pub fn into_stream(mut self) -> PayloadStream {
        let current = std::mem::take(&mut self.current);
        let head = futures_util::stream::iter((!current.is_empty()).then_some(Ok(current)));

        let chunks = futures_util::stream::try_unfold(self, |mut reader| async move {
            loop {
                match reader.next_chunk().await {
                    Err(err) => return Err(std::io::Error::other(err)),
                    Ok(Some(data)) if data.is_empty() => continue,
                    Ok(Some(data)) => return Ok(Some((data, reader))),
                    Ok(None) => return Ok(None),
                }
            }
        });

        head.chain(chunks).boxed()
    }

    /// Converts this reader into a tokio [`AsyncRead`](tokio::io::AsyncRead).
    pub fn into_async_read(self) -> StreamReader<PayloadStream, Bytes> {
        StreamReader::new(self.into_stream())
    }
}
