//! Payload streams passed into and out of the storage service.

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

/// Type alias for data streams used in service APIs.
pub type PayloadStream = BoxStream<'static, std::io::Result<bytes::Bytes>>;

/// Turns an async reader, such as an open file, into a [`PayloadStream`].
pub fn from_reader<R>(reader: R) -> PayloadStream
where
    R: AsyncRead + Send + 'static,
{
    ReaderStream::new(reader).boxed()
}
