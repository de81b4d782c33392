//! Streaming primitives that split blobs into chunk documents and reassemble them.
//!
//! [`ChunkedOutputStream`] buffers written bytes into fixed-size chunks and persists each chunk as
//! soon as it is full. [`ChunkedInputStream`] reads the chunks of one blob back in index order,
//! holding at most one chunk in memory at a time.

mod input;
mod output;

pub use input::ChunkedInputStream;
pub use output::{BlobHeader, ChunkedOutputStream};
