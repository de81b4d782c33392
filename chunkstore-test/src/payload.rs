//! Deterministic payload fixtures.

use bytes::Bytes;
use futures_util::TryStreamExt;
use futures_util::stream::{self, BoxStream, StreamExt};

/// Returns `len` bytes of a repeating, non-trivial pattern.
///
/// The pattern does not align with power-of-two chunk sizes, so misplaced chunks show up as
/// content mismatches.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Splits `contents` into a stream of pieces of at most `piece` bytes.
///
/// # Panics
///
/// Panics if `piece` is zero.
pub fn pieces(contents: &[u8], piece: usize) -> BoxStream<'static, std::io::Result<Bytes>> {
    let pieces: Vec<_> = contents
        .chunks(piece)
        .map(|p| Ok(Bytes::copy_from_slice(p)))
        .collect();
    stream::iter(pieces).boxed()
}

/// A stream that yields `contents` and then fails with an I/O error.
pub fn failing_after(contents: &[u8]) -> BoxStream<'static, std::io::Result<Bytes>> {
    let items = vec![
        Ok(Bytes::copy_from_slice(contents)),
        Err(std::io::Error::other("connection reset")),
    ];
    stream::iter(items).boxed()
}

/// A stream that yields all of `contents` at once.
pub fn whole(contents: &[u8]) -> BoxStream<'static, std::io::Result<Bytes>> {
    let contents = Bytes::copy_from_slice(contents);
    stream::once(async move { Ok(contents) }).boxed()
}

/// Collects a payload stream into a single buffer.
pub async fn collect(
    mut stream: BoxStream<'static, std::io::Result<Bytes>>,
) -> std::io::Result<Vec<u8>> {
    let mut contents = Vec::new();
    while let Some(piece) = stream.try_next().await? {
        contents.extend_from_slice(&piece);
    }
    Ok(contents)
}
