//! Blob commands operating on the configured document store.

use std::path::Path;

use anyhow::{Context, Result};
use chunkstore_service::stream;
use chunkstore_types::{SchemaVersion, StorageInfo};
use tokio::io::AsyncWriteExt;

use crate::state::State;

/// Metadata attached to a blob by [`put`].
#[derive(Debug)]
pub struct BlobMetadata<'a> {
    /// Name of the payload schema.
    pub schema: &'a str,
    /// Version of the payload schema.
    pub schema_version: &'a SchemaVersion,
    /// The world the blob belongs to.
    pub world_id: &'a str,
    /// Logical path of the blob. Defaults to the file name.
    pub path: Option<&'a str>,
}

/// Stores the contents of `file` as a new blob.
pub async fn put(state: &State, file: &Path, metadata: BlobMetadata<'_>) -> Result<StorageInfo> {
    let handle = tokio::fs::File::open(file)
        .await
        .with_context(|| format!("failed to open {}", file.display()))?;
    let stream = stream::from_reader(handle);

    let file_name = file.file_name().map(|name| name.to_string_lossy());
    let path = metadata
        .path
        .or(file_name.as_deref())
        .unwrap_or_default();

    state
        .service
        .store(
            metadata.schema,
            metadata.schema_version,
            metadata.world_id,
            path,
            stream,
        )
        .await
        .with_context(|| format!("failed to store {}", file.display()))
}

/// Writes the contents of a blob to `output`, or to stdout if no output is given.
///
/// Returns the number of bytes written.
pub async fn get(state: &State, storage_id: &str, output: Option<&Path>) -> Result<u64> {
    let input = state
        .service
        .load(storage_id)
        .await
        .with_context(|| format!("failed to load blob {storage_id}"))?;
    let mut reader = input.into_async_read();

    let written = match output {
        Some(output) => {
            let mut file = tokio::fs::File::create(output)
                .await
                .with_context(|| format!("failed to create {}", output.display()))?;
            let written = tokio::io::copy(&mut reader, &mut file).await?;
            file.sync_all().await?;
            written
        }
        None => {
            let mut stdout = tokio::io::stdout();
            let written = tokio::io::copy(&mut reader, &mut stdout).await?;
            stdout.flush().await?;
            written
        }
    };

    tracing::debug!(%storage_id, written, "read blob");
    Ok(written)
}

/// Returns the metadata of a blob.
pub async fn info(state: &State, storage_id: &str) -> Result<StorageInfo> {
    state
        .service
        .info(storage_id)
        .await
        .with_context(|| format!("failed to look up blob {storage_id}"))
}

/// Schedules a blob for deletion.
pub async fn delete(state: &State, storage_id: &str) -> Result<()> {
    state
        .service
        .delete(storage_id)
        .await
        .with_context(|| format!("failed to delete blob {storage_id}"))
}
