//! Core storage service and configuration.
//!
//! This module contains [`StorageService`], the main entry point for storing and retrieving
//! blobs, along with [`StorageConfig`] for backend initialization and [`StorageOptions`] for
//! tuning chunking and deletion.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chunkstore_types::{SchemaVersion, StorageInfo};

use crate::PayloadStream;
use crate::backend::common::{Backend, DocumentStore, SharedBackend, SharedDocumentStore};
use crate::backend::in_memory::InMemoryBackend;
use crate::backend::local_fs::LocalFsBackend;
use crate::chunked::{BlobHeader, ChunkedInputStream, ChunkedOutputStream};
use crate::datamodel::{StorageData, StorageDelete, new_storage_id};
use crate::error::{Error, Result};

/// The default size of a chunk document: 512 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

/// The default delay between [`StorageService::delete`] and the physical removal of chunks.
pub const DEFAULT_DELETION_GRACE: Duration = Duration::from_secs(5 * 60);

/// Configuration to initialize a [`StorageService`].
#[derive(Debug, Clone)]
pub enum StorageConfig<'a> {
    /// Keep all documents in memory.
    Memory,
    /// Use a local filesystem as the document store.
    FileSystem {
        /// The path to the directory where documents will be stored.
        path: &'a Path,
    },
}

/// Tuning options of a [`StorageService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageOptions {
    /// Maximum payload size of a single chunk document, in bytes.
    pub chunk_size: usize,
    /// Delay between a deletion request and the physical removal of chunks.
    pub deletion_grace: Duration,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            deletion_grace: DEFAULT_DELETION_GRACE,
        }
    }
}

/// High-level asynchronous service for storing and retrieving chunked blobs.
///
/// Blobs are split into chunk documents of at most [`StorageOptions::chunk_size`] bytes so that
/// arbitrarily large objects fit into a document store with a per-document size limit. Every
/// blob is identified by an opaque storage id.
///
/// # Update vs. replace
///
/// [`update`](Self::update) writes the new content under a fresh storage id and schedules the
/// old one for deletion. Readers of the old id keep seeing the complete old blob until the
/// deletion grace period has passed and the [cleanup
/// scheduler](crate::cleanup::StorageCleanupScheduler) removed it.
///
/// [`replace`](Self::replace) keeps the storage id stable. It deletes the existing chunks first
/// and then writes the new ones, so a concurrent reader may observe a missing or torn blob.
/// Callers choose `replace` when they need a stable identifier more than atomicity.
///
/// # Failures
///
/// Writes are not retried and not rolled back. If writing a blob fails halfway, the chunks that
/// were already written stay behind under a storage id that has no final chunk.
#[derive(Clone, Debug)]
pub struct StorageService(Arc<StorageServiceInner>);

#[derive(Debug)]
struct StorageServiceInner {
    backend: SharedBackend,
    documents: SharedDocumentStore,
    options: StorageOptions,
}

impl StorageService {
    /// Creates a new `StorageService` with the specified configuration.
    pub fn new(config: StorageConfig<'_>, options: StorageOptions) -> Self {
        match config {
            StorageConfig::Memory => Self::with_backend(InMemoryBackend::new(), options),
            StorageConfig::FileSystem { path } => {
                Self::with_backend(LocalFsBackend::new(path), options)
            }
        }
    }

    /// Creates a service from a backend that also provides raw document access.
    pub fn with_backend<B>(backend: B, options: StorageOptions) -> Self
    where
        B: Backend + DocumentStore,
    {
        let backend = Arc::new(backend);
        Self::from_backends(backend.clone(), backend, options)
    }

    /// Creates a service from separate chunk and document backends.
    pub fn from_backends(
        backend: SharedBackend,
        documents: SharedDocumentStore,
        options: StorageOptions,
    ) -> Self {
        let options = StorageOptions {
            chunk_size: options.chunk_size.max(1),
            ..options
        };

        Self(Arc::new(StorageServiceInner {
            backend,
            documents,
            options,
        }))
    }

    /// Returns the chunk backend shared by this service.
    pub fn backend(&self) -> &SharedBackend {
        &self.0.backend
    }

    /// Returns the raw document store shared by this service.
    pub fn documents(&self) -> &SharedDocumentStore {
        &self.0.documents
    }

    /// Returns the options this service was created with.
    pub fn options(&self) -> &StorageOptions {
        &self.0.options
    }

    /// Stores a new blob and returns its metadata, including the generated storage id.
    ///
    /// The whole stream is consumed. If the stream yields an error, the bytes received so far
    /// are still finalized as a blob before the error is returned.
    pub async fn store(
        &self,
        schema: &str,
        schema_version: &SchemaVersion,
        world_id: &str,
        path: &str,
        stream: PayloadStream,
    ) -> Result<StorageInfo> {
        let header = BlobHeader {
            uuid: new_storage_id(),
            schema: schema.to_owned(),
            schema_version: schema_version.to_string(),
            world_id: world_id.to_owned(),
            path: path.to_owned(),
            created_at: SystemTime::now(),
        };

        let info = self.write_blob(header, stream).await?;
        tracing::info!(storage_id = %info.id, size = info.size, %world_id, "stored blob");
        Ok(info)
    }

    /// Opens a blob for reading.
    ///
    /// Fails with [`Error::NotFound`] if no final chunk exists for `storage_id`.
    pub async fn load(&self, storage_id: &str) -> Result<ChunkedInputStream> {
        let storage_id = validate_id(storage_id)?;

        let finals = self.0.backend.get_final_chunks(storage_id).await?;
        if finals.is_empty() {
            return Err(Error::NotFound(storage_id.to_owned()));
        }

        Ok(ChunkedInputStream::new(
            Arc::clone(&self.0.backend),
            storage_id,
        ))
    }

    /// Stores new content for an existing blob under a fresh storage id.
    ///
    /// `path` and `world_id` are carried over from the existing blob, as are `schema` and
    /// `schema_version` unless given. The old storage id is scheduled for deletion and stays
    /// readable until the deletion grace period has passed.
    pub async fn update(
        &self,
        schema: Option<&str>,
        schema_version: Option<&SchemaVersion>,
        storage_id: &str,
        stream: PayloadStream,
    ) -> Result<StorageInfo> {
        let existing = self.final_chunk(storage_id).await?;
        let header = derived_header(&existing, new_storage_id(), schema, schema_version);

        let info = self.write_blob(header, stream).await?;
        self.delete(&existing.uuid).await?;

        tracing::info!(
            old_storage_id = %existing.uuid,
            storage_id = %info.id,
            size = info.size,
            "updated blob"
        );
        Ok(info)
    }

    /// Stores new content for an existing blob, keeping its storage id.
    ///
    /// All existing chunks are deleted before the new content is written. Until the write
    /// completes, readers of `storage_id` may see the blob as missing or torn.
    pub async fn replace(
        &self,
        schema: Option<&str>,
        schema_version: Option<&SchemaVersion>,
        storage_id: &str,
        stream: PayloadStream,
    ) -> Result<StorageInfo> {
        let existing = self.final_chunk(storage_id).await?;
        let header = derived_header(&existing, existing.uuid.clone(), schema, schema_version);

        let removed = self.0.backend.delete_chunks(&existing.uuid).await?;
        tracing::debug!(storage_id = %existing.uuid, removed, "removed chunks for replace");

        let info = self.write_blob(header, stream).await?;
        tracing::info!(storage_id = %info.id, size = info.size, "replaced blob");
        Ok(info)
    }

    /// Schedules a blob for deletion after the deletion grace period.
    ///
    /// The chunks are not touched; they are removed by the [cleanup
    /// scheduler](crate::cleanup::StorageCleanupScheduler) once the grace period has passed. A
    /// blank storage id is logged and ignored.
    pub async fn delete(&self, storage_id: &str) -> Result<()> {
        let Ok(storage_id) = validate_id(storage_id) else {
            tracing::warn!("ignoring deletion of blank storage id");
            return Ok(());
        };

        let deleted_at = SystemTime::now() + self.0.options.deletion_grace;
        self.0
            .backend
            .put_deletion(StorageDelete::new(storage_id, deleted_at))
            .await?;

        tracing::info!(%storage_id, "scheduled blob for deletion");
        Ok(())
    }

    /// Returns the metadata of a blob.
    ///
    /// If concurrent replaces left more than one final chunk behind, the most recently created
    /// one wins and the others are deleted.
    pub async fn info(&self, storage_id: &str) -> Result<StorageInfo> {
        self.final_chunk(storage_id).await?.info()
    }

    async fn write_blob(&self, header: BlobHeader, stream: PayloadStream) -> Result<StorageInfo> {
        let start = Instant::now();
        let mut output = ChunkedOutputStream::new(
            Arc::clone(&self.0.backend),
            header,
            self.0.options.chunk_size,
        );

        // The final chunk is written even if the input fails, so close before inspecting the
        // copy result.
        let copied = output.copy_from(stream).await;
        let closed = output.close().await;

        if let Err(err) = copied {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "input stream failed, blob finalized with partial content"
            );
            return Err(err);
        }

        let final_chunk = closed?;
        tracing::debug!(
            storage_id = %final_chunk.uuid,
            chunks = final_chunk.index + 1,
            elapsed = ?start.elapsed(),
            "wrote blob"
        );
        final_chunk.info()
    }

    /// Looks up the authoritative final chunk of a blob, repairing duplicates.
    async fn final_chunk(&self, storage_id: &str) -> Result<StorageData> {
        let storage_id = validate_id(storage_id)?;

        let mut finals = self.0.backend.get_final_chunks(storage_id).await?;
        finals.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

        let Some(latest) = finals.pop() else {
            return Err(Error::NotFound(storage_id.to_owned()));
        };

        for stale in finals {
            tracing::warn!(
                %storage_id,
                index = stale.index,
                kept_index = latest.index,
                "found duplicate final chunk, removing older one"
            );
            if let Err(err) = self.0.backend.delete_chunk(&stale).await {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    %storage_id,
                    "failed to remove duplicate final chunk"
                );
            }
        }

        Ok(latest)
    }
}

fn validate_id(storage_id: &str) -> Result<&str> {
    if storage_id.trim().is_empty() {
        return Err(Error::MalformedId(storage_id.to_owned()));
    }
    Ok(storage_id)
}

fn derived_header(
    existing: &StorageData,
    uuid: String,
    schema: Option<&str>,
    schema_version: Option<&SchemaVersion>,
) -> BlobHeader {
    BlobHeader {
        uuid,
        schema: schema.map_or_else(|| existing.schema.clone(), str::to_owned),
        schema_version: schema_version
            .map_or_else(|| existing.schema_version.clone(), SchemaVersion::to_string),
        world_id: existing.world_id.clone(),
        path: existing.path.clone(),
        created_at: SystemTime::now(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use chunkstore_test::payload;

    use super::*;
    use crate::datamodel::new_record_id;

    const CHUNK_SIZE: usize = 512 * 1024;

    fn make_service() -> (StorageService, InMemoryBackend) {
        let backend = InMemoryBackend::new();
        let service = StorageService::with_backend(backend.clone(), StorageOptions::default());
        (service, backend)
    }

    fn version(v: &str) -> SchemaVersion {
        SchemaVersion::create(v).unwrap()
    }

    async fn read_blob(service: &StorageService, id: &str) -> Vec<u8> {
        let input = service.load(id).await.unwrap();
        payload::collect(input.into_stream()).await.unwrap()
    }

    #[tokio::test]
    async fn splits_large_blob_into_chunks() {
        chunkstore_test::tracing::init();
        let (service, backend) = make_service();
        let contents = payload::pattern(1_300_000);

        let info = service
            .store(
                "terrain",
                &version("1"),
                "w1",
                "maps/terrain",
                payload::pieces(&contents, 100_000),
            )
            .await
            .unwrap();
        assert_eq!(info.size, 1_300_000);

        let chunks = backend.get_chunks(&info.id).await.unwrap();
        let sizes: Vec<_> = chunks.iter().map(|c| c.data.len()).collect();
        assert_eq!(sizes, [CHUNK_SIZE, CHUNK_SIZE, 251_424]);
        let indices: Vec<_> = chunks.iter().map(|c| c.index).collect();
        assert_eq!(indices, [0, 1, 2]);
        let finals: Vec<_> = chunks.iter().filter(|c| c.is_final).collect();
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].index, 2);
        assert_eq!(finals[0].size, 1_300_000);

        assert_eq!(read_blob(&service, &info.id).await, contents);
    }

    #[tokio::test]
    async fn round_trips_metadata() {
        let (service, _) = make_service();

        let info = service
            .store("asset", &version("2.1"), "w1", "assets/a", payload::whole(b"hello"))
            .await
            .unwrap();

        let loaded = service.info(&info.id).await.unwrap();
        assert_eq!(loaded, info);
        assert_eq!(loaded.schema, "asset");
        assert_eq!(loaded.schema_version, version("2.1"));
        assert_eq!(loaded.world_id, "w1");
        assert_eq!(loaded.path, "assets/a");
        assert_eq!(loaded.size, 5);
    }

    #[tokio::test]
    async fn stores_empty_blob() {
        let (service, backend) = make_service();

        let info = service
            .store("asset", &SchemaVersion::NULL, "w1", "empty", payload::whole(b""))
            .await
            .unwrap();
        assert_eq!(info.size, 0);
        assert_eq!(backend.chunk_count(&info.id), 1);
        assert!(read_blob(&service, &info.id).await.is_empty());
    }

    #[tokio::test]
    async fn generates_distinct_ids() {
        let (service, _) = make_service();

        let first = service
            .store("asset", &version("1"), "w1", "a", payload::whole(b"same"))
            .await
            .unwrap();
        let second = service
            .store("asset", &version("1"), "w1", "a", payload::whole(b"same"))
            .await
            .unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn load_unknown_or_blank_id() {
        let (service, _) = make_service();

        let err = service.load("does-not-exist").await.unwrap_err();
        assert!(err.is_not_found());

        let err = service.load("  ").await.unwrap_err();
        assert!(matches!(err, Error::MalformedId(_)));
    }

    #[tokio::test]
    async fn load_without_final_chunk_is_not_found() {
        let (service, backend) = make_service();
        let info = service
            .store("asset", &version("1"), "w1", "a", payload::whole(b"hello"))
            .await
            .unwrap();

        backend.remove_chunk(&info.id, 0);
        assert!(service.load(&info.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn failing_stream_finalizes_partial_blob() {
        let (service, backend) = make_service();

        let err = service
            .store("asset", &version("1"), "w1", "a", payload::failing_after(b"partial"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(!backend.is_empty());
    }

    #[tokio::test]
    async fn update_writes_new_id_and_schedules_old() {
        let (service, backend) = make_service();
        let old = service
            .store("asset", &version("1"), "w1", "assets/a", payload::whole(b"old"))
            .await
            .unwrap();

        let new = service
            .update(None, Some(&version("2")), &old.id, payload::whole(b"new content"))
            .await
            .unwrap();

        assert_ne!(new.id, old.id);
        assert_eq!(new.path, "assets/a");
        assert_eq!(new.world_id, "w1");
        assert_eq!(new.schema, "asset");
        assert_eq!(new.schema_version, version("2"));
        assert_eq!(read_blob(&service, &new.id).await, b"new content");

        // the old blob stays readable until the grace period has passed
        assert_eq!(read_blob(&service, &old.id).await, b"old");
        assert_eq!(backend.deletion_count(), 1);
        let due = backend
            .due_deletions(SystemTime::now() + DEFAULT_DELETION_GRACE + Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].storage_id, old.id);
        assert!(backend.due_deletions(SystemTime::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_unknown_id() {
        let (service, backend) = make_service();

        let err = service
            .update(None, None, "missing", payload::whole(b"data"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn replace_keeps_id() {
        let (service, backend) = make_service();
        let options = StorageOptions {
            chunk_size: 4,
            ..Default::default()
        };
        let service = StorageService::from_backends(
            service.backend().clone(),
            service.documents().clone(),
            options,
        );

        let old = service
            .store("asset", &version("1"), "w1", "assets/a", payload::whole(b"0123456789"))
            .await
            .unwrap();
        assert_eq!(backend.chunk_count(&old.id), 3);

        let new = service
            .replace(Some("texture"), None, &old.id, payload::whole(b"abc"))
            .await
            .unwrap();

        assert_eq!(new.id, old.id);
        assert_eq!(new.schema, "texture");
        assert_eq!(new.schema_version, version("1"));
        assert_eq!(new.size, 3);
        assert_eq!(backend.chunk_count(&old.id), 1);
        assert_eq!(backend.deletion_count(), 0);
        assert_eq!(read_blob(&service, &old.id).await, b"abc");

        let info = service.info(&old.id).await.unwrap();
        assert_eq!(info.id, old.id);
        assert_eq!(info.size, 3);
        assert_eq!(info.schema, "texture");
    }

    #[tokio::test]
    async fn single_byte_chunks() {
        let backend = InMemoryBackend::new();
        let options = StorageOptions {
            chunk_size: 1,
            ..Default::default()
        };
        let service = StorageService::with_backend(backend.clone(), options);
        let contents = payload::pattern(300);

        let info = service
            .store("asset", &version("1"), "w1", "a", payload::pieces(&contents, 7))
            .await
            .unwrap();
        assert_eq!(info.size, 300);
        // one chunk per byte plus the empty final chunk
        assert_eq!(backend.chunk_count(&info.id), 301);
        assert_eq!(read_blob(&service, &info.id).await, contents);
    }

    #[tokio::test]
    async fn zero_chunk_size_is_clamped() {
        let backend = InMemoryBackend::new();
        let options = StorageOptions {
            chunk_size: 0,
            ..Default::default()
        };
        let service = StorageService::with_backend(backend.clone(), options);
        assert_eq!(service.options().chunk_size, 1);

        let info = service
            .store("asset", &version("1"), "w1", "a", payload::whole(b"xyz"))
            .await
            .unwrap();
        assert_eq!(backend.chunk_count(&info.id), 4);
        assert_eq!(read_blob(&service, &info.id).await, b"xyz");
    }

    #[tokio::test]
    async fn delete_is_deferred_and_idempotent() {
        let (service, backend) = make_service();
        let info = service
            .store("asset", &version("1"), "w1", "a", payload::whole(b"hello"))
            .await
            .unwrap();

        service.delete(&info.id).await.unwrap();
        service.delete(&info.id).await.unwrap();

        // chunks are untouched until the cleanup sweep
        assert_eq!(read_blob(&service, &info.id).await, b"hello");
        assert_eq!(backend.deletion_count(), 2);

        service.delete("").await.unwrap();
        assert_eq!(backend.deletion_count(), 2);
    }

    #[tokio::test]
    async fn info_repairs_duplicate_finals() {
        let (service, backend) = make_service();
        let info = service
            .store("asset", &version("1"), "w1", "a", payload::whole(b"hello"))
            .await
            .unwrap();

        let mut newer = backend.get_chunk(&info.id, 0).await.unwrap().unwrap();
        newer.id = new_record_id();
        newer.index = 1;
        newer.data = Bytes::from_static(b"world");
        newer.size = 10;
        newer.created_at = info.created_at + Duration::from_secs(1);
        backend.put_chunk(newer).await.unwrap();
        assert_eq!(backend.get_final_chunks(&info.id).await.unwrap().len(), 2);

        let repaired = service.info(&info.id).await.unwrap();
        assert_eq!(repaired.size, 10);

        let finals = backend.get_final_chunks(&info.id).await.unwrap();
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].index, 1);
    }

    #[tokio::test]
    async fn filesystem_service() {
        let tempdir = tempfile::tempdir().unwrap();
        let config = StorageConfig::FileSystem {
            path: tempdir.path(),
        };
        let options = StorageOptions {
            chunk_size: 1024,
            ..Default::default()
        };
        let service = StorageService::new(config, options);
        let contents = payload::pattern(5000);

        let info = service
            .store("asset", &version("1"), "w1", "a", payload::whole(&contents))
            .await
            .unwrap();
        assert_eq!(info.size, 5000);
        assert_eq!(service.backend().get_chunks(&info.id).await.unwrap().len(), 5);
        assert_eq!(read_blob(&service, &info.id).await, contents);
        assert_eq!(service.backend().name(), "local-fs");
    }

    #[tokio::test]
    async fn filesystem_info_reads_only_final_chunk() {
        let tempdir = tempfile::tempdir().unwrap();
        let config = StorageConfig::FileSystem {
            path: tempdir.path(),
        };
        let options = StorageOptions {
            chunk_size: 4,
            ..Default::default()
        };
        let service = StorageService::new(config, options);
        let info = service
            .store("asset", &version("1"), "w1", "a", payload::whole(b"0123456789"))
            .await
            .unwrap();

        let middle = tempdir
            .path()
            .join(crate::datamodel::STORAGE_DATA_COLLECTION)
            .join(&info.id)
            .join("0000000001.json");
        std::fs::write(middle, b"garbage").unwrap();

        assert_eq!(service.info(&info.id).await.unwrap().size, 10);

        // the corrupt chunk only surfaces once the reader reaches it
        let mut input = service.load(&info.id).await.unwrap();
        let mut buf = [0; 4];
        assert_eq!(input.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"0123");
        let err = input.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, Error::Serde { .. }), "{err:?}");
    }
}
