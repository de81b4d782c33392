//! The backend contract shared by all document store implementations.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::SystemTime;

use serde_json::{Map, Value};

use crate::datamodel::{StorageData, StorageDelete};
use crate::error::Result;

/// Name of the identity field of raw documents.
///
/// This field is never written by [`DocumentStore::update_fields`].
pub const ID_FIELD: &str = "_id";

/// A shared [`Backend`] instance.
pub type SharedBackend = Arc<dyn Backend>;

/// A shared [`DocumentStore`] instance.
pub type SharedDocumentStore = Arc<dyn DocumentStore>;

/// The chunk and deletion collections of the backing document store.
///
/// Every method is a single round-trip against the store. Only single-document writes are
/// expected to be atomic; the service never relies on multi-document transactions.
#[async_trait::async_trait]
pub trait Backend: Debug + Send + Sync + 'static {
    /// The backend name, used for diagnostics.
    fn name(&self) -> &'static str;

    /// Inserts or replaces a chunk document, keyed by its record id.
    async fn put_chunk(&self, chunk: StorageData) -> Result<()>;

    /// Looks up the chunk of `uuid` at `index`.
    async fn get_chunk(&self, uuid: &str, index: u32) -> Result<Option<StorageData>>;

    /// Returns all chunks of `uuid` marked final.
    ///
    /// Under normal operation there is at most one. More than one means two writers raced on the
    /// same uuid.
    async fn get_final_chunks(&self, uuid: &str) -> Result<Vec<StorageData>>;

    /// Returns all chunks of `uuid`, ordered by index.
    async fn get_chunks(&self, uuid: &str) -> Result<Vec<StorageData>>;

    /// Deletes all chunks of `uuid` and returns how many were removed.
    ///
    /// Deleting an unknown uuid is not an error.
    async fn delete_chunks(&self, uuid: &str) -> Result<u64>;

    /// Deletes exactly this chunk document, matched by its record id.
    ///
    /// A chunk that was already removed or overwritten by another record is left alone.
    async fn delete_chunk(&self, chunk: &StorageData) -> Result<()>;

    /// Inserts a pending deletion marker.
    async fn put_deletion(&self, deletion: StorageDelete) -> Result<()>;

    /// Returns all deletion markers with `deleted_at <= now`.
    async fn due_deletions(&self, now: SystemTime) -> Result<Vec<StorageDelete>>;

    /// Removes a deletion marker by its record id.
    async fn delete_deletion(&self, record_id: &str) -> Result<()>;

    /// Returns uuids that have chunks but no final chunk, and whose newest chunk was created
    /// before `older_than`.
    async fn partial_uuids(&self, older_than: SystemTime) -> Result<Vec<String>>;
}

/// Raw JSON access to arbitrary collections of the document store.
///
/// This is used by the schema migration hook to rewrite documents in place.
#[async_trait::async_trait]
pub trait DocumentStore: Debug + Send + Sync + 'static {
    /// Loads a document by id.
    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    /// Inserts or replaces a whole document.
    async fn put_document(&self, collection: &str, id: &str, document: Value) -> Result<()>;

    /// Overwrites the given top-level fields of an existing document.
    ///
    /// The [`ID_FIELD`] is skipped if present. Returns [`Error::NotFound`] if the document does
    /// not exist.
    ///
    /// [`Error::NotFound`]: crate::Error::NotFound
    async fn update_fields(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<()>;
}
