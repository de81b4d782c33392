//! Documents persisted in the backing document store.
//!
//! A logical blob is stored as a sequence of [`StorageData`] chunk documents sharing one `uuid`.
//! Indices are contiguous starting at `0`, and exactly one chunk (the last one) is marked final.
//! Only the final chunk carries the total size of the blob.
//!
//! Pending deletions are recorded as [`StorageDelete`] documents and consumed by the
//! [cleanup scheduler](crate::cleanup::StorageCleanupScheduler).

use std::time::SystemTime;

use bytes::Bytes;
use chunkstore_types::{SchemaVersion, StorageInfo};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Collection name of chunk documents.
pub const STORAGE_DATA_COLLECTION: &str = "storage_data";
/// Collection name of pending deletion markers.
pub const STORAGE_DELETE_COLLECTION: &str = "storage_delete";

/// One persisted chunk of a logical blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageData {
    /// Database id of this chunk document.
    pub id: String,
    /// Storage id of the blob this chunk belongs to.
    pub uuid: String,
    /// Logical path of the blob.
    pub path: String,
    /// The world the blob belongs to.
    pub world_id: String,
    /// Zero-based position of this chunk within the blob.
    pub index: u32,
    /// The chunk payload, at most one chunk size long.
    #[serde(with = "base64")]
    pub data: Bytes,
    /// Name of the payload schema.
    pub schema: String,
    /// Version of the payload schema.
    pub schema_version: String,
    /// Whether this is the last chunk of the blob.
    pub is_final: bool,
    /// Total blob size. Only meaningful on the final chunk.
    pub size: u64,
    /// When the write of the blob started. The same on every chunk of one write.
    pub created_at: SystemTime,
    /// When this chunk document was persisted.
    ///
    /// Chunks of a long running write are written well after `created_at`. The orphan sweep
    /// relies on this to tell stalled writes from active ones.
    pub written_at: SystemTime,
}

impl StorageData {
    /// Projects the blob metadata recorded on this chunk.
    ///
    /// This is only meaningful for the final chunk, which carries the total size.
    pub fn info(&self) -> Result<StorageInfo> {
        Ok(StorageInfo {
            id: self.uuid.clone(),
            size: self.size,
            created_at: self.created_at,
            world_id: self.world_id.clone(),
            path: self.path.clone(),
            schema: self.schema.clone(),
            schema_version: SchemaVersion::create(&self.schema_version)?,
        })
    }
}

/// A pending deletion of all chunks of one blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageDelete {
    /// Database id of this marker.
    pub id: String,
    /// The storage id (uuid) whose chunks will be removed.
    pub storage_id: String,
    /// The point in time after which the chunks may be removed.
    pub deleted_at: SystemTime,
}

impl StorageDelete {
    /// Creates a marker for `storage_id` that becomes due at `deleted_at`.
    pub fn new(storage_id: &str, deleted_at: SystemTime) -> Self {
        Self {
            id: new_record_id(),
            storage_id: storage_id.to_owned(),
            deleted_at,
        }
    }
}

/// Generates a fresh database id for a document.
pub fn new_record_id() -> String {
    Uuid::now_v7().to_string()
}

/// Generates a fresh storage id for a blob.
pub fn new_storage_id() -> String {
    Uuid::new_v4().to_string()
}

/// Serializes chunk payloads as padded base64 strings.
mod base64 {
    use bytes::Bytes;
    use data_encoding::BASE64;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
