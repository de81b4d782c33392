//! Metadata of a stored blob.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::SchemaVersion;

/// Metadata describing one logical, reassembled blob.
///
/// A `StorageInfo` is returned by every operation that creates or inspects a blob. It is a
/// snapshot: it is never updated after construction, even if the blob is later replaced or
/// deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageInfo {
    /// The storage id (uuid) of the blob.
    pub id: String,
    /// Total size of the blob payload in bytes.
    pub size: u64,
    /// When the blob was written.
    pub created_at: SystemTime,
    /// The world this blob belongs to.
    pub world_id: String,
    /// Logical path of the blob within its world.
    pub path: String,
    /// Name of the schema the payload is encoded in.
    pub schema: String,
    /// Version of the schema the payload is encoded in.
    pub schema_version: SchemaVersion,
}
