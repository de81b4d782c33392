//! Error types for the storage service.

use thiserror::Error;

/// Errors that can occur in the storage service and its backends.
#[derive(Debug, Error)]
pub enum Error {
    /// IO errors related to payload streaming or file operations.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors related to de/serialization of stored documents.
    #[error("serde error: {context}")]
    Serde {
        /// What was being de/serialized.
        context: String,
        /// The underlying error.
        #[source]
        cause: serde_json::Error,
    },

    /// The storage id was blank or otherwise unusable as an identifier.
    #[error("malformed storage id: {0:?}")]
    MalformedId(String),

    /// No final chunk exists for the requested storage id.
    #[error("storage entry not found: {0}")]
    NotFound(String),

    /// A chunk before the final one is missing.
    ///
    /// This indicates corrupted data or a blob that was deleted while it was being read.
    #[error("chunk {index} of storage entry {storage_id} is missing")]
    MissingChunk {
        /// The storage id that was being read.
        storage_id: String,
        /// The first index that could not be found.
        index: u32,
    },

    /// The bytes read for a blob do not add up to the size recorded on its final chunk.
    #[error("storage entry {storage_id} has {actual} bytes, expected {expected}")]
    SizeMismatch {
        /// The storage id that was being read.
        storage_id: String,
        /// The size recorded on the final chunk.
        expected: u64,
        /// The number of bytes actually read.
        actual: u64,
    },

    /// A stored schema version could not be parsed.
    #[error("invalid schema version: {0}")]
    SchemaVersion(#[from] chunkstore_types::SchemaVersionError),

    /// Any other error stemming from one of the storage backends.
    #[error("storage backend error: {context}")]
    Backend {
        /// Description of the failed operation.
        context: String,
        /// The underlying error.
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl Error {
    /// Creates an [`Error::Serde`] with the given context.
    pub fn serde(context: impl Into<String>, cause: serde_json::Error) -> Self {
        Self::Serde {
            context: context.into(),
            cause,
        }
    }

    /// Returns `true` if this error signals an unknown storage id.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type for storage service operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
