//! Error types for schema migrations.

use chunkstore_types::{SchemaVersion, SchemaVersionError};
use thiserror::Error;

/// An error raised by a single [`SchemaMigrator`](crate::SchemaMigrator).
#[derive(Debug, Error)]
pub enum MigratorError {
    /// The payload handed to a byte-level migration was not valid UTF-8.
    #[error("payload is not valid utf-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// The payload could not be parsed or serialized as JSON.
    #[error("payload is not valid json")]
    Json(#[from] serde_json::Error),

    /// The migrator rejected the document.
    #[error("{0}")]
    Failed(String),
}

impl MigratorError {
    /// Creates a [`MigratorError::Failed`] with the given message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Errors of the migration pipeline.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// No chain of registered migrators connects the two versions.
    #[error("no migration path for {entity_type} from {from} to {to}")]
    PathNotFound {
        /// The entity type that was migrated.
        entity_type: String,
        /// The version the document is stored in.
        from: SchemaVersion,
        /// The requested target version.
        to: SchemaVersion,
    },

    /// A migrator of the chain failed. Nothing was persisted.
    #[error("migration of {entity_type} from {from} to {to} failed")]
    Execution {
        /// The entity type that was migrated.
        entity_type: String,
        /// The source version of the failing step.
        from: SchemaVersion,
        /// The target version of the failing step.
        to: SchemaVersion,
        /// The error raised by the migrator.
        #[source]
        cause: MigratorError,
    },

    /// Two migrators were registered for the same entity type and version step.
    #[error("duplicate migrator for {entity_type} from {from} to {to}")]
    DuplicateMigrator {
        /// The entity type of both migrators.
        entity_type: String,
        /// The shared source version.
        from: SchemaVersion,
        /// The shared target version.
        to: SchemaVersion,
    },

    /// The document is not a JSON object and cannot carry a schema version.
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// A document could not be converted from or to JSON.
    #[error("json error")]
    Json(#[from] serde_json::Error),

    /// A stored schema version could not be parsed.
    #[error("invalid schema version")]
    Version(#[from] SchemaVersionError),

    /// The document store failed.
    #[error("document store error")]
    Store(#[from] chunkstore_service::Error),
}

/// Result type for migration operations.
pub type Result<T, E = MigrationError> = std::result::Result<T, E>;
