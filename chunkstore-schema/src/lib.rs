//! Schema versioning for stored entity documents.
//!
//! Entity documents carry the schema version they were written with in the
//! [`SCHEMA_VERSION_FIELD`]. When the shape of an entity changes, a [`SchemaMigrator`] is
//! registered for the step from the old to the new version. The [`SchemaMigrationService`]
//! chains those steps to bring a document from any stored version to the current one.
//!
//! The [`SchemaVersionEventListener`] hooks this into persistence: it stamps the current version
//! on save and, if enabled, migrates outdated documents when they are loaded.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

mod error;
mod listener;
mod migrator;
mod service;

pub use error::*;
pub use listener::*;
pub use migrator::*;
pub use service::*;
