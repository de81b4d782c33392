//! Shared value types for the chunkstore.
//!
//! These types are used by both the storage service and the schema migration layer, and are safe
//! to hand out to callers: they are immutable once constructed and carry no shared state.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod info;
pub mod version;

pub use info::StorageInfo;
pub use version::{SchemaVersion, SchemaVersionError};
