//! The service layer provides chunked blob storage on top of a document store.
//!
//! Blobs of arbitrary size are split into chunk documents that each fit below the per-document
//! size limit of the store, and lazily reassembled on read. Deletions are deferred and carried
//! out by the [`StorageCleanupScheduler`].
//!
//! It is designed as a library crate to be used by the `server` and the schema pipeline.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod backend;
pub mod chunked;
pub mod cleanup;
pub mod datamodel;
mod error;
mod service;
pub mod stream;

pub use backend::common::{Backend, DocumentStore, ID_FIELD, SharedBackend, SharedDocumentStore};
pub use chunked::{ChunkedInputStream, ChunkedOutputStream};
pub use cleanup::{StorageCleanupScheduler, SweepReport};
pub use error::{Error, Result};
pub use service::*;
pub use stream::PayloadStream;
