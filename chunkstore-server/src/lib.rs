//! The chunkstore process.
//!
//! This builds on top of [`chunkstore_service`] and [`chunkstore_schema`]. It loads the
//! configuration, sets up logging and error reporting, and exposes the storage layer through a
//! command line interface. A process configured with `cleanup.enabled` owns the periodic cleanup
//! sweep of its deployment.

pub mod blobs;
pub mod cleanup;
pub mod cli;
pub mod config;
pub mod observability;
pub mod state;
