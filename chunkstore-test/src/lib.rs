//! Test utilities for the chunk store crates.
//!
//! This crate provides utilities to facilitate testing of the storage service, the schema
//! pipeline and the server. See the modules for all available utilities.

pub mod payload;
pub mod tracing;
