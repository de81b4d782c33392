//! Backends of the document store the service writes to.

pub mod common;
pub mod in_memory;
pub mod local_fs;
