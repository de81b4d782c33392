//! The `chunkstore` binary.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

fn main() -> anyhow::Result<()> {
    chunkstore_server::cli::execute()
}
