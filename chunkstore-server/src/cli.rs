use std::path::PathBuf;

use anyhow::Result;
use argh::FromArgs;
use chunkstore_types::SchemaVersion;

use crate::blobs::BlobMetadata;
use crate::config::Config;
use crate::state::State;
use crate::{blobs, cleanup, observability};

/// Chunked blob storage on top of a document store.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    #[argh(subcommand)]
    pub command: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Run(RunCommand),
    Sweep(SweepCommand),
    Put(PutCommand),
    Get(GetCommand),
    Info(InfoCommand),
    Delete(DeleteCommand),
    Version(VersionCommand),
}

/// run the chunkstore process until terminated
///
/// If `cleanup.enabled` is set, this process runs the periodic cleanup sweep.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "run")]
struct RunCommand {}

/// run a single cleanup sweep and exit
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "sweep")]
struct SweepCommand {}

/// store a file as a new blob and print its metadata
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "put")]
struct PutCommand {
    /// the file to store
    #[argh(positional)]
    file: PathBuf,

    /// name of the payload schema
    #[argh(option, default = "String::from(\"blob\")")]
    schema: String,

    /// version of the payload schema
    #[argh(option, default = "String::from(\"0\")")]
    schema_version: String,

    /// the world the blob belongs to
    #[argh(option, default = "String::new()")]
    world_id: String,

    /// logical path of the blob, defaults to the file name
    #[argh(option)]
    path: Option<String>,
}

/// write the contents of a blob to a file or stdout
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "get")]
struct GetCommand {
    /// the storage id of the blob
    #[argh(positional)]
    id: String,

    /// the file to write to, defaults to stdout
    #[argh(option, short = 'o')]
    output: Option<PathBuf>,
}

/// print the metadata of a blob
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "info")]
struct InfoCommand {
    /// the storage id of the blob
    #[argh(positional)]
    id: String,
}

/// schedule a blob for deletion
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "delete")]
struct DeleteCommand {
    /// the storage id of the blob
    #[argh(positional)]
    id: String,
}

/// print the chunkstore version
#[derive(Default, Debug, FromArgs)]
#[argh(subcommand, name = "version")]
struct VersionCommand {}

/// Parses the command line, sets up the process and runs the selected command.
pub fn execute() -> Result<()> {
    let args: Args = argh::from_env();

    // Needs neither configuration nor a runtime.
    if let Command::Version(_) = args.command {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = Config::load(args.config.as_deref())?;

    // The Sentry client must exist before any runtime thread is spawned.
    let _sentry_guard = observability::init_sentry(&config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("main-rt")
        .enable_all()
        .worker_threads(config.runtime.worker_threads.max(1))
        .build()?;
    let _runtime_guard = runtime.enter();

    observability::init_tracing(&config);
    tracing::debug!(?config);

    runtime.block_on(async move {
        let state = State::new(config)?;

        match args.command {
            Command::Run(RunCommand {}) => cleanup::run(state).await,
            Command::Sweep(SweepCommand {}) => {
                let report = cleanup::sweep(state).await?;
                println!(
                    "purged {} deleted blobs, removed {} orphans, {} failed",
                    report.purged, report.orphans, report.failed
                );
                Ok(())
            }
            Command::Put(put) => {
                let schema_version = SchemaVersion::create(&put.schema_version)?;
                let metadata = BlobMetadata {
                    schema: &put.schema,
                    schema_version: &schema_version,
                    world_id: &put.world_id,
                    path: put.path.as_deref(),
                };
                let info = blobs::put(&state, &put.file, metadata).await?;
                println!("{}", serde_json::to_string_pretty(&info)?);
                Ok(())
            }
            Command::Get(GetCommand { id, output }) => {
                blobs::get(&state, &id, output.as_deref()).await?;
                Ok(())
            }
            Command::Info(InfoCommand { id }) => {
                let info = blobs::info(&state, &id).await?;
                println!("{}", serde_json::to_string_pretty(&info)?);
                Ok(())
            }
            Command::Delete(DeleteCommand { id }) => {
                blobs::delete(&state, &id).await?;
                println!("scheduled {id} for deletion");
                Ok(())
            }
            Command::Version(VersionCommand {}) => unreachable!(),
        }
    })
}
