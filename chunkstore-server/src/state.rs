use std::sync::Arc;

use anyhow::Context;
use chunkstore_schema::{BoxedMigrator, SchemaMigrationService, SchemaVersionEventListener};
use chunkstore_service::{StorageCleanupScheduler, StorageConfig, StorageService};

use crate::config::{Config, Storage};

/// Shared reference to the chunkstore [state](State).
pub type ServiceState = Arc<State>;

/// The services of a chunkstore process.
///
/// This structure is created at startup. It gives access to the blob storage service, the
/// schema version hook for entity documents and the cleanup sweep, all sharing one document
/// store.
#[derive(Debug)]
pub struct State {
    /// The process configuration.
    pub config: Config,
    /// The storage service instance.
    pub service: StorageService,
    /// Schema version handling for entity documents.
    pub schema: SchemaVersionEventListener,
}

impl State {
    /// Creates the services of a process without any schema migrators.
    pub fn new(config: Config) -> anyhow::Result<ServiceState> {
        Self::with_migrators(config, Vec::new())
    }

    /// Creates the services of a process with the given schema migrators.
    pub fn with_migrators(
        config: Config,
        migrators: Vec<BoxedMigrator>,
    ) -> anyhow::Result<ServiceState> {
        let storage = map_storage_config(&config.storage);
        let service = StorageService::new(storage, config.service.options());
        tracing::info!(backend = service.backend().name(), "initialized storage service");

        let migrations = SchemaMigrationService::new(migrators)
            .context("failed to register schema migrators")?;
        tracing::debug!(?migrations, "registered schema migrators");

        let schema = SchemaVersionEventListener::new(
            Arc::new(migrations),
            Arc::clone(service.documents()),
            config.schema.auto_migrate,
        );

        Ok(Arc::new(Self {
            config,
            service,
            schema,
        }))
    }

    /// Creates a cleanup scheduler for the storage service.
    pub fn cleanup_scheduler(&self) -> StorageCleanupScheduler {
        let cleanup = &self.config.cleanup;
        StorageCleanupScheduler::new(Arc::clone(self.service.backend()), cleanup.interval())
            .with_orphan_ttl(cleanup.orphan_ttl)
    }
}

fn map_storage_config(config: &'_ Storage) -> StorageConfig<'_> {
    match config {
        Storage::Memory => StorageConfig::Memory,
        Storage::FileSystem { path } => StorageConfig::FileSystem { path },
    }
}
