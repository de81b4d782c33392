//! Single-step document migrators.

use std::fmt;

use chunkstore_types::SchemaVersion;
use serde_json::Value;

use crate::error::MigratorError;

/// Transforms documents of one entity type from one schema version to the next.
///
/// Migrators must be deterministic and free of side effects. They never set the schema version
/// field of the document; the [`SchemaMigrationService`](crate::SchemaMigrationService) stamps
/// it after the whole chain has been applied.
pub trait SchemaMigrator: Send + Sync + 'static {
    /// The entity type whose documents this migrator understands.
    fn entity_type(&self) -> &str;

    /// The version of documents accepted by [`migrate`](Self::migrate).
    fn from_version(&self) -> &SchemaVersion;

    /// The version of documents produced by [`migrate`](Self::migrate).
    fn to_version(&self) -> &SchemaVersion;

    /// Migrates a JSON document.
    fn migrate(&self, document: &Value) -> Result<Value, MigratorError>;

    /// Migrates a serialized JSON payload.
    ///
    /// The default implementation decodes the payload as UTF-8 JSON, delegates to
    /// [`migrate`](Self::migrate) and encodes the result again.
    fn migrate_bytes(&self, payload: &[u8]) -> Result<Vec<u8>, MigratorError> {
        let text = std::str::from_utf8(payload)?;
        let document: Value = serde_json::from_str(text)?;
        let migrated = self.migrate(&document)?;
        Ok(serde_json::to_vec(&migrated)?)
    }
}

/// A boxed [`SchemaMigrator`] as accepted by the migration service.
pub type BoxedMigrator = Box<dyn SchemaMigrator>;

/// A [`SchemaMigrator`] backed by a closure.
pub struct FnMigrator<F> {
    entity_type: String,
    from: SchemaVersion,
    to: SchemaVersion,
    func: F,
}

impl<F> FnMigrator<F>
where
    F: Fn(&Value) -> Result<Value, MigratorError> + Send + Sync + 'static,
{
    /// Creates a migrator from `from` to `to` for `entity_type`.
    pub fn new(
        entity_type: impl Into<String>,
        from: SchemaVersion,
        to: SchemaVersion,
        func: F,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            from,
            to,
            func,
        }
    }

    /// Boxes this migrator for registration.
    pub fn boxed(self) -> BoxedMigrator {
        Box::new(self)
    }
}

impl<F> fmt::Debug for FnMigrator<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnMigrator")
            .field("entity_type", &self.entity_type)
            .field("from", &self.from)
            .field("to", &self.to)
            .finish_non_exhaustive()
    }
}

impl<F> SchemaMigrator for FnMigrator<F>
where
    F: Fn(&Value) -> Result<Value, MigratorError> + Send + Sync + 'static,
{
    fn entity_type(&self) -> &str {
        &self.entity_type
    }

    fn from_version(&self) -> &SchemaVersion {
        &self.from
    }

    fn to_version(&self) -> &SchemaVersion {
        &self.to
    }

    fn migrate(&self, document: &Value) -> Result<Value, MigratorError> {
        (self.func)(document)
    }
}
