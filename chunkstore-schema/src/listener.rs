//! Schema version handling on save and load of entities.
//!
//! Entity types declare their current schema version through [`VersionedEntity`]. The
//! [`SchemaVersionEventListener`] stamps that version onto every saved document and compares it
//! against the stored version of every loaded document. On a mismatch it can migrate the stored
//! document in place.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chunkstore_service::{Error as StoreError, SharedDocumentStore};
use chunkstore_types::SchemaVersion;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{MigrationError, Result};
use crate::service::{SCHEMA_VERSION_FIELD, SchemaMigrationService, stored_version};

/// An entity type persisted as a JSON document with a declared schema version.
pub trait VersionedEntity: Serialize + DeserializeOwned {
    /// The entity type name used to look up migrators.
    const ENTITY_TYPE: &'static str;

    /// The document collection entities of this type are stored in.
    const COLLECTION: &'static str;

    /// The current schema version, or `None` for unversioned entities.
    const SCHEMA_VERSION: Option<&'static str>;

    /// The document id of this entity, if it has been assigned one.
    fn entity_id(&self) -> Option<&str>;
}

/// The schema version an entity type declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeclaredVersion {
    /// The entity type does not declare a version. Its documents are never checked.
    Unversioned,
    /// The entity type declares this version.
    Versioned(SchemaVersion),
}

/// Read-through cache of the versions declared by entity types.
#[derive(Debug, Default)]
pub struct SchemaVersionRegistry {
    versions: RwLock<HashMap<&'static str, DeclaredVersion>>,
}

impl SchemaVersionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the version declared by `E`, computing it on first access.
    ///
    /// A declared version that cannot be parsed, or that is the null version, is treated as
    /// unversioned.
    pub fn declared_version<E: VersionedEntity>(&self) -> DeclaredVersion {
        if let Some(version) = self.cached(E::ENTITY_TYPE) {
            return version;
        }

        let version = match E::SCHEMA_VERSION.map(SchemaVersion::create) {
            Some(Ok(version)) if !version.is_null() => DeclaredVersion::Versioned(version),
            Some(Err(err)) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    entity_type = E::ENTITY_TYPE,
                    "ignoring invalid declared schema version"
                );
                DeclaredVersion::Unversioned
            }
            _ => DeclaredVersion::Unversioned,
        };

        self.versions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(E::ENTITY_TYPE, version.clone());
        version
    }

    /// Returns the cached version of `entity_type` without computing it.
    pub fn cached(&self, entity_type: &str) -> Option<DeclaredVersion> {
        self.versions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(entity_type)
            .cloned()
    }
}

/// Persistence hook that keeps entity documents at their declared schema version.
#[derive(Debug)]
pub struct SchemaVersionEventListener {
    registry: SchemaVersionRegistry,
    migrations: Arc<SchemaMigrationService>,
    documents: SharedDocumentStore,
    auto_migrate: bool,
}

impl SchemaVersionEventListener {
    /// Creates a listener.
    ///
    /// With `auto_migrate` disabled, version mismatches on load are only logged.
    pub fn new(
        migrations: Arc<SchemaMigrationService>,
        documents: SharedDocumentStore,
        auto_migrate: bool,
    ) -> Self {
        Self {
            registry: SchemaVersionRegistry::new(),
            migrations,
            documents,
            auto_migrate,
        }
    }

    /// Returns the registry of declared versions.
    pub fn registry(&self) -> &SchemaVersionRegistry {
        &self.registry
    }

    /// Stamps the declared version of `E` onto an outgoing document.
    ///
    /// The stamp always overwrites a version already present in the document.
    pub fn before_save<E: VersionedEntity>(&self, document: &mut Value) {
        let DeclaredVersion::Versioned(version) = self.registry.declared_version::<E>() else {
            return;
        };

        match document.as_object_mut() {
            Some(object) => {
                object.insert(
                    SCHEMA_VERSION_FIELD.to_owned(),
                    Value::String(version.to_string()),
                );
            }
            None => tracing::warn!(
                entity_type = E::ENTITY_TYPE,
                "cannot stamp schema version on non-object document"
            ),
        }
    }

    /// Checks a freshly loaded entity against its declared version.
    ///
    /// `document` is the raw document `entity` was deserialized from. If its version differs
    /// from the declared one and auto migration is enabled, the stored document is migrated and
    /// updated, and the migrated entity is returned. In every other case, including a failed
    /// migration, `entity` is returned as loaded.
    pub async fn after_load<E: VersionedEntity>(&self, entity: E, document: &Value) -> E {
        let DeclaredVersion::Versioned(declared) = self.registry.declared_version::<E>() else {
            return entity;
        };

        let stored = match stored_version(document) {
            Ok(stored) => stored,
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    entity_type = E::ENTITY_TYPE,
                    "cannot read stored schema version"
                );
                return entity;
            }
        };

        if stored == declared {
            return entity;
        }

        let Some(id) = entity.entity_id().map(str::to_owned) else {
            tracing::warn!(
                entity_type = E::ENTITY_TYPE,
                %stored,
                %declared,
                "schema version mismatch on entity without id"
            );
            return entity;
        };

        if !self.auto_migrate {
            tracing::warn!(
                entity_type = E::ENTITY_TYPE,
                entity_id = %id,
                %stored,
                %declared,
                "schema version mismatch, auto migration disabled"
            );
            return entity;
        }

        tracing::info!(
            entity_type = E::ENTITY_TYPE,
            entity_id = %id,
            %stored,
            %declared,
            "migrating stored document"
        );
        match self.migrate_stored::<E>(&id, &declared).await {
            Ok(migrated) => migrated,
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    entity_type = E::ENTITY_TYPE,
                    entity_id = %id,
                    %stored,
                    %declared,
                    "failed to migrate stored document"
                );
                entity
            }
        }
    }

    /// Serializes `entity`, stamps its version and writes it to its collection.
    pub async fn save<E: VersionedEntity>(&self, entity: &E) -> Result<()> {
        let Some(id) = entity.entity_id() else {
            return Err(MigrationError::InvalidDocument(format!(
                "{} has no id",
                E::ENTITY_TYPE
            )));
        };

        let mut document = serde_json::to_value(entity)?;
        self.before_save::<E>(&mut document);
        self.documents
            .put_document(E::COLLECTION, id, document)
            .await?;
        Ok(())
    }

    /// Loads an entity by id, running the [`after_load`](Self::after_load) check.
    pub async fn load<E: VersionedEntity>(&self, id: &str) -> Result<Option<E>> {
        let Some(document) = self.documents.get_document(E::COLLECTION, id).await? else {
            return Ok(None);
        };

        let entity = serde_json::from_value(document.clone())?;
        Ok(Some(self.after_load(entity, &document).await))
    }

    async fn migrate_stored<E: VersionedEntity>(
        &self,
        id: &str,
        declared: &SchemaVersion,
    ) -> Result<E> {
        // The stored document is authoritative, the caller's copy may be stale.
        let document = self
            .documents
            .get_document(E::COLLECTION, id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_owned()))?;
        let current = stored_version(&document)?;

        let migrated = self
            .migrations
            .migrate(&document, E::ENTITY_TYPE, declared, &current)?;
        let Value::Object(fields) = &migrated else {
            return Err(MigrationError::InvalidDocument(format!(
                "migrated {} is not an object",
                E::ENTITY_TYPE
            )));
        };

        self.documents
            .update_fields(E::COLLECTION, id, fields.clone())
            .await?;
        Ok(serde_json::from_value(migrated)?)
    }
}
