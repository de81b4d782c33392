//! Resolution and execution of migration chains.

use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::fmt;

use chunkstore_types::SchemaVersion;
use serde_json::Value;

use crate::error::{MigrationError, Result};
use crate::migrator::{BoxedMigrator, SchemaMigrator};

/// Name of the document field that carries the schema version.
pub const SCHEMA_VERSION_FIELD: &str = "schemaVersion";

/// Reads the schema version stored in a document.
///
/// A missing or `null` field is the unversioned [`SchemaVersion::NULL`]. Numeric versions are
/// accepted as well as strings.
pub fn stored_version(document: &Value) -> Result<SchemaVersion> {
    let version = match document.get(SCHEMA_VERSION_FIELD) {
        None | Some(Value::Null) => SchemaVersion::NULL,
        Some(Value::String(version)) => SchemaVersion::create(version)?,
        Some(Value::Number(version)) => SchemaVersion::create(&version.to_string())?,
        Some(other) => {
            return Err(MigrationError::InvalidDocument(format!(
                "{SCHEMA_VERSION_FIELD} must be a string, found {other}"
            )));
        }
    };
    Ok(version)
}

/// Migrates entity documents between schema versions.
///
/// The service is built once from the complete set of migrators. Each migrator is an edge from
/// its source to its target version. To migrate a document, the service looks for the shortest
/// chain of edges from the current to the target version and applies them in order.
///
/// Edges are kept sorted by source and target version, so the resolved chain does not depend on
/// the order in which migrators were registered.
pub struct SchemaMigrationService {
    graph: HashMap<String, Vec<BoxedMigrator>>,
}

impl SchemaMigrationService {
    /// Creates a service from all available migrators.
    ///
    /// Fails if two migrators share entity type, source and target version.
    pub fn new<I>(migrators: I) -> Result<Self>
    where
        I: IntoIterator<Item = BoxedMigrator>,
    {
        let mut graph: HashMap<String, Vec<BoxedMigrator>> = HashMap::new();
        for migrator in migrators {
            graph
                .entry(migrator.entity_type().to_owned())
                .or_default()
                .push(migrator);
        }

        for (entity_type, edges) in &mut graph {
            edges.sort_by(|a, b| {
                (a.from_version(), a.to_version()).cmp(&(b.from_version(), b.to_version()))
            });

            if let Some(pair) = edges.windows(2).find(|pair| same_step(&*pair[0], &*pair[1])) {
                return Err(MigrationError::DuplicateMigrator {
                    entity_type: entity_type.clone(),
                    from: pair[0].from_version().clone(),
                    to: pair[0].to_version().clone(),
                });
            }
        }

        Ok(Self { graph })
    }

    /// Returns `true` if `document` of `entity_type` can be migrated from `from` to `to`.
    ///
    /// Migrating a version to itself is always possible.
    pub fn has_migration_path(
        &self,
        entity_type: &str,
        from: &SchemaVersion,
        to: &SchemaVersion,
    ) -> bool {
        self.resolve(entity_type, from, to).is_some()
    }

    /// Migrates `document` of `entity_type` from `current` to `target`.
    ///
    /// If both versions are equal, the document is returned unchanged. Otherwise the resolved
    /// chain is applied and the [`SCHEMA_VERSION_FIELD`] of the result is set to `target`.
    ///
    /// The input is never modified. If any step fails, the error carries the failing step and no
    /// partial result is returned.
    pub fn migrate(
        &self,
        document: &Value,
        entity_type: &str,
        target: &SchemaVersion,
        current: &SchemaVersion,
    ) -> Result<Value> {
        if current == target {
            return Ok(document.clone());
        }

        let chain = self.resolve(entity_type, current, target).ok_or_else(|| {
            MigrationError::PathNotFound {
                entity_type: entity_type.to_owned(),
                from: current.clone(),
                to: target.clone(),
            }
        })?;

        let mut migrated = Cow::Borrowed(document);
        for migrator in chain {
            let next = migrator
                .migrate(&migrated)
                .map_err(|cause| MigrationError::Execution {
                    entity_type: entity_type.to_owned(),
                    from: migrator.from_version().clone(),
                    to: migrator.to_version().clone(),
                    cause,
                })?;

            tracing::trace!(
                entity_type,
                from = %migrator.from_version(),
                to = %migrator.to_version(),
                "applied migration step"
            );
            migrated = Cow::Owned(next);
        }

        let mut migrated = migrated.into_owned();
        let Some(object) = migrated.as_object_mut() else {
            return Err(MigrationError::InvalidDocument(format!(
                "migrated {entity_type} is not an object"
            )));
        };
        object.insert(
            SCHEMA_VERSION_FIELD.to_owned(),
            Value::String(target.to_string()),
        );

        tracing::debug!(entity_type, from = %current, to = %target, "migrated document");
        Ok(migrated)
    }

    /// Migrates a serialized JSON document.
    ///
    /// See [`migrate`](Self::migrate). If both versions are equal, the text is returned as is.
    pub fn migrate_json(
        &self,
        document: &str,
        entity_type: &str,
        target: &SchemaVersion,
        current: &SchemaVersion,
    ) -> Result<String> {
        if current == target {
            return Ok(document.to_owned());
        }

        let document: Value = serde_json::from_str(document)?;
        let migrated = self.migrate(&document, entity_type, target, current)?;
        Ok(serde_json::to_string(&migrated)?)
    }

    /// Finds the shortest chain of migrators from `from` to `to`.
    ///
    /// Edges leaving a version are visited in ascending target order, so among chains of equal
    /// length the one through lower versions wins.
    fn resolve<'a>(
        &'a self,
        entity_type: &str,
        from: &'a SchemaVersion,
        to: &SchemaVersion,
    ) -> Option<Vec<&'a dyn SchemaMigrator>> {
        if from == to {
            return Some(Vec::new());
        }

        let edges = self.graph.get(entity_type)?;

        // Maps each reached version to the edge it was first reached through.
        let mut reached_by: HashMap<&'a SchemaVersion, &'a dyn SchemaMigrator> = HashMap::new();
        let mut queue = VecDeque::from([from]);

        while let Some(version) = queue.pop_front() {
            for edge in edges.iter().filter(|edge| edge.from_version() == version) {
                let next = edge.to_version();
                if next == from || reached_by.contains_key(next) {
                    continue;
                }

                reached_by.insert(next, edge.as_ref());
                if next == to {
                    return Some(backtrack(&reached_by, from, next));
                }
                queue.push_back(next);
            }
        }

        None
    }
}

fn same_step(a: &dyn SchemaMigrator, b: &dyn SchemaMigrator) -> bool {
    a.from_version() == b.from_version() && a.to_version() == b.to_version()
}

fn backtrack<'a>(
    reached_by: &HashMap<&'a SchemaVersion, &'a dyn SchemaMigrator>,
    from: &SchemaVersion,
    to: &'a SchemaVersion,
) -> Vec<&'a dyn SchemaMigrator> {
    let mut chain = Vec::new();
    let mut version = to;
    while version != from {
        let Some(&edge) = reached_by.get(version) else {
            break;
        };
        chain.push(edge);
        version = edge.from_version();
    }
    chain.reverse();
    chain
}

impl fmt::Debug for SchemaMigrationService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (entity_type, edges) in &self.graph {
            let steps: Vec<_> = edges
                .iter()
                .map(|edge| format!("{} -> {}", edge.from_version(), edge.to_version()))
                .collect();
            map.entry(entity_type, &steps);
        }
        map.finish()
    }
}
