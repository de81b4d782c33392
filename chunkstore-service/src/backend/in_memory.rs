//! In-memory backend.
//!
//! This provides a [`Backend`] and [`DocumentStore`] backed by ordered maps. It is used by tests
//! and by single-process deployments that do not need durability. The backend is [`Clone`] so
//! tests can hold a handle for direct inspection while the service owns a shared copy.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use serde_json::{Map, Value};

use super::common::{Backend, DocumentStore, ID_FIELD};
use crate::datamodel::{StorageData, StorageDelete};
use crate::error::{Error, Result};

/// Chunks of one uuid, keyed by `(index, record id)`.
type Chunks = BTreeMap<(u32, String), StorageData>;

#[derive(Debug, Default)]
struct Store {
    chunks: BTreeMap<String, Chunks>,
    deletions: BTreeMap<String, StorageDelete>,
    documents: HashMap<String, BTreeMap<String, Value>>,
}

/// A [`Backend`] and [`DocumentStore`] that keeps all documents in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    store: Arc<Mutex<Store>>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        // A panic while holding the lock cannot leave a map half-updated, so poisoning is
        // ignored.
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the number of chunk documents stored for `uuid`.
    pub fn chunk_count(&self, uuid: &str) -> usize {
        self.lock().chunks.get(uuid).map_or(0, BTreeMap::len)
    }

    /// Returns the number of pending deletion markers.
    pub fn deletion_count(&self) -> usize {
        self.lock().deletions.len()
    }

    /// Returns `true` if no chunks and no deletion markers are stored.
    pub fn is_empty(&self) -> bool {
        let store = self.lock();
        store.chunks.is_empty() && store.deletions.is_empty()
    }

    /// Removes the chunk of `uuid` at `index` directly, bypassing the [`Backend`] trait.
    ///
    /// Useful for simulating corrupted or concurrently deleted blobs.
    pub fn remove_chunk(&self, uuid: &str, index: u32) {
        if let Some(chunks) = self.lock().chunks.get_mut(uuid) {
            chunks.retain(|(i, _), _| *i != index);
        }
    }
}

#[async_trait::async_trait]
impl Backend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn put_chunk(&self, chunk: StorageData) -> Result<()> {
        let key = (chunk.index, chunk.id.clone());
        self.lock()
            .chunks
            .entry(chunk.uuid.clone())
            .or_default()
            .insert(key, chunk);
        Ok(())
    }

    async fn get_chunk(&self, uuid: &str, index: u32) -> Result<Option<StorageData>> {
        let store = self.lock();
        let Some(chunks) = store.chunks.get(uuid) else {
            return Ok(None);
        };

        // Record ids are time-ordered, so the last match is the newest write at this index.
        let chunk = chunks
            .range((index, String::new())..)
            .take_while(|((i, _), _)| *i == index)
            .last()
            .map(|(_, chunk)| chunk.clone());
        Ok(chunk)
    }

    async fn get_final_chunks(&self, uuid: &str) -> Result<Vec<StorageData>> {
        let store = self.lock();
        let finals = store
            .chunks
            .get(uuid)
            .into_iter()
            .flat_map(|chunks| chunks.values())
            .filter(|chunk| chunk.is_final)
            .cloned()
            .collect();
        Ok(finals)
    }

    async fn get_chunks(&self, uuid: &str) -> Result<Vec<StorageData>> {
        let store = self.lock();
        let chunks = store
            .chunks
            .get(uuid)
            .into_iter()
            .flat_map(|chunks| chunks.values())
            .cloned()
            .collect();
        Ok(chunks)
    }

    async fn delete_chunks(&self, uuid: &str) -> Result<u64> {
        let removed = self.lock().chunks.remove(uuid);
        Ok(removed.map_or(0, |chunks| chunks.len() as u64))
    }

    async fn delete_chunk(&self, chunk: &StorageData) -> Result<()> {
        let mut store = self.lock();
        if let Some(chunks) = store.chunks.get_mut(&chunk.uuid) {
            chunks.remove(&(chunk.index, chunk.id.clone()));
            if chunks.is_empty() {
                store.chunks.remove(&chunk.uuid);
            }
        }
        Ok(())
    }

    async fn put_deletion(&self, deletion: StorageDelete) -> Result<()> {
        self.lock().deletions.insert(deletion.id.clone(), deletion);
        Ok(())
    }

    async fn due_deletions(&self, now: SystemTime) -> Result<Vec<StorageDelete>> {
        let store = self.lock();
        let due = store
            .deletions
            .values()
            .filter(|deletion| deletion.deleted_at <= now)
            .cloned()
            .collect();
        Ok(due)
    }

    async fn delete_deletion(&self, record_id: &str) -> Result<()> {
        self.lock().deletions.remove(record_id);
        Ok(())
    }

    async fn partial_uuids(&self, older_than: SystemTime) -> Result<Vec<String>> {
        let store = self.lock();
        let uuids = store
            .chunks
            .iter()
            .filter(|(_, chunks)| !chunks.values().any(|chunk| chunk.is_final))
            .filter(|(_, chunks)| {
                chunks
                    .values()
                    .map(|chunk| chunk.written_at)
                    .max()
                    .is_some_and(|newest| newest < older_than)
            })
            .map(|(uuid, _)| uuid.clone())
            .collect();
        Ok(uuids)
    }
}

#[async_trait::async_trait]
impl DocumentStore for InMemoryBackend {
    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let store = self.lock();
        let document = store
            .documents
            .get(collection)
            .and_then(|documents| documents.get(id))
            .cloned();
        Ok(document)
    }

    async fn put_document(&self, collection: &str, id: &str, document: Value) -> Result<()> {
        self.lock()
            .documents
            .entry(collection.to_owned())
            .or_default()
            .insert(id.to_owned(), document);
        Ok(())
    }

    async fn update_fields(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<()> {
        let mut store = self.lock();
        let document = store
            .documents
            .get_mut(collection)
            .and_then(|documents| documents.get_mut(id))
            .ok_or_else(|| Error::NotFound(format!("{collection}/{id}")))?;

        let Value::Object(target) = document else {
            return Err(Error::Backend {
                context: format!("document {collection}/{id} is not an object"),
                cause: "cannot update fields of a non-object document".into(),
            });
        };

        for (key, value) in fields {
            if key != ID_FIELD {
                target.insert(key, value);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use serde_json::json;

    use super::*;
    use crate::datamodel::new_record_id;

    fn chunk(uuid: &str, index: u32, is_final: bool, written_at: SystemTime) -> StorageData {
        StorageData {
            id: new_record_id(),
            uuid: uuid.into(),
            path: "path".into(),
            world_id: "world".into(),
            index,
            data: Bytes::from_static(b"x"),
            schema: "schema".into(),
            schema_version: "1".into(),
            is_final,
            size: u64::from(index) + 1,
            created_at: written_at,
            written_at,
        }
    }

    #[tokio::test]
    async fn chunk_lookups() {
        let backend = InMemoryBackend::new();
        let now = SystemTime::now();
        backend.put_chunk(chunk("a", 0, false, now)).await.unwrap();
        backend.put_chunk(chunk("a", 1, true, now)).await.unwrap();
        backend.put_chunk(chunk("b", 0, true, now)).await.unwrap();

        assert_eq!(backend.get_chunk("a", 1).await.unwrap().unwrap().index, 1);
        assert!(backend.get_chunk("a", 2).await.unwrap().is_none());
        assert_eq!(backend.get_final_chunks("a").await.unwrap().len(), 1);
        assert_eq!(backend.get_chunks("a").await.unwrap().len(), 2);

        assert_eq!(backend.delete_chunks("a").await.unwrap(), 2);
        assert_eq!(backend.delete_chunks("a").await.unwrap(), 0);
        assert_eq!(backend.chunk_count("b"), 1);
    }

    #[tokio::test]
    async fn partial_uuids_respects_cutoff() {
        let backend = InMemoryBackend::new();
        let old = SystemTime::now() - Duration::from_secs(3600);
        backend.put_chunk(chunk("stale", 0, false, old)).await.unwrap();
        backend.put_chunk(chunk("done", 0, true, old)).await.unwrap();
        backend
            .put_chunk(chunk("fresh", 0, false, SystemTime::now()))
            .await
            .unwrap();

        let cutoff = SystemTime::now() - Duration::from_secs(60);
        assert_eq!(backend.partial_uuids(cutoff).await.unwrap(), vec!["stale"]);
    }

    #[tokio::test]
    async fn update_fields_skips_identity() {
        let backend = InMemoryBackend::new();
        backend
            .put_document("worlds", "w1", json!({"_id": "w1", "name": "old"}))
            .await
            .unwrap();

        let fields = json!({"_id": "other", "name": "new", "extra": 1});
        let Value::Object(fields) = fields else {
            unreachable!()
        };
        backend.update_fields("worlds", "w1", fields).await.unwrap();

        let document = backend.get_document("worlds", "w1").await.unwrap().unwrap();
        assert_eq!(document, json!({"_id": "w1", "name": "new", "extra": 1}));

        let missing = backend.update_fields("worlds", "nope", Map::new()).await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }
}
