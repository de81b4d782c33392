//! Filesystem backend storing one JSON file per document.
//!
//! The directory layout mirrors the collections of a document database:
//!
//! ```text
//! <root>/storage_data/<uuid>/<index>.json
//! <root>/storage_data/<uuid>/<index>.final.json
//! <root>/storage_delete/<id>.json
//! <root>/documents/<collection>/<id>.json
//! ```
//!
//! Final chunks carry a `.final` marker in their file name, so they can be found from a directory
//! listing without reading any chunk payloads.
//!
//! Every write goes to a temporary file that is renamed into place, so single-document writes
//! are atomic. There are no multi-document transactions.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use uuid::Uuid;

use super::common::{Backend, DocumentStore, ID_FIELD};
use crate::datamodel::{
    STORAGE_DATA_COLLECTION, STORAGE_DELETE_COLLECTION, StorageData, StorageDelete,
};
use crate::error::{Error, Result};

const DOCUMENTS_DIR: &str = "documents";
const JSON_EXTENSION: &str = "json";
const FINAL_MARKER: &str = "final";

/// A [`Backend`] and [`DocumentStore`] on the local filesystem.
#[derive(Debug)]
pub struct LocalFsBackend {
    path: PathBuf,
}

impl LocalFsBackend {
    /// Creates a backend rooted at `path`. Directories are created on first write.
    pub fn new(path: &Path) -> Self {
        Self { path: path.into() }
    }

    fn uuid_dir(&self, uuid: &str) -> Result<PathBuf> {
        Ok(self
            .path
            .join(STORAGE_DATA_COLLECTION)
            .join(path_segment(uuid)?))
    }

    fn chunk_path(&self, uuid: &str, index: u32, is_final: bool) -> Result<PathBuf> {
        let name = if is_final {
            format!("{index:010}.{FINAL_MARKER}.{JSON_EXTENSION}")
        } else {
            format!("{index:010}.{JSON_EXTENSION}")
        };
        Ok(self.uuid_dir(uuid)?.join(name))
    }

    /// Lists the chunk files of `uuid` without reading them, ordered by index.
    async fn chunk_files(&self, uuid: &str) -> Result<Vec<ChunkFile>> {
        let dir = self.uuid_dir(uuid)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some((index, is_final)) = name.to_str().and_then(parse_chunk_name) {
                files.push(ChunkFile {
                    index,
                    is_final,
                    path: entry.path(),
                });
            }
        }
        files.sort_by_key(|file| (file.index, file.is_final));
        Ok(files)
    }

    fn deletion_path(&self, record_id: &str) -> Result<PathBuf> {
        Ok(self
            .path
            .join(STORAGE_DELETE_COLLECTION)
            .join(format!("{}.{JSON_EXTENSION}", path_segment(record_id)?)))
    }

    fn document_path(&self, collection: &str, id: &str) -> Result<PathBuf> {
        Ok(self
            .path
            .join(DOCUMENTS_DIR)
            .join(path_segment(collection)?)
            .join(format!("{}.{JSON_EXTENSION}", path_segment(id)?)))
    }
}

/// A chunk document on disk, as seen from its file name.
#[derive(Debug)]
struct ChunkFile {
    index: u32,
    is_final: bool,
    path: PathBuf,
}

/// The fields of a chunk document the orphan sweep needs. The payload is skipped, not decoded.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChunkStamp {
    written_at: SystemTime,
}

/// Parses `<index>.json` and `<index>.final.json`. Temporary files do not match.
fn parse_chunk_name(name: &str) -> Option<(u32, bool)> {
    let stem = name.strip_suffix(JSON_EXTENSION)?.strip_suffix('.')?;
    let (index, is_final) = match stem.strip_suffix(FINAL_MARKER) {
        Some(index) => (index.strip_suffix('.')?, true),
        None => (stem, false),
    };
    Some((index.parse().ok()?, is_final))
}

/// Validates that an id can be used as a single path component.
fn path_segment(id: &str) -> Result<&str> {
    let invalid = id.is_empty() || id.starts_with('.') || id.contains(['/', '\\', '\0']);
    if invalid {
        return Err(Error::MalformedId(id.to_owned()));
    }
    Ok(id)
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let contents = serde_json::to_vec(value)
        .map_err(|cause| Error::serde(format!("serializing {}", path.display()), cause))?;

    let parent = path.parent().ok_or_else(|| {
        Error::Io(std::io::Error::new(
            ErrorKind::InvalidInput,
            "document path has no parent",
        ))
    })?;
    tokio::fs::create_dir_all(parent).await?;

    let temp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp_path)
        .await?;

    let mut writer = BufWriter::new(file);
    writer.write_all(&contents).await?;
    writer.flush().await?;
    let file = writer.into_inner();
    file.sync_data().await?;
    drop(file);

    if let Err(err) = tokio::fs::rename(&temp_path, path).await {
        tokio::fs::remove_file(&temp_path).await.ok();
        return Err(err.into());
    }
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match tokio::fs::read(path).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    serde_json::from_slice(&contents)
        .map(Some)
        .map_err(|cause| Error::serde(format!("deserializing {}", path.display()), cause))
}

async fn remove_file(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// Reads all JSON documents in `dir`, skipping temporary files and files removed concurrently.
async fn read_dir_json<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == JSON_EXTENSION) {
            paths.push(path);
        }
    }
    paths.sort();

    let mut documents = Vec::with_capacity(paths.len());
    for path in paths {
        if let Some(document) = read_json(&path).await? {
            documents.push(document);
        }
    }
    Ok(documents)
}

/// Lists the names of all subdirectories of `dir`.
async fn list_dirs(dir: &Path) -> Result<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_owned());
        }
    }
    Ok(names)
}

#[async_trait::async_trait]
impl Backend for LocalFsBackend {
    fn name(&self) -> &'static str {
        "local-fs"
    }

    async fn put_chunk(&self, chunk: StorageData) -> Result<()> {
        let path = self.chunk_path(&chunk.uuid, chunk.index, chunk.is_final)?;
        write_json(&path, &chunk).await?;

        // A rewrite under the same uuid may flip the finality of this index.
        let other = self.chunk_path(&chunk.uuid, chunk.index, !chunk.is_final)?;
        remove_file(&other).await?;
        Ok(())
    }

    async fn get_chunk(&self, uuid: &str, index: u32) -> Result<Option<StorageData>> {
        let regular: Option<StorageData> = read_json(&self.chunk_path(uuid, index, false)?).await?;
        let last: Option<StorageData> = read_json(&self.chunk_path(uuid, index, true)?).await?;

        // Both exist only in the short window of a rewrite. Record ids are time-ordered.
        Ok(match (regular, last) {
            (Some(regular), Some(last)) if regular.id > last.id => Some(regular),
            (regular, last) => last.or(regular),
        })
    }

    async fn get_final_chunks(&self, uuid: &str) -> Result<Vec<StorageData>> {
        let mut finals = Vec::new();
        for file in self.chunk_files(uuid).await? {
            if !file.is_final {
                continue;
            }
            if let Some(chunk) = read_json(&file.path).await? {
                finals.push(chunk);
            }
        }
        Ok(finals)
    }

    async fn get_chunks(&self, uuid: &str) -> Result<Vec<StorageData>> {
        let mut chunks = Vec::new();
        for file in self.chunk_files(uuid).await? {
            if let Some(chunk) = read_json(&file.path).await? {
                chunks.push(chunk);
            }
        }
        Ok(chunks)
    }

    async fn delete_chunks(&self, uuid: &str) -> Result<u64> {
        let count = self.chunk_files(uuid).await?.len() as u64;
        match tokio::fs::remove_dir_all(self.uuid_dir(uuid)?).await {
            Ok(()) => Ok(count),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_chunk(&self, chunk: &StorageData) -> Result<()> {
        let path = self.chunk_path(&chunk.uuid, chunk.index, chunk.is_final)?;
        let Some(current) = read_json::<StorageData>(&path).await? else {
            return Ok(());
        };

        if current.id == chunk.id {
            remove_file(&path).await?;
        }
        Ok(())
    }

    async fn put_deletion(&self, deletion: StorageDelete) -> Result<()> {
        let path = self.deletion_path(&deletion.id)?;
        write_json(&path, &deletion).await
    }

    async fn due_deletions(&self, now: SystemTime) -> Result<Vec<StorageDelete>> {
        let dir = self.path.join(STORAGE_DELETE_COLLECTION);
        let mut deletions: Vec<StorageDelete> = read_dir_json(&dir).await?;
        deletions.retain(|deletion| deletion.deleted_at <= now);
        Ok(deletions)
    }

    async fn delete_deletion(&self, record_id: &str) -> Result<()> {
        remove_file(&self.deletion_path(record_id)?).await?;
        Ok(())
    }

    async fn partial_uuids(&self, older_than: SystemTime) -> Result<Vec<String>> {
        let mut uuids = Vec::new();
        for uuid in list_dirs(&self.path.join(STORAGE_DATA_COLLECTION)).await? {
            let files = self.chunk_files(&uuid).await?;
            if files.iter().any(|file| file.is_final) {
                continue;
            }

            // Chunks are written in index order, so the last one is the newest.
            let Some(newest) = files.last() else {
                continue;
            };
            let Some(stamp) = read_json::<ChunkStamp>(&newest.path).await? else {
                continue;
            };
            if stamp.written_at < older_than {
                uuids.push(uuid);
            }
        }
        Ok(uuids)
    }
}

#[async_trait::async_trait]
impl DocumentStore for LocalFsBackend {
    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        read_json(&self.document_path(collection, id)?).await
    }

    async fn put_document(&self, collection: &str, id: &str, document: Value) -> Result<()> {
        write_json(&self.document_path(collection, id)?, &document).await
    }

    async fn update_fields(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<()> {
        let path = self.document_path(collection, id)?;
        let Some(mut document) = read_json::<Value>(&path).await? else {
            return Err(Error::NotFound(format!("{collection}/{id}")));
        };

        let Value::Object(target) = &mut document else {
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
        write_json(&path, &document).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use serde_json::json;

    use super::*;
    use crate::datamodel::new_record_id;

    fn chunk(uuid: &str, index: u32, is_final: bool) -> StorageData {
        StorageData {
            id: new_record_id(),
            uuid: uuid.into(),
            path: "terrain".into(),
            world_id: "world".into(),
            index,
            data: Bytes::from(vec![index as u8; 4]),
            schema: "terrain".into(),
            schema_version: "1".into(),
            is_final,
            size: 4 * (u64::from(index) + 1),
            created_at: SystemTime::now(),
            written_at: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn stores_and_lists_chunks() {
        let tempdir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(tempdir.path());

        for index in 0..12 {
            let chunk = chunk("blob", index, index == 11);
            backend.put_chunk(chunk).await.unwrap();
        }

        let chunks = backend.get_chunks("blob").await.unwrap();
        let indices: Vec<_> = chunks.iter().map(|c| c.index).collect();
        assert_eq!(indices, (0..12).collect::<Vec<_>>());

        let read = backend.get_chunk("blob", 3).await.unwrap().unwrap();
        assert_eq!(read.data.as_ref(), &[3, 3, 3, 3]);

        let finals = backend.get_final_chunks("blob").await.unwrap();
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].size, 48);

        assert_eq!(backend.delete_chunks("blob").await.unwrap(), 12);
        assert!(backend.get_chunk("blob", 0).await.unwrap().is_none());
        assert_eq!(backend.delete_chunks("blob").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_chunk_matches_record_id() {
        let tempdir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(tempdir.path());

        let first = chunk("blob", 0, true);
        let second = chunk("blob", 0, true);
        backend.put_chunk(first.clone()).await.unwrap();
        backend.put_chunk(second.clone()).await.unwrap();

        // `first` was overwritten by `second`, so deleting it must not touch the file.
        backend.delete_chunk(&first).await.unwrap();
        let current = backend.get_chunk("blob", 0).await.unwrap();
        assert_eq!(current, Some(second.clone()));

        backend.delete_chunk(&second).await.unwrap();
        assert!(backend.get_chunk("blob", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn final_chunks_skip_other_payloads() {
        let tempdir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(tempdir.path());

        for index in 0..3 {
            backend.put_chunk(chunk("blob", index, index == 2)).await.unwrap();
        }
        let dir = tempdir.path().join(STORAGE_DATA_COLLECTION).join("blob");
        assert!(dir.join("0000000002.final.json").exists());
        std::fs::write(dir.join("0000000001.json"), b"{not json").unwrap();

        let finals = backend.get_final_chunks("blob").await.unwrap();
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].index, 2);
        assert!(backend.get_chunk("blob", 0).await.unwrap().is_some());

        let corrupt = backend.get_chunk("blob", 1).await;
        assert!(matches!(corrupt, Err(Error::Serde { .. })), "{corrupt:?}");

        // Counting and removal never decode the payloads.
        assert_eq!(backend.delete_chunks("blob").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn rewrite_flips_finality() {
        let tempdir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(tempdir.path());

        backend.put_chunk(chunk("blob", 0, true)).await.unwrap();
        let longer = chunk("blob", 0, false);
        backend.put_chunk(longer.clone()).await.unwrap();
        backend.put_chunk(chunk("blob", 1, true)).await.unwrap();

        assert_eq!(backend.get_chunk("blob", 0).await.unwrap(), Some(longer));
        let finals = backend.get_final_chunks("blob").await.unwrap();
        let indices: Vec<_> = finals.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![1]);
    }

    #[tokio::test]
    async fn partial_uuids_use_newest_chunk() {
        let tempdir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(tempdir.path());
        let now = SystemTime::now();
        let hour_ago = now - Duration::from_secs(3600);

        let stamped = |uuid: &str, index, is_final, written_at| StorageData {
            written_at,
            ..chunk(uuid, index, is_final)
        };

        // Started long ago, but the newest chunk is recent.
        backend.put_chunk(stamped("active", 0, false, hour_ago)).await.unwrap();
        backend.put_chunk(stamped("active", 1, false, now)).await.unwrap();

        backend.put_chunk(stamped("stalled", 0, false, hour_ago)).await.unwrap();
        backend.put_chunk(stamped("stalled", 1, false, hour_ago)).await.unwrap();

        backend.put_chunk(stamped("done", 0, false, hour_ago)).await.unwrap();
        backend.put_chunk(stamped("done", 1, true, hour_ago)).await.unwrap();

        let older_than = now - Duration::from_secs(600);
        let uuids = backend.partial_uuids(older_than).await.unwrap();
        assert_eq!(uuids, vec!["stalled".to_owned()]);
    }

    #[tokio::test]
    async fn deletion_markers() {
        let tempdir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(tempdir.path());
        let now = SystemTime::now();

        let due = StorageDelete::new("a", now - Duration::from_secs(1));
        let later = StorageDelete::new("b", now + Duration::from_secs(300));
        backend.put_deletion(due.clone()).await.unwrap();
        backend.put_deletion(later).await.unwrap();

        assert_eq!(backend.due_deletions(now).await.unwrap(), vec![due.clone()]);

        backend.delete_deletion(&due.id).await.unwrap();
        backend.delete_deletion(&due.id).await.unwrap();
        assert!(backend.due_deletions(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_path_traversal() {
        let tempdir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(tempdir.path());

        for id in ["", "../escape", "a/b", ".hidden"] {
            let result = backend.get_chunk(id, 0).await;
            assert!(matches!(result, Err(Error::MalformedId(_))), "{id:?}");
        }
    }

    #[tokio::test]
    async fn raw_documents() {
        let tempdir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(tempdir.path());

        let document = json!({"_id": "c1", "schemaVersion": "1", "v": 1});
        backend.put_document("chunks", "c1", document).await.unwrap();

        let Value::Object(fields) = json!({"_id": "x", "schemaVersion": "2", "v": 2}) else {
            unreachable!()
        };
        backend.update_fields("chunks", "c1", fields).await.unwrap();

        let document = backend.get_document("chunks", "c1").await.unwrap().unwrap();
        assert_eq!(document, json!({"_id": "c1", "schemaVersion": "2", "v": 2}));
        assert!(backend.get_document("chunks", "c2").await.unwrap().is_none());
    }
}
