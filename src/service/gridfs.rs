// ============================================================================
// GridFS
// ============================================================================
//
// Files are split into `<bucket>.chunks` documents
// `{_id, files_id, n, data}` and described by one `<bucket>.files` document
// `{_id, length, chunkSize, uploadDate, filename, metadata}`.
//
// ============================================================================

use super::collection::{Collection, DeleteOptions, FindOptions, InsertOneOptions, UpdateOptions};
use super::cursor::Cursor;
use super::database::Database;
use super::error::{ServiceError, ServiceResult};
use super::store::new_object_id;
use crate::core::document::{Document, value_as_i64};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{SecondsFormat, Utc};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_CHUNK_SIZE: u32 = 255 * 1024;

#[derive(Debug, Clone)]
pub struct GridFsOptions {
    pub bucket_name: String,
    pub chunk_size_bytes: u32,
    pub read_concern: Option<Document>,
    pub write_concern: Option<Document>,
}

impl Default for GridFsOptions {
    fn default() -> Self {
        Self {
            bucket_name: "fs".to_string(),
            chunk_size_bytes: DEFAULT_CHUNK_SIZE,
            read_concern: None,
            write_concern: None,
        }
    }
}

impl GridFsOptions {
    pub fn bucket_name(mut self, name: &str) -> Self {
        self.bucket_name = name.to_string();
        self
    }

    pub fn chunk_size_bytes(mut self, size: u32) -> Self {
        self.chunk_size_bytes = size;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub chunk_size_bytes: Option<u32>,
    pub metadata: Option<Document>,
}

/// Binary value in extended-JSON form.
pub fn binary_value(bytes: &[u8], sub_type: &str) -> Value {
    json!({"$binary": {"base64": STANDARD.encode(bytes), "subType": sub_type}})
}

/// Decode an extended-JSON `$binary` value.
pub fn binary_bytes(value: &Value) -> Option<Vec<u8>> {
    let encoded = value.get("$binary")?.get("base64")?.as_str()?;
    STANDARD.decode(encoded).ok()
}

fn file_not_found(what: impl std::fmt::Display) -> ServiceError {
    ServiceError::gridfs(format!("File not found for {}", what))
}

#[derive(Clone)]
pub struct GridFsBucket {
    database: Database,
    options: GridFsOptions,
}

impl GridFsBucket {
    pub fn new(database: Database, options: GridFsOptions) -> Self {
        Self { database, options }
    }

    pub fn options(&self) -> &GridFsOptions {
        &self.options
    }

    pub fn files(&self) -> Collection {
        self.database
            .collection(&format!("{}.files", self.options.bucket_name))
            .with_concerns(self.options.read_concern.clone(), self.options.write_concern.clone())
    }

    pub fn chunks(&self) -> Collection {
        self.database
            .collection(&format!("{}.chunks", self.options.bucket_name))
            .with_concerns(self.options.read_concern.clone(), self.options.write_concern.clone())
    }

    /// Store `source` under `filename`; returns the new file id.
    pub fn upload(
        &self,
        filename: &str,
        source: &[u8],
        options: UploadOptions,
        cancel: &CancellationToken,
    ) -> ServiceResult<Value> {
        let chunk_size = options.chunk_size_bytes.unwrap_or(self.options.chunk_size_bytes);
        if chunk_size == 0 {
            return Err(ServiceError::invalid_argument("chunkSizeBytes must be greater than zero"));
        }
        let id = new_object_id();
        let chunks = self.chunks();
        for (n, data) in source.chunks(chunk_size as usize).enumerate() {
            let chunk = json!({
                "_id": new_object_id(),
                "files_id": id,
                "n": n,
                "data": binary_value(data, "00")
            });
            chunks.insert_one(
                chunk.as_object().cloned().unwrap_or_default(),
                InsertOneOptions::default(),
                None,
                cancel,
            )?;
        }

        let mut file = json!({
            "_id": id,
            "length": source.len(),
            "chunkSize": chunk_size,
            "uploadDate": {"$date": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)},
            "filename": filename
        });
        if let Some(metadata) = options.metadata {
            file["metadata"] = Value::Object(metadata);
        }
        self.files().insert_one(
            file.as_object().cloned().unwrap_or_default(),
            InsertOneOptions::default(),
            None,
            cancel,
        )?;
        debug!(
            bucket = %self.options.bucket_name,
            filename,
            length = source.len(),
            "GridFS upload"
        );
        Ok(id)
    }

    fn open_stream(
        &self,
        file: Document,
        cancel: &CancellationToken,
    ) -> ServiceResult<GridFsDownloadStream> {
        let id = file.get("_id").cloned().unwrap_or(Value::Null);
        let length = file.get("length").and_then(value_as_i64).unwrap_or(0).max(0) as u64;
        let chunk_size = file.get("chunkSize").and_then(value_as_i64).unwrap_or(0).max(0) as u64;
        let expected_chunks = match chunk_size {
            0 => 0,
            size => length.div_ceil(size),
        };
        let cursor = if expected_chunks == 0 {
            None
        } else {
            let mut filter = Document::new();
            filter.insert("files_id".to_string(), id.clone());
            let options = FindOptions {
                sort: json!({"n": 1}).as_object().cloned(),
                ..FindOptions::default()
            };
            Some(self.chunks().find(&filter, options, None, cancel)?)
        };
        Ok(GridFsDownloadStream {
            inner: Arc::new(Mutex::new(StreamState {
                file,
                cursor,
                length,
                chunk_size,
                expected_chunks,
                next_chunk: 0,
                closed: false,
            })),
        })
    }

    /// Open a live stream over the chunks of file `id`.
    pub fn open_download_stream(
        &self,
        id: &Value,
        cancel: &CancellationToken,
    ) -> ServiceResult<GridFsDownloadStream> {
        let mut filter = Document::new();
        filter.insert("_id".to_string(), id.clone());
        let file = self
            .files()
            .find_one(&filter, FindOptions::default(), None, cancel)?
            .ok_or_else(|| file_not_found(format!("id {}", id)))?;
        self.open_stream(file, cancel)
    }

    /// Open a stream by filename. Revision 0 is the oldest, -1 the newest.
    pub fn open_download_stream_by_name(
        &self,
        filename: &str,
        revision: i64,
        cancel: &CancellationToken,
    ) -> ServiceResult<GridFsDownloadStream> {
        let mut filter = Document::new();
        filter.insert("filename".to_string(), Value::String(filename.to_string()));
        let options = FindOptions {
            sort: json!({"uploadDate": 1}).as_object().cloned(),
            ..FindOptions::default()
        };
        let mut revisions = self
            .files()
            .find(&filter, options, None, cancel)?
            .collect_all(cancel)?;
        let position = if revision >= 0 {
            usize::try_from(revision).ok().filter(|p| *p < revisions.len())
        } else {
            revisions.len().checked_sub(revision.unsigned_abs() as usize)
        };
        let file = position
            .map(|p| revisions.swap_remove(p))
            .ok_or_else(|| file_not_found(format!("filename {} revision {}", filename, revision)))?;
        self.open_stream(file, cancel)
    }

    pub fn download(&self, id: &Value, cancel: &CancellationToken) -> ServiceResult<Vec<u8>> {
        self.open_download_stream(id, cancel)?.read_to_end(cancel)
    }

    pub fn download_by_name(
        &self,
        filename: &str,
        revision: i64,
        cancel: &CancellationToken,
    ) -> ServiceResult<Vec<u8>> {
        self.open_download_stream_by_name(filename, revision, cancel)?
            .read_to_end(cancel)
    }

    /// Remove a file and its chunks. Orphaned chunks are removed even when
    /// the files document is missing.
    pub fn delete(&self, id: &Value, cancel: &CancellationToken) -> ServiceResult<()> {
        let mut by_id = Document::new();
        by_id.insert("_id".to_string(), id.clone());
        let removed = self.files().delete_one(&by_id, DeleteOptions::default(), None, cancel)?;

        let mut by_file = Document::new();
        by_file.insert("files_id".to_string(), id.clone());
        self.chunks().delete_many(&by_file, DeleteOptions::default(), None, cancel)?;

        if removed.deleted_count == 0 {
            return Err(file_not_found(format!("id {}", id)));
        }
        Ok(())
    }

    pub fn rename(
        &self,
        id: &Value,
        new_filename: &str,
        cancel: &CancellationToken,
    ) -> ServiceResult<()> {
        let mut filter = Document::new();
        filter.insert("_id".to_string(), id.clone());
        let result = self.files().update_one(
            &filter,
            json!({"$set": {"filename": new_filename}}),
            UpdateOptions::default(),
            None,
            cancel,
        )?;
        if result.matched_count == 0 {
            return Err(file_not_found(format!("id {}", id)));
        }
        Ok(())
    }

    /// Drop both bucket collections.
    pub fn drop(&self, cancel: &CancellationToken) -> ServiceResult<()> {
        self.files().drop(None, cancel)?;
        self.chunks().drop(None, cancel)
    }

    async_pair!(upload_async => upload(
        filename: &str,
        source: &[u8],
        options: UploadOptions
    ) -> ServiceResult<Value>);
    async_pair!(open_download_stream_async => open_download_stream(
        id: &Value
    ) -> ServiceResult<GridFsDownloadStream>);
    async_pair!(download_async => download(id: &Value) -> ServiceResult<Vec<u8>>);
    async_pair!(download_by_name_async => download_by_name(
        filename: &str,
        revision: i64
    ) -> ServiceResult<Vec<u8>>);
    async_pair!(delete_async => delete(id: &Value) -> ServiceResult<()>);
    async_pair!(rename_async => rename(id: &Value, new_filename: &str) -> ServiceResult<()>);
    async_pair!(drop_async => drop() -> ServiceResult<()>);
}

// ============================================================================
// Download stream
// ============================================================================

struct StreamState {
    file: Document,
    cursor: Option<Cursor>,
    length: u64,
    chunk_size: u64,
    expected_chunks: u64,
    next_chunk: u64,
    closed: bool,
}

/// Reads a stored file one chunk at a time, validating chunk order and size.
#[derive(Clone)]
pub struct GridFsDownloadStream {
    inner: Arc<Mutex<StreamState>>,
}

impl GridFsDownloadStream {
    pub fn file(&self) -> ServiceResult<Document> {
        Ok(self.lock()?.file.clone())
    }

    fn lock(&self) -> ServiceResult<std::sync::MutexGuard<'_, StreamState>> {
        self.inner
            .lock()
            .map_err(|err| ServiceError::gridfs(format!("Download stream lock poisoned: {}", err)))
    }

    /// Next chunk's bytes, or `None` once the whole file has been read.
    pub fn next_chunk(&self, cancel: &CancellationToken) -> ServiceResult<Option<Vec<u8>>> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(ServiceError::closed("download stream"));
        }
        if state.next_chunk >= state.expected_chunks {
            return Ok(None);
        }
        let n = state.next_chunk;
        let chunk = match &state.cursor {
            Some(cursor) => cursor.try_next(cancel)?,
            None => None,
        };
        let chunk = chunk.ok_or_else(|| {
            ServiceError::gridfs(format!("ChunkIsMissing: chunk {} is missing", n))
        })?;
        if chunk.get("n").and_then(value_as_i64) != Some(n as i64) {
            return Err(ServiceError::gridfs(format!(
                "ChunkIsMissing: expected chunk {} but found {:?}",
                n,
                chunk.get("n")
            )));
        }
        let data = chunk
            .get("data")
            .and_then(binary_bytes)
            .ok_or_else(|| ServiceError::gridfs(format!("Chunk {} has no binary data", n)))?;
        let expected_size = if n + 1 == state.expected_chunks {
            state.length - n * state.chunk_size
        } else {
            state.chunk_size
        };
        if data.len() as u64 != expected_size {
            return Err(ServiceError::gridfs(format!(
                "ChunkIsWrongSize: chunk {} has {} bytes, expected {}",
                n,
                data.len(),
                expected_size
            )));
        }
        state.next_chunk += 1;
        Ok(Some(data))
    }

    pub fn read_to_end(&self, cancel: &CancellationToken) -> ServiceResult<Vec<u8>> {
        let mut bytes = Vec::new();
        while let Some(chunk) = self.next_chunk(cancel)? {
            bytes.extend(chunk);
        }
        self.close(cancel)?;
        Ok(bytes)
    }

    pub fn close(&self, cancel: &CancellationToken) -> ServiceResult<()> {
        let cursor = {
            let mut state = self.lock()?;
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.cursor.take()
        };
        match cursor {
            Some(cursor) => cursor.close(cancel),
            None => Ok(()),
        }
    }

    async_pair!(next_chunk_async => next_chunk() -> ServiceResult<Option<Vec<u8>>>);
    async_pair!(read_to_end_async => read_to_end() -> ServiceResult<Vec<u8>>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::client::{Client, ClientOptions};
    use crate::service::deployment::{Deployment, ServerInfo};
    use crate::service::error::ErrorKind;

    fn bucket(chunk_size: u32) -> (GridFsBucket, CancellationToken) {
        let client = Client::new(Deployment::new(ServerInfo::default()), ClientOptions::default());
        let options = GridFsOptions::default().chunk_size_bytes(chunk_size);
        (GridFsBucket::new(client.database("files"), options), CancellationToken::new())
    }

    #[test]
    fn test_upload_splits_into_chunks_and_downloads() {
        let (bucket, cancel) = bucket(4);
        let payload = b"0123456789".to_vec();
        let id = bucket.upload("numbers", &payload, UploadOptions::default(), &cancel).unwrap();

        let chunks = bucket
            .chunks()
            .count_documents(&Document::new(), Default::default(), None, &cancel)
            .unwrap();
        assert_eq!(chunks, 3);
        assert_eq!(bucket.download(&id, &cancel).unwrap(), payload);
    }

    #[test]
    fn test_download_by_name_revisions() {
        let (bucket, cancel) = bucket(DEFAULT_CHUNK_SIZE);
        bucket.upload("a", b"first", UploadOptions::default(), &cancel).unwrap();
        bucket.upload("a", b"second", UploadOptions::default(), &cancel).unwrap();
        assert_eq!(bucket.download_by_name("a", 0, &cancel).unwrap(), b"first".to_vec());
        assert_eq!(bucket.download_by_name("a", -1, &cancel).unwrap(), b"second".to_vec());
    }

    #[test]
    fn test_missing_file_is_gridfs_error() {
        let (bucket, cancel) = bucket(DEFAULT_CHUNK_SIZE);
        let err = bucket.delete(&json!(42), &cancel).unwrap_err();
        assert_eq!(err.kind, ErrorKind::GridFs);
        assert!(err.is_client_error());
        let err = bucket.rename(&json!(42), "b", &cancel).unwrap_err();
        assert_eq!(err.kind, ErrorKind::GridFs);
    }

    #[test]
    fn test_empty_file_round_trip() {
        let (bucket, cancel) = bucket(DEFAULT_CHUNK_SIZE);
        let id = bucket.upload("empty", b"", UploadOptions::default(), &cancel).unwrap();
        assert!(bucket.download(&id, &cancel).unwrap().is_empty());
    }
}
