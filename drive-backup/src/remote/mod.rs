//! Remote storage: the Drive transport, retries and batch pacing.
//!
//! The orchestrator talks to [`RemoteStorage`]. [`RemoteStore`] implements it
//! on top of any [`DriveTransport`] by wrapping every call in a
//! [`RetryPolicy`] and pacing batch deletes with [`BatchOptions`].

pub mod drive;
pub mod error;
pub mod retry;
pub mod transport;

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, error, info};

pub use drive::HttpDrive;
pub use error::RemoteError;
pub use retry::RetryPolicy;
pub use transport::{DriveTransport, FileMetadata, ListPage};

use crate::transfer::progress::{format_bytes, format_speed};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Extensions that name a content encoding rather than a content type
const ENCODING_EXTENSIONS: &[&str] = &["gz", "bz2", "xz", "br", "Z", "zst"];

/// Opaque identifier of an uploaded object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteObjectId(String);

impl RemoteObjectId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RemoteObjectId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for RemoteObjectId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for RemoteObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Chunking and pacing of batch deletes
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOptions {
    /// Ids per grouped request
    pub chunk_size: usize,

    /// Pause between two consecutive grouped requests
    pub pause: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            pause: Duration::from_secs(2),
        }
    }
}

/// One id that could not be deleted
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteFailure {
    /// Position of the id in the requested list
    pub index: usize,
    pub id: RemoteObjectId,
    pub reason: String,
}

/// Outcome of a batch delete
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteReport {
    pub requested: usize,
    pub deleted: usize,
    pub failures: Vec<DeleteFailure>,
}

#[async_trait]
pub trait Uploader: Send + Sync {
    /// Upload a local file into `parent_folder_id` (the drive root when `None`)
    async fn upload(&self, file_path: &Path, parent_folder_id: Option<&str>) -> Result<RemoteObjectId, RemoteError>;
}

#[async_trait]
pub trait Lister: Send + Sync {
    /// Ids of every direct child of `folder_id`
    async fn list_objects(&self, folder_id: &str) -> Result<HashSet<RemoteObjectId>, RemoteError>;
}

#[async_trait]
pub trait BatchDeleter: Send + Sync {
    /// Delete `ids`; every failure is recorded in the report, never raised
    async fn delete_batch(&self, ids: &[RemoteObjectId]) -> DeleteReport;
}

/// Everything the orchestrator needs from the remote side
pub trait RemoteStorage: Uploader + Lister + BatchDeleter {}

impl<T: Uploader + Lister + BatchDeleter> RemoteStorage for T {}

/// Content type sent with an upload, guessed from the file name
pub fn content_type(path: &Path) -> String {
    let encoded = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ENCODING_EXTENSIONS.contains(&ext));
    if encoded {
        return DEFAULT_CONTENT_TYPE.to_string();
    }

    mime_guess::from_path(path)
        .first()
        .map(|mime| mime.essence_str().to_string())
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string())
}

/// [`RemoteStorage`] over a raw transport, with retries and paced deletes
pub struct RemoteStore<T> {
    transport: T,
    retry: RetryPolicy,
    batch: BatchOptions,
}

impl<T: DriveTransport> RemoteStore<T> {
    pub fn new(transport: T, retry: RetryPolicy, batch: BatchOptions) -> Self {
        Self {
            transport,
            retry,
            batch,
        }
    }
}

#[async_trait]
impl<T: DriveTransport> Uploader for RemoteStore<T> {
    async fn upload(&self, file_path: &Path, parent_folder_id: Option<&str>) -> Result<RemoteObjectId, RemoteError> {
        let name = file_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| RemoteError::Io {
                path: file_path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name"),
            })?;
        let metadata = FileMetadata {
            name,
            parent: parent_folder_id.map(str::to_string),
            content_type: content_type(file_path),
        };

        info!("Uploading {} ({})", file_path.display(), metadata.content_type);
        let started = Instant::now();

        let operation = format!("upload {}", metadata.name);
        let id = self
            .retry
            .execute(&operation, || self.transport.create_file(file_path, &metadata))
            .await?;

        let size = tokio::fs::metadata(file_path).await.map(|m| m.len()).unwrap_or(0);
        info!(
            "Uploaded {} as {} ({}, {})",
            metadata.name,
            id,
            format_bytes(size),
            format_speed(size, started.elapsed())
        );
        Ok(id)
    }
}

#[async_trait]
impl<T: DriveTransport> Lister for RemoteStore<T> {
    async fn list_objects(&self, folder_id: &str) -> Result<HashSet<RemoteObjectId>, RemoteError> {
        let mut ids = HashSet::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0;

        loop {
            let token = page_token.as_deref();
            let page = self
                .retry
                .execute("list files", || self.transport.list_page(folder_id, token))
                .await?;
            pages += 1;
            ids.extend(page.ids);

            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }

        debug!("Listed {} objects in {} page(s) of folder {}", ids.len(), pages, folder_id);
        Ok(ids)
    }
}

#[async_trait]
impl<T: DriveTransport> BatchDeleter for RemoteStore<T> {
    async fn delete_batch(&self, ids: &[RemoteObjectId]) -> DeleteReport {
        let chunk_size = self.batch.chunk_size.max(1);
        let mut report = DeleteReport {
            requested: ids.len(),
            ..DeleteReport::default()
        };

        let mut record_failure = |index: usize, id: &RemoteObjectId, reason: String| {
            error!("Request #{} failed: {}", index, reason);
            report.failures.push(DeleteFailure {
                index,
                id: id.clone(),
                reason,
            });
        };

        let mut deleted = 0;
        for (chunk_index, chunk) in ids.chunks(chunk_size).enumerate() {
            if chunk_index > 0 && !self.batch.pause.is_zero() {
                debug!("Pausing {:?} before the next delete batch", self.batch.pause);
                tokio::time::sleep(self.batch.pause).await;
            }

            let offset = chunk_index * chunk_size;
            match self
                .retry
                .execute("delete batch", || self.transport.delete_many(chunk))
                .await
            {
                Ok(outcomes) => {
                    let mut outcomes = outcomes.into_iter();
                    for (index, id) in chunk.iter().enumerate() {
                        match outcomes.next() {
                            Some(Ok(())) => deleted += 1,
                            Some(Err(err)) => record_failure(offset + index, id, err.to_string()),
                            None => record_failure(offset + index, id, "no response for request".to_string()),
                        }
                    }
                }
                Err(err) => {
                    for (index, id) in chunk.iter().enumerate() {
                        record_failure(offset + index, id, err.to_string());
                    }
                }
            }
        }

        report.deleted = deleted;
        info!(
            "Deleted {} of {} old backup(s), {} failed",
            report.deleted,
            report.requested,
            report.failures.len()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeState {
        uploads: Vec<FileMetadata>,
        upload_failures: u32,
        list_calls: Vec<Option<String>>,
        delete_calls: Vec<usize>,
    }

    /// Transport that records calls and serves canned answers
    #[derive(Default)]
    struct FakeTransport {
        state: Mutex<FakeState>,
        pages: HashMap<Option<String>, ListPage>,
        failing_ids: HashSet<RemoteObjectId>,
        /// 1-based delete calls that fail as a whole with HTTP 403
        failing_calls: HashSet<usize>,
    }

    fn api_error(status: u16) -> RemoteError {
        RemoteError::Api {
            operation: "fake".to_string(),
            status,
            message: "fake failure".to_string(),
        }
    }

    #[async_trait]
    impl DriveTransport for FakeTransport {
        async fn create_file(&self, _path: &Path, metadata: &FileMetadata) -> Result<RemoteObjectId, RemoteError> {
            let mut state = self.state.lock().unwrap();
            state.uploads.push(metadata.clone());
            if state.upload_failures > 0 {
                state.upload_failures -= 1;
                return Err(api_error(503));
            }
            Ok(RemoteObjectId::from(format!("id-{}", state.uploads.len())))
        }

        async fn list_page(&self, _folder_id: &str, page_token: Option<&str>) -> Result<ListPage, RemoteError> {
            let key = page_token.map(str::to_string);
            self.state.lock().unwrap().list_calls.push(key.clone());
            self.pages
                .get(&key)
                .cloned()
                .ok_or_else(|| RemoteError::InvalidResponse("unknown page".to_string()))
        }

        async fn delete_many(&self, ids: &[RemoteObjectId]) -> Result<Vec<Result<(), RemoteError>>, RemoteError> {
            let call = {
                let mut state = self.state.lock().unwrap();
                state.delete_calls.push(ids.len());
                state.delete_calls.len()
            };
            if self.failing_calls.contains(&call) {
                return Err(api_error(403));
            }
            Ok(ids
                .iter()
                .map(|id| {
                    if self.failing_ids.contains(id) {
                        Err(api_error(404))
                    } else {
                        Ok(())
                    }
                })
                .collect())
        }
    }

    fn store(transport: FakeTransport, batch: BatchOptions) -> RemoteStore<FakeTransport> {
        RemoteStore::new(transport, RetryPolicy::default(), batch)
    }

    fn numbered_ids(count: usize) -> Vec<RemoteObjectId> {
        (0..count).map(|i| RemoteObjectId::from(format!("id-{}", i))).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_batch_paces_chunks() {
        let store = store(FakeTransport::default(), BatchOptions::default());

        let start = tokio::time::Instant::now();
        let report = store.delete_batch(&numbered_ids(250)).await;
        let elapsed = start.elapsed();

        assert_eq!(store.transport.state.lock().unwrap().delete_calls, vec![100, 100, 50]);
        assert_eq!(report.requested, 250);
        assert_eq!(report.deleted, 250);
        assert!(report.failures.is_empty());
        // Two pauses: none before the first chunk
        assert!(elapsed >= Duration::from_secs(4));
        assert!(elapsed < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_failure_reports_global_index() {
        let transport = FakeTransport {
            failing_ids: HashSet::from([RemoteObjectId::from("id-120")]),
            ..FakeTransport::default()
        };
        let store = store(transport, BatchOptions::default());

        let report = store.delete_batch(&numbered_ids(150)).await;

        assert_eq!(report.deleted, 149);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].index, 120);
        assert_eq!(report.failures[0].id, RemoteObjectId::from("id-120"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_chunk_does_not_stop_remaining_chunks() {
        let transport = FakeTransport {
            failing_calls: HashSet::from([2]),
            ..FakeTransport::default()
        };
        let store = store(
            transport,
            BatchOptions {
                chunk_size: 2,
                pause: Duration::ZERO,
            },
        );

        let report = store.delete_batch(&numbered_ids(5)).await;

        assert_eq!(store.transport.state.lock().unwrap().delete_calls, vec![2, 2, 1]);
        assert_eq!(report.deleted, 3);
        let failed: Vec<usize> = report.failures.iter().map(|f| f.index).collect();
        assert_eq!(failed, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_delete_empty_list() {
        let store = store(FakeTransport::default(), BatchOptions::default());

        let report = store.delete_batch(&[]).await;

        assert_eq!(report, DeleteReport::default());
        assert!(store.transport.state.lock().unwrap().delete_calls.is_empty());
    }

    #[tokio::test]
    async fn test_list_objects_follows_pages() {
        let mut pages = HashMap::new();
        pages.insert(
            None,
            ListPage {
                ids: vec![RemoteObjectId::from("a"), RemoteObjectId::from("b")],
                next_page_token: Some("p2".to_string()),
            },
        );
        pages.insert(
            Some("p2".to_string()),
            ListPage {
                ids: vec![RemoteObjectId::from("c")],
                next_page_token: None,
            },
        );
        let store = store(
            FakeTransport {
                pages,
                ..FakeTransport::default()
            },
            BatchOptions::default(),
        );

        let ids = store.list_objects("folder").await.unwrap();

        let expected: HashSet<RemoteObjectId> = ["a", "b", "c"].into_iter().map(RemoteObjectId::from).collect();
        assert_eq!(ids, expected);
        assert_eq!(
            store.transport.state.lock().unwrap().list_calls,
            vec![None, Some("p2".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_retries_and_sends_metadata() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("docs_20240101_10-00-00.zip");
        std::fs::write(&archive, b"zip bytes").unwrap();

        let transport = FakeTransport::default();
        transport.state.lock().unwrap().upload_failures = 2;
        let store = store(transport, BatchOptions::default());

        let id = store.upload(&archive, Some("dest")).await.unwrap();

        let state = store.transport.state.lock().unwrap();
        assert_eq!(state.uploads.len(), 3);
        assert_eq!(id, RemoteObjectId::from("id-3"));
        let metadata = &state.uploads[0];
        assert_eq!(metadata.name, "docs_20240101_10-00-00.zip");
        assert_eq!(metadata.parent.as_deref(), Some("dest"));
        assert_eq!(metadata.content_type, "application/zip");
    }

    #[test]
    fn test_content_type() {
        assert_eq!(content_type(Path::new("a.zip")), "application/zip");
        assert_eq!(content_type(Path::new("notes.txt")), "text/plain");
        assert_eq!(content_type(Path::new("backup.tar.gz")), DEFAULT_CONTENT_TYPE);
        assert_eq!(content_type(Path::new("data.zst")), DEFAULT_CONTENT_TYPE);
        assert_eq!(content_type(Path::new("no_extension")), DEFAULT_CONTENT_TYPE);
    }
}
