//! Raw, single-attempt calls against the remote drive.

use std::path::Path;

use async_trait::async_trait;

use super::{RemoteError, RemoteObjectId};

/// Metadata sent with an upload
#[derive(Debug, Clone, PartialEq)]
pub struct FileMetadata {
    pub name: String,
    /// Destination folder; the drive root when `None`
    pub parent: Option<String>,
    pub content_type: String,
}

/// One page of a folder listing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListPage {
    pub ids: Vec<RemoteObjectId>,
    pub next_page_token: Option<String>,
}

/// One HTTP round-trip per call, no retries and no pacing.
///
/// [`super::RemoteStore`] layers the retry policy and batch pacing on top.
#[async_trait]
pub trait DriveTransport: Send + Sync {
    /// Upload the file at `path` as a new object
    async fn create_file(&self, path: &Path, metadata: &FileMetadata) -> Result<RemoteObjectId, RemoteError>;

    /// Fetch one page of the direct children of `folder_id`
    async fn list_page(&self, folder_id: &str, page_token: Option<&str>) -> Result<ListPage, RemoteError>;

    /// Delete `ids` in one batched request.
    ///
    /// The outer error means the whole batch failed. Otherwise the result
    /// holds one entry per requested id, in request order.
    async fn delete_many(&self, ids: &[RemoteObjectId]) -> Result<Vec<Result<(), RemoteError>>, RemoteError>;
}
