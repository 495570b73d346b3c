//! Google Drive v3 transport over reqwest.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use uuid::Uuid;

use super::transport::{DriveTransport, FileMetadata, ListPage};
use super::{RemoteError, RemoteObjectId};
use crate::auth::{RefreshTokenSource, TokenCache, TokenRecord};
use crate::transfer::progress::format_bytes;
use crate::transfer::progress_stream::{ProgressCallback, ProgressStream, UploadProgress};

const FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";
const UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files";
const BATCH_URL: &str = "https://www.googleapis.com/batch/drive/v3";

const LIST_PAGE_SIZE: &str = "1000";
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
struct CreatedFile {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<CreatedFile>,
    next_page_token: Option<String>,
}

/// Authorized Google Drive client
pub struct HttpDrive {
    client: reqwest::Client,
    auth: TokenCache<RefreshTokenSource>,
}

impl HttpDrive {
    /// Build a client from a stored token, refreshing the access token first.
    ///
    /// Refreshed tokens live only in memory; the token file is left untouched.
    pub async fn authorize(token: &TokenRecord) -> crate::Result<Self> {
        let client = reqwest::Client::new();
        let auth = TokenCache::new(RefreshTokenSource::new(client.clone(), token.clone()));
        auth.prime().await?;
        info!("Google Drive client authorized");
        Ok(Self { client, auth })
    }

    async fn create_file_with(
        &self,
        access_token: String,
        path: &Path,
        metadata: &FileMetadata,
    ) -> Result<RemoteObjectId, RemoteError> {
        let io_error = |source| RemoteError::Io {
            path: path.to_path_buf(),
            source,
        };
        let size = tokio::fs::metadata(path).await.map_err(io_error)?.len();

        let mut session = serde_json::json!({ "name": metadata.name });
        if let Some(parent) = &metadata.parent {
            session["parents"] = serde_json::json!([parent]);
        }

        let response = self
            .client
            .post(UPLOAD_URL)
            .query(&[("uploadType", "resumable"), ("fields", "id")])
            .bearer_auth(&access_token)
            .header("X-Upload-Content-Type", &metadata.content_type)
            .header("X-Upload-Content-Length", size.to_string())
            .json(&session)
            .send()
            .await?;
        let response = check_status("create upload session", response).await?;

        let session_url = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| RemoteError::InvalidResponse("upload session has no Location header".to_string()))?;

        let file = tokio::fs::File::open(path).await.map_err(io_error)?;
        let name = metadata.name.clone();
        let progress: ProgressCallback = Arc::new(move |progress: UploadProgress| {
            debug!(
                "Uploading {}: {} of {} ({:.1}%)",
                name,
                format_bytes(progress.sent),
                format_bytes(progress.total),
                progress.percent()
            );
        });
        let stream = ProgressStream::new(ReaderStream::new(file), size, PROGRESS_INTERVAL, progress);

        let response = self
            .client
            .put(&session_url)
            .bearer_auth(&access_token)
            .header(CONTENT_TYPE, &metadata.content_type)
            .header(CONTENT_LENGTH, size.to_string())
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await?;
        let response = check_status("upload", response).await?;

        let created: CreatedFile = response.json().await?;
        Ok(RemoteObjectId::from(created.id))
    }

    async fn list_page_with(
        &self,
        access_token: String,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> Result<ListPage, RemoteError> {
        let query = format!("'{}' in parents", folder_id);
        let mut params = vec![
            ("q", query.as_str()),
            ("pageSize", LIST_PAGE_SIZE),
            ("spaces", "drive"),
            ("orderBy", "folder"),
            ("fields", "nextPageToken,files(id)"),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }

        let response = self
            .client
            .get(FILES_URL)
            .bearer_auth(&access_token)
            .query(&params)
            .send()
            .await?;
        let response = check_status("list files", response).await?;

        let list: FileList = response.json().await?;
        Ok(ListPage {
            ids: list.files.into_iter().map(|file| RemoteObjectId::from(file.id)).collect(),
            next_page_token: list.next_page_token,
        })
    }

    async fn delete_many_with(
        &self,
        access_token: String,
        ids: &[RemoteObjectId],
    ) -> Result<Vec<Result<(), RemoteError>>, RemoteError> {
        let boundary = format!("batch_{}", Uuid::new_v4().simple());
        let response = self
            .client
            .post(BATCH_URL)
            .bearer_auth(&access_token)
            .header(CONTENT_TYPE, format!("multipart/mixed; boundary={}", boundary))
            .body(build_batch_body(&boundary, ids))
            .send()
            .await?;
        let response = check_status("delete batch", response).await?;

        let response_boundary = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_boundary)
            .ok_or_else(|| RemoteError::InvalidResponse("batch response has no multipart boundary".to_string()))?;

        let body = response.text().await?;
        Ok(parse_batch_response(&body, &response_boundary, ids.len()))
    }
}

#[async_trait]
impl DriveTransport for HttpDrive {
    async fn create_file(&self, path: &Path, metadata: &FileMetadata) -> Result<RemoteObjectId, RemoteError> {
        self.auth
            .authorized(move |token| self.create_file_with(token, path, metadata))
            .await
    }

    async fn list_page(&self, folder_id: &str, page_token: Option<&str>) -> Result<ListPage, RemoteError> {
        self.auth
            .authorized(move |token| self.list_page_with(token, folder_id, page_token))
            .await
    }

    async fn delete_many(&self, ids: &[RemoteObjectId]) -> Result<Vec<Result<(), RemoteError>>, RemoteError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.auth
            .authorized(move |token| self.delete_many_with(token, ids))
            .await
    }
}

/// Turn a non-success response into [`RemoteError::Api`]
async fn check_status(operation: &str, response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
    Err(RemoteError::Api {
        operation: operation.to_string(),
        status: status.as_u16(),
        message: api_message(&text),
    })
}

/// Pull `error.message` out of a Google JSON error body, or return the trimmed text
fn api_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| value["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

/// One `DELETE` sub-request per id, tagged `<item-N>` by position
fn build_batch_body(boundary: &str, ids: &[RemoteObjectId]) -> String {
    let mut body = String::new();
    for (index, id) in ids.iter().enumerate() {
        let _ = write!(
            body,
            "--{boundary}\r\n\
             Content-Type: application/http\r\n\
             Content-ID: <item-{index}>\r\n\
             \r\n\
             DELETE /drive/v3/files/{id} HTTP/1.1\r\n\
             \r\n"
        );
    }
    let _ = write!(body, "--{boundary}--\r\n");
    body
}

fn parse_boundary(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .map(str::trim)
        .find_map(|param| param.strip_prefix("boundary="))
        .map(|boundary| boundary.trim_matches('"').to_string())
        .filter(|boundary| !boundary.is_empty())
}

/// Map every part of a batch response back to its request by `Content-ID`.
///
/// Items the response never mentions are reported as failures.
fn parse_batch_response(body: &str, boundary: &str, count: usize) -> Vec<Result<(), RemoteError>> {
    let body = body.replace("\r\n", "\n");
    let delimiter = format!("--{}", boundary);
    let mut outcomes: Vec<Option<Result<(), RemoteError>>> = (0..count).map(|_| None).collect();

    for part in body.split(delimiter.as_str()) {
        let part = part.trim_start();
        if part.is_empty() || part.starts_with("--") {
            continue;
        }

        let Some(index) = part_index(part).filter(|index| *index < count) else {
            debug!("Ignoring batch response part without a known Content-ID");
            continue;
        };

        outcomes[index] = Some(part_outcome(part, index));
    }

    outcomes
        .into_iter()
        .enumerate()
        .map(|(index, outcome)| {
            outcome.unwrap_or_else(|| Err(RemoteError::InvalidResponse(format!("no response for item {}", index))))
        })
        .collect()
}

fn part_index(part: &str) -> Option<usize> {
    part.lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim().eq_ignore_ascii_case("content-id").then(|| value.trim())
        })?
        .trim_matches(|c| c == '<' || c == '>')
        .rsplit('-')
        .next()?
        .parse()
        .ok()
}

fn part_outcome(part: &str, index: usize) -> Result<(), RemoteError> {
    let status = part
        .lines()
        .find(|line| line.starts_with("HTTP/"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| RemoteError::InvalidResponse(format!("no HTTP status for item {}", index)))?;

    if (200..300).contains(&status) {
        return Ok(());
    }

    // Outer part headers, inner response headers, then the inner body
    let inner_body = part.splitn(3, "\n\n").nth(2).unwrap_or_default();
    Err(RemoteError::Api {
        operation: "delete".to_string(),
        status,
        message: api_message(inner_body),
    })
}
