//! Google Drive API client.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use storegate_common::{ByteRange, Error, Result};

use crate::http::{
    build_client, error_from_response, json_response, send_authorized, transport_error,
    RateSignalCell,
};
use crate::provider::{ByteStream, CredentialSource, RateLimitSignal};

/// Google Drive API base URL.
const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
/// Google Drive upload API base URL.
const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

const FILE_FIELDS: &str =
    "id,name,mimeType,size,createdTime,modifiedTime,parents,md5Checksum,trashed,webViewLink";
const LIST_FIELDS: &str = "nextPageToken,files(id,name,mimeType,size,createdTime,modifiedTime,parents,md5Checksum,trashed,webViewLink)";

/// Google Drive file metadata from API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    /// File size in bytes (only for files, not folders).
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parents: Vec<String>,
    /// MD5 checksum (only for binary files).
    #[serde(default)]
    pub md5_checksum: Option<String>,
    #[serde(default)]
    pub trashed: bool,
    #[serde(default)]
    pub web_view_link: Option<String>,
}

impl DriveFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }

    pub fn size_bytes(&self) -> Option<u64> {
        self.size.as_ref().and_then(|s| s.parse().ok())
    }
}

/// One page of a folder listing.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileListResponse {
    pub files: Vec<DriveFile>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Outcome of sending one chunk to a resumable session.
#[derive(Debug)]
pub enum ChunkOutcome {
    /// 308 Resume Incomplete.
    Incomplete,
    Complete(DriveFile),
}

/// Google Drive API client.
pub struct DriveClient {
    http: Client,
    credentials: Arc<dyn CredentialSource>,
    signal: RateSignalCell,
}

impl DriveClient {
    /// Create a new Drive client.
    pub fn new(credentials: Arc<dyn CredentialSource>) -> Result<Self> {
        Ok(Self {
            http: build_client(None)?,
            credentials,
            signal: RateSignalCell::new(),
        })
    }

    pub fn rate_limit_signal(&self) -> Option<RateLimitSignal> {
        self.signal.current()
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.signal.observe(err);
        }
        result
    }

    /// Get file metadata by ID.
    pub async fn get_file(&self, file_id: &str) -> Result<DriveFile> {
        let url = format!("{}/files/{}", DRIVE_API_BASE, file_id);
        let response = send_authorized(&*self.credentials, "get file", |auth| {
            self.http
                .get(&url)
                .header(header::AUTHORIZATION, auth)
                .query(&[("fields", FILE_FIELDS)])
        })
        .await?;

        self.observe(json_response(response, "get file").await)
    }

    /// Create a folder.
    pub async fn create_folder(&self, name: &str, parent_id: &str) -> Result<DriveFile> {
        let url = format!("{}/files", DRIVE_API_BASE);
        let metadata = serde_json::json!({
            "name": name,
            "mimeType": FOLDER_MIME_TYPE,
            "parents": [parent_id],
        });

        let response = send_authorized(&*self.credentials, "create folder", |auth| {
            self.http
                .post(&url)
                .header(header::AUTHORIZATION, auth)
                .query(&[("fields", FILE_FIELDS)])
                .json(&metadata)
        })
        .await?;

        self.observe(json_response(response, "create folder").await)
    }

    /// List one page of a folder's children.
    pub async fn list_page(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<FileListResponse> {
        let url = format!("{}/files", DRIVE_API_BASE);
        let query = format!("'{}' in parents and trashed = false", escape_query(folder_id));
        let page_size = page_size.clamp(1, 1000).to_string();

        let response = send_authorized(&*self.credentials, "list folder", |auth| {
            let mut request = self
                .http
                .get(&url)
                .header(header::AUTHORIZATION, auth)
                .query(&[
                    ("q", query.as_str()),
                    ("fields", LIST_FIELDS),
                    ("pageSize", page_size.as_str()),
                    ("orderBy", "folder,name"),
                ]);
            if let Some(token) = page_token {
                request = request.query(&[("pageToken", token)]);
            }
            request
        })
        .await?;

        self.observe(json_response(response, "list folder").await)
    }

    /// Find a child by name in a folder.
    pub async fn find_file(&self, name: &str, parent_id: &str) -> Result<Option<DriveFile>> {
        let url = format!("{}/files", DRIVE_API_BASE);
        let query = format!(
            "name = '{}' and '{}' in parents and trashed = false",
            escape_query(name),
            escape_query(parent_id)
        );

        let response = send_authorized(&*self.credentials, "find file", |auth| {
            self.http
                .get(&url)
                .header(header::AUTHORIZATION, auth)
                .query(&[
                    ("q", query.as_str()),
                    ("fields", LIST_FIELDS),
                    ("pageSize", "1"),
                ])
        })
        .await?;

        let list: FileListResponse = self.observe(json_response(response, "find file").await)?;
        Ok(list.files.into_iter().next())
    }

    /// Upload a small file in one multipart/related request.
    pub async fn upload_simple(&self, name: &str, parent_id: &str, data: Bytes) -> Result<DriveFile> {
        let url = format!("{}/files", DRIVE_UPLOAD_BASE);
        let metadata = serde_json::json!({
            "name": name,
            "parents": [parent_id],
        });
        let metadata_json = serde_json::to_string(&metadata)?;

        let boundary = "StoregateBoundary";
        let mut body = Vec::with_capacity(data.len() + metadata_json.len() + 256);
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
        body.extend_from_slice(metadata_json.as_bytes());
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(&data);
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(format!("--{}--", boundary).as_bytes());
        let body = Bytes::from(body);

        let response = send_authorized(&*self.credentials, "upload file", |auth| {
            self.http
                .post(&url)
                .header(header::AUTHORIZATION, auth)
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/related; boundary={}", boundary),
                )
                .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
                .body(body.clone())
        })
        .await?;

        self.observe(json_response(response, "upload file").await)
    }

    /// Replace the content of an existing file.
    pub async fn update_file(&self, file_id: &str, data: Bytes) -> Result<DriveFile> {
        let url = format!("{}/files/{}", DRIVE_UPLOAD_BASE, file_id);

        let response = send_authorized(&*self.credentials, "update file", |auth| {
            self.http
                .patch(&url)
                .header(header::AUTHORIZATION, auth)
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .query(&[("uploadType", "media"), ("fields", FILE_FIELDS)])
                .body(data.clone())
        })
        .await?;

        self.observe(json_response(response, "update file").await)
    }

    /// Start a resumable upload session; returns the session URI.
    ///
    /// With `existing_id` the session replaces that file's content.
    pub async fn start_resumable_upload(
        &self,
        name: &str,
        parent_id: &str,
        existing_id: Option<&str>,
        total_size: Option<u64>,
    ) -> Result<String> {
        let (url, metadata) = match existing_id {
            Some(id) => (
                format!("{}/files/{}", DRIVE_UPLOAD_BASE, id),
                serde_json::json!({}),
            ),
            None => (
                format!("{}/files", DRIVE_UPLOAD_BASE),
                serde_json::json!({ "name": name, "parents": [parent_id] }),
            ),
        };

        let response = send_authorized(&*self.credentials, "start resumable upload", |auth| {
            let request = if existing_id.is_some() {
                self.http.patch(&url)
            } else {
                self.http.post(&url)
            };
            let mut request = request
                .header(header::AUTHORIZATION, auth)
                .query(&[("uploadType", "resumable"), ("fields", FILE_FIELDS)])
                .json(&metadata);
            if let Some(total) = total_size {
                request = request.header("X-Upload-Content-Length", total.to_string());
            }
            request
        })
        .await?;

        if !response.status().is_success() {
            return self.observe(Err(error_from_response(response, "start resumable upload").await));
        }

        let upload_uri = response
            .headers()
            .get(header::LOCATION)
            .ok_or_else(|| Error::Unknown("No upload URI in response".to_string()))?
            .to_str()
            .map_err(|e| Error::Unknown(format!("Invalid upload URI: {}", e)))?
            .to_string();

        Ok(upload_uri)
    }

    /// Send one chunk of a resumable upload.
    ///
    /// `total_size` may be unknown until the final chunk.
    pub async fn upload_chunk(
        &self,
        upload_uri: &str,
        data: Bytes,
        start_byte: u64,
        total_size: Option<u64>,
    ) -> Result<ChunkOutcome> {
        let content_range = content_range(start_byte, data.len() as u64, total_size);

        let response = self
            .http
            .put(upload_uri)
            .header(header::CONTENT_LENGTH, data.len().to_string())
            .header(header::CONTENT_RANGE, content_range)
            .body(data)
            .send()
            .await
            .map_err(|e| transport_error("upload chunk", e))?;

        self.chunk_outcome(response).await
    }

    /// Ask a resumable session whether it has finished.
    pub async fn query_upload(&self, upload_uri: &str, total_size: Option<u64>) -> Result<ChunkOutcome> {
        let total = total_size.map(|t| t.to_string()).unwrap_or_else(|| "*".to_string());
        let response = self
            .http
            .put(upload_uri)
            .header(header::CONTENT_LENGTH, "0")
            .header(header::CONTENT_RANGE, format!("bytes */{}", total))
            .send()
            .await
            .map_err(|e| transport_error("query upload", e))?;

        self.chunk_outcome(response).await
    }

    async fn chunk_outcome(&self, response: reqwest::Response) -> Result<ChunkOutcome> {
        let status = response.status();
        if status == StatusCode::OK || status == StatusCode::CREATED {
            let file: DriveFile = json_response(response, "upload chunk").await?;
            Ok(ChunkOutcome::Complete(file))
        } else if status.as_u16() == 308 {
            Ok(ChunkOutcome::Incomplete)
        } else {
            self.observe(Err(error_from_response(response, "upload chunk").await))
        }
    }

    /// Cancel a resumable upload session.
    pub async fn cancel_upload(&self, upload_uri: &str) -> Result<()> {
        let response = self
            .http
            .delete(upload_uri)
            .send()
            .await
            .map_err(|e| transport_error("cancel upload", e))?;

        // Drive answers 499 once a session is cancelled; unknown sessions are gone already.
        let status = response.status().as_u16();
        if response.status().is_success() || status == 499 || status == 404 {
            Ok(())
        } else {
            Err(error_from_response(response, "cancel upload").await)
        }
    }

    /// Download file content as a stream, optionally a byte range.
    pub async fn download_stream(&self, file_id: &str, range: Option<ByteRange>) -> Result<ByteStream> {
        let url = format!("{}/files/{}", DRIVE_API_BASE, file_id);

        let response = send_authorized(&*self.credentials, "download file", |auth| {
            let mut request = self
                .http
                .get(&url)
                .header(header::AUTHORIZATION, auth)
                .query(&[("alt", "media")]);
            if let Some(range) = range {
                request = request.header(header::RANGE, range.to_header());
            }
            request
        })
        .await?;

        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(crate::provider::stream_from_bytes(Bytes::new()));
        }
        if !response.status().is_success() {
            return self.observe(Err(error_from_response(response, "download file").await));
        }

        let stream = response
            .bytes_stream()
            .map(|result| result.map_err(|e| Error::Network(format!("Stream read error: {}", e))));

        Ok(Box::pin(stream))
    }

    /// Delete a file or folder.
    pub async fn delete(&self, file_id: &str) -> Result<()> {
        let url = format!("{}/files/{}", DRIVE_API_BASE, file_id);

        let response = send_authorized(&*self.credentials, "delete file", |auth| {
            self.http.delete(&url).header(header::AUTHORIZATION, auth)
        })
        .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            self.observe(Err(error_from_response(response, "delete file").await))
        }
    }

    /// Move and/or rename a file.
    pub async fn move_file(
        &self,
        file_id: &str,
        new_name: &str,
        new_parent: Option<&str>,
        current_parent: Option<&str>,
    ) -> Result<DriveFile> {
        let url = format!("{}/files/{}", DRIVE_API_BASE, file_id);
        let metadata = serde_json::json!({ "name": new_name });

        let response = send_authorized(&*self.credentials, "move file", |auth| {
            let mut request = self
                .http
                .patch(&url)
                .header(header::AUTHORIZATION, auth)
                .query(&[("fields", FILE_FIELDS)]);

            if let Some(new_parent_id) = new_parent {
                request = request.query(&[("addParents", new_parent_id)]);
                if let Some(old_parent_id) = current_parent {
                    request = request.query(&[("removeParents", old_parent_id)]);
                }
            }
            request.json(&metadata)
        })
        .await?;

        self.observe(json_response(response, "move file").await)
    }

    /// Grant "anyone with the link" read access.
    pub async fn share_anyone_reader(&self, file_id: &str) -> Result<()> {
        let url = format!("{}/files/{}/permissions", DRIVE_API_BASE, file_id);
        let permission = serde_json::json!({ "role": "reader", "type": "anyone" });

        let response = send_authorized(&*self.credentials, "create permission", |auth| {
            self.http
                .post(&url)
                .header(header::AUTHORIZATION, auth)
                .json(&permission)
        })
        .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            self.observe(Err(error_from_response(response, "create permission").await))
        }
    }
}

/// Escape a value for a Drive `q` string literal.
fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn content_range(start: u64, len: u64, total: Option<u64>) -> String {
    let total = total.map(|t| t.to_string()).unwrap_or_else(|| "*".to_string());
    if len == 0 {
        format!("bytes */{}", total)
    } else {
        format!("bytes {}-{}/{}", start, start + len - 1, total)
    }
}
