//! Microsoft Graph client for OneDrive.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use storegate_common::{ByteRange, Error, LogicalPath, Result};

use crate::http::{
    build_client, error_from_response, json_response, send_authorized, transport_error,
    RateSignalCell,
};
use crate::provider::{stream_from_bytes, ByteStream, CredentialSource, RateLimitSignal};

/// Graph v1.0 endpoint.
pub const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";

/// Characters left unescaped inside a `root:/path:` segment.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderFacet {
    #[serde(default)]
    pub child_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemReference {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub drive_id: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

/// Graph driveItem resource (the fields we use).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub last_modified_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub e_tag: Option<String>,
    #[serde(default)]
    pub folder: Option<FolderFacet>,
    #[serde(default)]
    pub parent_reference: Option<ItemReference>,
}

impl DriveItem {
    pub fn is_folder(&self) -> bool {
        self.folder.is_some()
    }
}

#[derive(Debug, Deserialize)]
pub struct ChildrenPage {
    #[serde(default)]
    pub value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink", default)]
    pub next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadSession {
    upload_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SharingLink {
    web_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Permission {
    link: SharingLink,
    #[serde(default)]
    expiration_date_time: Option<DateTime<Utc>>,
}

/// Outcome of one upload session fragment.
#[derive(Debug)]
pub enum FragmentOutcome {
    /// 202 Accepted, more bytes expected.
    Accepted,
    Complete(DriveItem),
}

/// What to do when the target name is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictBehavior {
    Fail,
    Replace,
}

impl ConflictBehavior {
    fn as_str(self) -> &'static str {
        match self {
            ConflictBehavior::Fail => "fail",
            ConflictBehavior::Replace => "replace",
        }
    }
}

/// Graph client bound to one drive.
pub struct GraphClient {
    http: Client,
    credentials: Arc<dyn CredentialSource>,
    api_base: String,
    /// `/me/drive` or `/drives/{id}`.
    drive_path: String,
    signal: RateSignalCell,
}

impl GraphClient {
    /// Create a client for `drive_id` ("me" or empty for the signed-in user's drive).
    pub fn new(
        api_base: impl Into<String>,
        drive_id: &str,
        credentials: Arc<dyn CredentialSource>,
    ) -> Result<Self> {
        let drive_path = if drive_id.is_empty() || drive_id == "me" {
            "/me/drive".to_string()
        } else {
            format!("/drives/{}", utf8_percent_encode(drive_id, PATH_SEGMENT))
        };

        Ok(Self {
            http: build_client(None)?,
            credentials,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            drive_path,
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

    /// URL of the item at `path`, optionally followed by a sub-resource.
    pub fn item_url(&self, path: &LogicalPath, suffix: &str) -> String {
        let base = format!("{}{}", self.api_base, self.drive_path);
        if path.is_root() {
            if suffix.is_empty() {
                format!("{}/root", base)
            } else {
                format!("{}/root/{}", base, suffix)
            }
        } else {
            let encoded: Vec<String> = path
                .native_components()
                .iter()
                .map(|c| utf8_percent_encode(c, PATH_SEGMENT).to_string())
                .collect();
            if suffix.is_empty() {
                format!("{}/root:/{}:", base, encoded.join("/"))
            } else {
                format!("{}/root:/{}:/{}", base, encoded.join("/"), suffix)
            }
        }
    }

    /// Whether a page link points at this client's Graph endpoint.
    pub fn owns_link(&self, link: &str) -> bool {
        link.starts_with(&self.api_base)
    }

    /// Get item metadata, `None` when absent.
    pub async fn get_item(&self, path: &LogicalPath) -> Result<Option<DriveItem>> {
        let url = self.item_url(path, "");
        let response = send_authorized(&*self.credentials, "get item", |auth| {
            self.http.get(&url).header(header::AUTHORIZATION, auth)
        })
        .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        self.observe(json_response(response, "get item").await).map(Some)
    }

    /// First page of a folder's children.
    pub async fn list_children(&self, path: &LogicalPath, page_size: u32) -> Result<ChildrenPage> {
        let url = self.item_url(path, "children");
        let top = page_size.clamp(1, 999).to_string();
        let response = send_authorized(&*self.credentials, "list children", |auth| {
            self.http
                .get(&url)
                .header(header::AUTHORIZATION, auth)
                .query(&[("$top", top.as_str())])
        })
        .await?;

        self.observe(json_response(response, "list children").await)
    }

    /// Follow an `@odata.nextLink`.
    pub async fn next_children(&self, next_link: &str) -> Result<ChildrenPage> {
        let response = send_authorized(&*self.credentials, "list children", |auth| {
            self.http.get(next_link).header(header::AUTHORIZATION, auth)
        })
        .await?;

        self.observe(json_response(response, "list children").await)
    }

    /// Download content, optionally a byte range.
    pub async fn download(&self, path: &LogicalPath, range: Option<ByteRange>) -> Result<ByteStream> {
        let url = self.item_url(path, "content");
        let response = send_authorized(&*self.credentials, "download item", |auth| {
            let mut request = self.http.get(&url).header(header::AUTHORIZATION, auth);
            if let Some(range) = range {
                request = request.header(header::RANGE, range.to_header());
            }
            request
        })
        .await?;

        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(stream_from_bytes(Bytes::new()));
        }
        if !response.status().is_success() {
            return self.observe(Err(error_from_response(response, "download item").await));
        }

        let stream = response
            .bytes_stream()
            .map(|result| result.map_err(|e| Error::Network(format!("Stream read error: {}", e))));
        Ok(Box::pin(stream))
    }

    /// Simple upload of a small file.
    pub async fn put_content(
        &self,
        path: &LogicalPath,
        data: Bytes,
        behavior: ConflictBehavior,
        if_match: Option<&str>,
    ) -> Result<DriveItem> {
        let url = self.item_url(path, "content");
        let response = send_authorized(&*self.credentials, "upload item", |auth| {
            let mut request = self
                .http
                .put(&url)
                .header(header::AUTHORIZATION, auth)
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .query(&[("@microsoft.graph.conflictBehavior", behavior.as_str())])
                .body(data.clone());
            if let Some(etag) = if_match {
                request = request.header(header::IF_MATCH, etag);
            }
            request
        })
        .await?;

        self.observe(json_response(response, "upload item").await)
    }

    /// Create an upload session; returns the pre-authorized upload URL.
    pub async fn create_upload_session(&self, path: &LogicalPath) -> Result<String> {
        let url = self.item_url(path, "createUploadSession");
        let body = serde_json::json!({
            "item": { "@microsoft.graph.conflictBehavior": ConflictBehavior::Replace.as_str() }
        });
        let response = send_authorized(&*self.credentials, "create upload session", |auth| {
            self.http
                .post(&url)
                .header(header::AUTHORIZATION, auth)
                .json(&body)
        })
        .await?;

        let session: UploadSession =
            self.observe(json_response(response, "create upload session").await)?;
        Ok(session.upload_url)
    }

    /// Send one fragment. The upload URL carries its own authorization.
    pub async fn upload_fragment(
        &self,
        upload_url: &str,
        data: Bytes,
        offset: u64,
        total_size: u64,
    ) -> Result<FragmentOutcome> {
        let len = data.len() as u64;
        if len == 0 {
            return Err(Error::InvalidInput("Empty upload fragment".to_string()));
        }
        let content_range = format!("bytes {}-{}/{}", offset, offset + len - 1, total_size);

        let response = self
            .http
            .put(upload_url)
            .header(header::CONTENT_LENGTH, len.to_string())
            .header(header::CONTENT_RANGE, content_range)
            .body(data)
            .send()
            .await
            .map_err(|e| transport_error("upload fragment", e))?;

        match response.status() {
            StatusCode::ACCEPTED => Ok(FragmentOutcome::Accepted),
            StatusCode::OK | StatusCode::CREATED => {
                let item = json_response(response, "upload fragment").await?;
                Ok(FragmentOutcome::Complete(item))
            }
            _ => self.observe(Err(error_from_response(response, "upload fragment").await)),
        }
    }

    /// Cancel an upload session. Expired sessions are already gone.
    pub async fn cancel_upload_session(&self, upload_url: &str) -> Result<()> {
        let response = self
            .http
            .delete(upload_url)
            .send()
            .await
            .map_err(|e| transport_error("cancel upload session", e))?;

        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(error_from_response(response, "cancel upload session").await)
        }
    }

    pub async fn delete_item(&self, path: &LogicalPath) -> Result<()> {
        let url = self.item_url(path, "");
        let response = send_authorized(&*self.credentials, "delete item", |auth| {
            self.http.delete(&url).header(header::AUTHORIZATION, auth)
        })
        .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            self.observe(Err(error_from_response(response, "delete item").await))
        }
    }

    /// Move and/or rename an item under a new parent id.
    pub async fn move_item(
        &self,
        from: &LogicalPath,
        new_parent_id: &str,
        new_name: &str,
    ) -> Result<DriveItem> {
        let url = self.item_url(from, "");
        let body = serde_json::json!({
            "name": new_name,
            "parentReference": { "id": new_parent_id },
        });
        let response = send_authorized(&*self.credentials, "move item", |auth| {
            self.http
                .patch(&url)
                .header(header::AUTHORIZATION, auth)
                .query(&[("@microsoft.graph.conflictBehavior", "fail")])
                .json(&body)
        })
        .await?;

        self.observe(json_response(response, "move item").await)
    }

    /// Create a folder inside `parent`.
    pub async fn create_folder(&self, parent: &LogicalPath, name: &str) -> Result<DriveItem> {
        let url = self.item_url(parent, "children");
        let body = serde_json::json!({
            "name": name,
            "folder": {},
            "@microsoft.graph.conflictBehavior": "fail",
        });
        let response = send_authorized(&*self.credentials, "create folder", |auth| {
            self.http
                .post(&url)
                .header(header::AUTHORIZATION, auth)
                .json(&body)
        })
        .await?;

        self.observe(json_response(response, "create folder").await)
    }

    /// Create an anonymous view link.
    pub async fn create_link(
        &self,
        path: &LogicalPath,
        expires_at: DateTime<Utc>,
    ) -> Result<(String, Option<DateTime<Utc>>)> {
        let url = self.item_url(path, "createLink");
        let body = serde_json::json!({
            "type": "view",
            "scope": "anonymous",
            "expirationDateTime": expires_at.to_rfc3339(),
        });
        let response = send_authorized(&*self.credentials, "create link", |auth| {
            self.http
                .post(&url)
                .header(header::AUTHORIZATION, auth)
                .json(&body)
        })
        .await?;

        let permission: Permission = self.observe(json_response(response, "create link").await)?;
        Ok((permission.link.web_url, permission.expiration_date_time))
    }
}
