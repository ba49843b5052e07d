//! S3 REST API client.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, Method, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use storegate_common::{ByteRange, CredentialSecret, Error, LogicalPath, Result};

use super::sigv4::{encode_key, sha256_hex, uri_encode, Signer, SigningKeys};
use super::xml::{self, CompleteMultipartUploadResult, InitiateMultipartUploadResult, ListBucketResult};
use super::S3Settings;
use crate::http::{build_client, error_from_response, transport_error, RateSignalCell};
use crate::provider::{CredentialSource, RateLimitSignal};

/// Conditional write header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    None,
    /// `If-None-Match: *`: fail if the key exists.
    IfAbsent,
    /// `If-Match: <etag>`.
    IfMatch(String),
}

/// Metadata returned by HEAD.
#[derive(Debug, Clone)]
pub struct ObjectHead {
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: DateTime<Utc>,
}

struct S3Request<'a> {
    method: Method,
    key: &'a str,
    query: Vec<(&'a str, String)>,
    headers: Vec<(String, String)>,
    body: Bytes,
    context: &'a str,
}

impl<'a> S3Request<'a> {
    fn new(method: Method, key: &'a str, context: &'a str) -> Self {
        Self {
            method,
            key,
            query: Vec::new(),
            headers: Vec::new(),
            body: Bytes::new(),
            context,
        }
    }

    fn query(mut self, key: &'a str, value: impl Into<String>) -> Self {
        self.query.push((key, value.into()));
        self
    }

    fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    fn body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }
}

/// S3 API client bound to one bucket.
pub struct S3Client {
    http: Client,
    bucket: String,
    settings: S3Settings,
    endpoint: Url,
    /// Normalized key prefix ("" or "dir/sub/").
    prefix: String,
    signer: Signer,
    credentials: Arc<dyn CredentialSource>,
    signal: RateSignalCell,
}

impl S3Client {
    /// Create a new S3 client.
    ///
    /// # Errors
    /// - `InvalidInput` if the bucket is empty or the endpoint is not a URL
    pub fn new(
        bucket: String,
        settings: S3Settings,
        credentials: Arc<dyn CredentialSource>,
    ) -> Result<Self> {
        if bucket.trim().is_empty() {
            return Err(Error::InvalidInput("S3 source requires a bucket".to_string()));
        }

        let endpoint = match &settings.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://s3.{}.amazonaws.com", settings.region),
        };
        let endpoint = Url::parse(&endpoint)
            .map_err(|e| Error::InvalidInput(format!("Invalid S3 endpoint: {}", e)))?;

        let prefix = settings
            .prefix
            .as_deref()
            .map(|p| p.trim_matches('/'))
            .filter(|p| !p.is_empty())
            .map(|p| format!("{}/", p))
            .unwrap_or_default();

        Ok(Self {
            http: build_client(None)?,
            signer: Signer::new(settings.region.clone()),
            bucket,
            settings,
            endpoint,
            prefix,
            credentials,
            signal: RateSignalCell::new(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn rate_limit_signal(&self) -> Option<RateLimitSignal> {
        self.signal.current()
    }

    /// Object key for a file path.
    pub fn object_key(&self, path: &LogicalPath) -> String {
        format!("{}{}", self.prefix, path.native_relative())
    }

    /// Key prefix for the contents of a folder (also its marker object key).
    pub fn folder_key(&self, path: &LogicalPath) -> String {
        if path.is_root() {
            self.prefix.clone()
        } else {
            format!("{}{}/", self.prefix, path.native_relative())
        }
    }

    /// Logical path for an object key or common prefix.
    ///
    /// # Errors
    /// - `InvalidInput` for keys with empty segments (`a//b`), which no
    ///   logical path can address
    pub fn path_for_key(&self, key: &str) -> Result<LogicalPath> {
        let relative = key.strip_prefix(self.prefix.as_str()).unwrap_or(key);
        let relative = relative.strip_suffix('/').unwrap_or(relative);
        if relative.is_empty() {
            return Ok(LogicalPath::root());
        }
        relative
            .split('/')
            .try_fold(LogicalPath::root(), |path, name| path.join_native(name))
    }

    /// Build the URL for a key, honouring the addressing style.
    pub fn object_url(&self, key: &str, query: &[(&str, String)]) -> Result<Url> {
        let encoded = encode_key(key);
        let base = self.endpoint.as_str().trim_end_matches('/');

        let raw = if self.settings.path_style {
            format!("{}/{}/{}", base, self.bucket, encoded)
        } else {
            let host = self
                .endpoint
                .host_str()
                .ok_or_else(|| Error::InvalidInput("S3 endpoint has no host".to_string()))?;
            let authority = match self.endpoint.port() {
                Some(port) => format!("{}.{}:{}", self.bucket, host, port),
                None => format!("{}.{}", self.bucket, host),
            };
            format!("{}://{}/{}", self.endpoint.scheme(), authority, encoded)
        };

        let mut url = Url::parse(&raw)
            .map_err(|e| Error::InvalidInput(format!("Invalid object URL: {}", e)))?;
        if !query.is_empty() {
            let query = query
                .iter()
                .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
                .collect::<Vec<_>>()
                .join("&");
            url.set_query(Some(&query));
        }
        Ok(url)
    }

    async fn send(&self, request: S3Request<'_>) -> Result<Response> {
        let url = self.object_url(request.key, &request.query)?;
        let credential = self.credentials.credential().await?;

        let mut headers = request.headers;
        match &credential.secret {
            CredentialSecret::AccessKey {
                access_key_id,
                secret_access_key,
                session_token,
            } => {
                let keys = SigningKeys {
                    access_key_id,
                    secret_access_key: secret_access_key.expose(),
                    session_token: session_token.as_ref().map(|t| t.expose()),
                };
                let signed = self.signer.sign(
                    &keys,
                    request.method.as_str(),
                    &url,
                    &headers,
                    &sha256_hex(&request.body),
                    Utc::now(),
                )?;
                headers.extend(signed);
            }
            CredentialSecret::Anonymous => {}
            CredentialSecret::OAuth { .. } => {
                return Err(Error::Authentication(
                    "S3 sources require an access key credential".to_string(),
                ));
            }
        }

        let mut builder = self.http.request(request.method, url);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        builder
            .send()
            .await
            .map_err(|e| transport_error(request.context, e))
    }

    /// Send and require a success status.
    async fn execute(&self, request: S3Request<'_>) -> Result<Response> {
        let context = request.context;
        let response = self.send(request).await?;
        if response.status().is_success() {
            return Ok(response);
        }
        let err = error_from_response(response, context).await;
        self.signal.observe(&err);
        Err(err)
    }

    async fn text(response: Response, context: &str) -> Result<String> {
        response
            .text()
            .await
            .map_err(|e| transport_error(context, e))
    }

    /// ListObjectsV2.
    pub async fn list_objects(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        continuation_token: Option<&str>,
        max_keys: u32,
    ) -> Result<ListBucketResult> {
        let mut request = S3Request::new(Method::GET, "", "list objects")
            .query("list-type", "2")
            .query("max-keys", max_keys.clamp(1, 1000).to_string())
            .query("prefix", prefix);
        if let Some(delimiter) = delimiter {
            request = request.query("delimiter", delimiter);
        }
        if let Some(token) = continuation_token {
            request = request.query("continuation-token", token);
        }

        let response = self.execute(request).await?;
        let body = Self::text(response, "list objects").await?;
        xml::parse(&body, "object listing")
    }

    /// HEAD an object; `None` if it does not exist.
    pub async fn head_object(&self, key: &str) -> Result<Option<ObjectHead>> {
        let response = self
            .send(S3Request::new(Method::HEAD, key, "head object"))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let err = error_from_response(response, "head object").await;
            self.signal.observe(&err);
            return Err(err);
        }

        let headers = response.headers();
        let size = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let etag = headers
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let last_modified = headers
            .get(header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(Some(ObjectHead {
            size,
            etag,
            last_modified,
        }))
    }

    /// GET an object, optionally a byte range. `None` if the range is unsatisfiable.
    pub async fn get_object(&self, key: &str, range: Option<ByteRange>) -> Result<Option<Response>> {
        let mut request = S3Request::new(Method::GET, key, "get object");
        if let Some(range) = range {
            request = request.header("range", range.to_header());
        }
        let response = self.send(request).await?;
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(None);
        }
        if !response.status().is_success() {
            let err = error_from_response(response, "get object").await;
            self.signal.observe(&err);
            return Err(err);
        }
        Ok(Some(response))
    }

    /// PUT an object; returns its ETag.
    pub async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        precondition: &Precondition,
    ) -> Result<Option<String>> {
        let mut request = S3Request::new(Method::PUT, key, "put object")
            .header("content-length", body.len().to_string())
            .body(body);
        request = match precondition {
            Precondition::None => request,
            Precondition::IfAbsent => request.header("if-none-match", "*"),
            Precondition::IfMatch(etag) => request.header("if-match", etag.clone()),
        };

        let response = self.execute(request).await?;
        Ok(etag_of(&response))
    }

    /// Server-side copy within the bucket.
    pub async fn copy_object(&self, source_key: &str, dest_key: &str) -> Result<()> {
        let source = format!("/{}/{}", self.bucket, encode_key(source_key));
        let request = S3Request::new(Method::PUT, dest_key, "copy object")
            .header("x-amz-copy-source", source);
        let response = self.execute(request).await?;
        let body = Self::text(response, "copy object").await?;
        check_embedded_error(&body, "copy object")
    }

    pub async fn delete_object(&self, key: &str) -> Result<()> {
        self.execute(S3Request::new(Method::DELETE, key, "delete object"))
            .await?;
        Ok(())
    }

    /// Initiate a multipart upload; returns the UploadId.
    pub async fn create_multipart_upload(&self, key: &str) -> Result<String> {
        let request =
            S3Request::new(Method::POST, key, "create multipart upload").query("uploads", "");
        let response = self.execute(request).await?;
        let body = Self::text(response, "create multipart upload").await?;
        let result: InitiateMultipartUploadResult = xml::parse(&body, "initiate result")?;
        if result.upload_id.is_empty() {
            return Err(Error::Unknown("No UploadId in response".to_string()));
        }
        Ok(result.upload_id)
    }

    /// Upload one part; `part_number` is 1-based. Returns the part ETag.
    pub async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String> {
        let request = S3Request::new(Method::PUT, key, "upload part")
            .query("partNumber", part_number.to_string())
            .query("uploadId", upload_id)
            .header("content-length", body.len().to_string())
            .body(body);
        let response = self.execute(request).await?;
        etag_of(&response).ok_or_else(|| Error::Unknown("No ETag for uploaded part".to_string()))
    }

    /// Complete a multipart upload from `(part_number, etag)` pairs.
    pub async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[(u32, String)],
    ) -> Result<Option<String>> {
        let request = S3Request::new(Method::POST, key, "complete multipart upload")
            .query("uploadId", upload_id)
            .header("content-type", "application/xml")
            .body(Bytes::from(xml::complete_multipart_body(parts)));
        let response = self.execute(request).await?;
        let body = Self::text(response, "complete multipart upload").await?;
        check_embedded_error(&body, "complete multipart upload")?;
        let result: CompleteMultipartUploadResult = xml::parse(&body, "complete result")?;
        Ok(result.etag)
    }

    /// Abort a multipart upload. Unknown uploads are ignored.
    pub async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        let request = S3Request::new(Method::DELETE, key, "abort multipart upload")
            .query("uploadId", upload_id);
        match self.execute(request).await {
            Ok(_) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Presigned GET URL for a key.
    pub async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<Url> {
        let url = self.object_url(key, &[])?;
        let credential = self.credentials.credential().await?;
        match &credential.secret {
            CredentialSecret::AccessKey {
                access_key_id,
                secret_access_key,
                session_token,
            } => {
                let keys = SigningKeys {
                    access_key_id,
                    secret_access_key: secret_access_key.expose(),
                    session_token: session_token.as_ref().map(|t| t.expose()),
                };
                self.signer.presign(&keys, "GET", &url, expires_in, Utc::now())
            }
            // Public buckets need no signature.
            CredentialSecret::Anonymous => Ok(url),
            CredentialSecret::OAuth { .. } => Err(Error::Authentication(
                "S3 sources require an access key credential".to_string(),
            )),
        }
    }
}

fn etag_of(response: &Response) -> Option<String> {
    response
        .headers()
        .get(header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

fn check_embedded_error(body: &str, context: &str) -> Result<()> {
    match xml::embedded_error(body) {
        Some(err) => {
            let message = format!("{}: {} - {}", context, err.code, err.message);
            Err(match err.code.as_str() {
                "SlowDown" => Error::throttled(message),
                "InternalError" | "ServiceUnavailable" => Error::Unavailable(message),
                "NoSuchKey" | "NoSuchUpload" => Error::NotFound(message),
                "InvalidPart" | "InvalidPartOrder" => Error::InvalidInput(message),
                _ => Error::Unknown(message),
            })
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::StaticCredentials;
    use storegate_common::Credential;

    fn client(settings: S3Settings) -> S3Client {
        S3Client::new(
            "photos".to_string(),
            settings,
            Arc::new(StaticCredentials::new(Credential::anonymous())),
        )
        .unwrap()
    }

    #[test]
    fn test_object_url_path_style() {
        let client = client(S3Settings {
            endpoint: Some("http://localhost:9000/".to_string()),
            path_style: true,
            ..S3Settings::default()
        });
        let url = client.object_url("2024/a b.jpg", &[]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:9000/photos/2024/a%20b.jpg");
    }

    #[test]
    fn test_object_url_virtual_hosted() {
        let client = client(S3Settings {
            region: "eu-west-1".to_string(),
            ..S3Settings::default()
        });
        let url = client
            .object_url("", &[("list-type", "2".to_string()), ("prefix", "a/".to_string())])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://photos.s3.eu-west-1.amazonaws.com/?list-type=2&prefix=a%2F"
        );
    }

    #[test]
    fn test_keys_with_prefix() {
        let client = client(S3Settings {
            prefix: Some("/tenants/acme/".to_string()),
            ..S3Settings::default()
        });
        let path = LogicalPath::parse("/docs/a.txt").unwrap();
        assert_eq!(client.object_key(&path), "tenants/acme/docs/a.txt");
        assert_eq!(
            client.folder_key(&LogicalPath::parse("/docs").unwrap()),
            "tenants/acme/docs/"
        );
        assert_eq!(client.folder_key(&LogicalPath::root()), "tenants/acme/");
        assert_eq!(
            client.path_for_key("tenants/acme/docs/").unwrap(),
            LogicalPath::parse("/docs").unwrap()
        );
    }

    #[test]
    fn test_keys_with_unusual_names() {
        let client = client(S3Settings::default());

        let dotted = client.path_for_key("a/../b\\c").unwrap();
        assert_eq!(dotted.to_string_path(), "/a/%2E%2E/b%5Cc");
        assert_eq!(client.object_key(&dotted), "a/../b\\c");

        let percent = client.path_for_key("100%/x").unwrap();
        assert_eq!(client.object_key(&percent), "100%/x");
        assert_eq!(client.folder_key(&percent.parent().unwrap()), "100%/");

        assert!(client.path_for_key("a//b").is_err());
    }

    #[test]
    fn test_empty_bucket_rejected() {
        let result = S3Client::new(
            " ".to_string(),
            S3Settings::default(),
            Arc::new(StaticCredentials::new(Credential::anonymous())),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_embedded_error_classification() {
        let body = "<Error><Code>SlowDown</Code><Message>Reduce your request rate</Message></Error>";
        let err = check_embedded_error(body, "complete").unwrap_err();
        assert!(err.is_retryable());
        assert!(check_embedded_error("<CopyObjectResult/>", "copy").is_ok());
    }

    #[tokio::test]
    async fn test_presign_anonymous_is_plain_url() {
        let client = client(S3Settings::default());
        let url = client
            .presign_get("a.txt", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(url.query().is_none());
    }
}
