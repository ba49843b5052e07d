//! S3 XML response bodies.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use storegate_common::{Error, Result};

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ListBucketResult {
    pub contents: Vec<ObjectSummary>,
    pub common_prefixes: Vec<CommonPrefix>,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
    pub key_count: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ObjectSummary {
    pub key: String,
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(rename = "ETag")]
    pub etag: Option<String>,
    pub size: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct CommonPrefix {
    pub prefix: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct InitiateMultipartUploadResult {
    pub upload_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct CompleteMultipartUploadResult {
    #[serde(rename = "ETag")]
    pub etag: Option<String>,
}

/// Error document. S3 may return one with a 200 status on complete and copy.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ErrorDocument {
    pub code: String,
    pub message: String,
}

/// Parse an XML body into `T`.
pub fn parse<T: serde::de::DeserializeOwned>(body: &str, what: &str) -> Result<T> {
    quick_xml::de::from_str(body)
        .map_err(|e| Error::Serialization(format!("Failed to parse {}: {}", what, e)))
}

/// Detect an `<Error>` document inside a successful response body.
pub fn embedded_error(body: &str) -> Option<ErrorDocument> {
    let trimmed = body.trim_start();
    let root = trimmed
        .strip_prefix("<?xml")
        .and_then(|rest| rest.split_once("?>"))
        .map(|(_, rest)| rest.trim_start())
        .unwrap_or(trimmed);
    if root.starts_with("<Error>") || root.starts_with("<Error ") {
        parse::<ErrorDocument>(body, "error document").ok()
    } else {
        None
    }
}

/// Render the body of a CompleteMultipartUpload request.
pub fn complete_multipart_body(parts: &[(u32, String)]) -> String {
    let mut body = String::from("<CompleteMultipartUpload>");
    for (number, etag) in parts {
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            number,
            escape(etag)
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST_RESPONSE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>bucket</Name>
  <Prefix>photos/</Prefix>
  <KeyCount>3</KeyCount>
  <MaxKeys>2</MaxKeys>
  <Delimiter>/</Delimiter>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>1ueGcxLPRx1Tr</NextContinuationToken>
  <Contents>
    <Key>photos/</Key>
    <LastModified>2024-01-02T03:04:05.000Z</LastModified>
    <ETag>"d41d8cd98f00b204e9800998ecf8427e"</ETag>
    <Size>0</Size>
  </Contents>
  <Contents>
    <Key>photos/cat.jpg</Key>
    <LastModified>2024-01-02T03:04:05.000Z</LastModified>
    <ETag>"abc"</ETag>
    <Size>1024</Size>
  </Contents>
  <CommonPrefixes>
    <Prefix>photos/2024/</Prefix>
  </CommonPrefixes>
</ListBucketResult>"#;

    #[test]
    fn test_parse_list_result() {
        let result: ListBucketResult = parse(LIST_RESPONSE, "listing").unwrap();
        assert!(result.is_truncated);
        assert_eq!(result.next_continuation_token.as_deref(), Some("1ueGcxLPRx1Tr"));
        assert_eq!(result.contents.len(), 2);
        assert_eq!(result.contents[1].key, "photos/cat.jpg");
        assert_eq!(result.contents[1].size, 1024);
        assert_eq!(result.contents[1].etag.as_deref(), Some("\"abc\""));
        assert_eq!(result.common_prefixes.len(), 1);
        assert_eq!(result.common_prefixes[0].prefix, "photos/2024/");
    }

    #[test]
    fn test_parse_empty_list_result() {
        let body = r#"<ListBucketResult><KeyCount>0</KeyCount><IsTruncated>false</IsTruncated></ListBucketResult>"#;
        let result: ListBucketResult = parse(body, "listing").unwrap();
        assert!(result.contents.is_empty());
        assert!(result.common_prefixes.is_empty());
        assert!(!result.is_truncated);
    }

    #[test]
    fn test_parse_initiate() {
        let body = r#"<InitiateMultipartUploadResult><Bucket>b</Bucket><Key>k</Key><UploadId>VXBsb2FkSUQ</UploadId></InitiateMultipartUploadResult>"#;
        let result: InitiateMultipartUploadResult = parse(body, "initiate").unwrap();
        assert_eq!(result.upload_id, "VXBsb2FkSUQ");
    }

    #[test]
    fn test_embedded_error() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<Error><Code>InternalError</Code><Message>We encountered an internal error.</Message></Error>"#;
        let err = embedded_error(body).unwrap();
        assert_eq!(err.code, "InternalError");

        let ok = r#"<CompleteMultipartUploadResult><ETag>"x-2"</ETag></CompleteMultipartUploadResult>"#;
        assert!(embedded_error(ok).is_none());
    }

    #[test]
    fn test_complete_body() {
        let body = complete_multipart_body(&[(1, "\"a\"".to_string()), (2, "\"b\"".to_string())]);
        assert!(body.starts_with("<CompleteMultipartUpload><Part><PartNumber>1</PartNumber>"));
        assert!(body.contains("<ETag>&quot;b&quot;</ETag>"));
    }
}
