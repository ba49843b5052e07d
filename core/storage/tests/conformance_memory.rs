//! Adapter conformance against the in-memory adapter, plus fault injection.

mod conformance;

use bytes::Bytes;
use std::time::Duration;

use storegate_common::{ErrorKind, LogicalPath};
use storegate_storage::{
    Fault, MemoryAdapter, Operation, PartLimits, PartUpload, StorageAdapter, WriteOptions,
};

#[tokio::test]
async fn test_memory_adapter_conformance() {
    let adapter = MemoryAdapter::new();
    conformance::run_all(&adapter, &LogicalPath::root()).await;
}

#[tokio::test]
async fn test_sequential_memory_adapter_conformance() {
    let adapter = MemoryAdapter::new().with_limits(PartLimits {
        min_part_size: 256 * 1024,
        max_part_size: 4 * 1024 * 1024,
        max_parts: u32::MAX,
        alignment: 256 * 1024,
        independent_parts: false,
        simple_upload_limit: 1024 * 1024,
    });
    conformance::run_all(&adapter, &LogicalPath::root()).await;
}

#[tokio::test]
async fn test_injected_faults_are_consumed_in_order() {
    let adapter = MemoryAdapter::new();
    let path = LogicalPath::parse("/f.txt").unwrap();
    adapter.seed_file(&path, Bytes::from_static(b"data"));
    adapter.fail_next(
        Operation::Stat,
        [Fault::Unavailable, Fault::Throttled(Some(Duration::from_secs(2)))],
    );

    assert_eq!(adapter.stat(&path).await.unwrap_err().kind(), ErrorKind::Unavailable);
    assert_eq!(adapter.stat(&path).await.unwrap_err().kind(), ErrorKind::Throttled);
    assert!(adapter.rate_limit_signal().is_some());
    assert_eq!(adapter.stat(&path).await.unwrap().size, Some(4));
    assert_eq!(adapter.calls(Operation::Stat), 3);
}

#[tokio::test]
async fn test_expired_page_token_is_invalid_cursor() {
    let adapter = MemoryAdapter::new();
    for i in 0..4 {
        adapter.seed_file(&LogicalPath::parse(&format!("/d/{}.txt", i)).unwrap(), "x");
    }
    let folder = LogicalPath::parse("/d").unwrap();
    let first = adapter.list(&folder, None, 2).await.unwrap();
    let token = first.next_token.unwrap();

    adapter.expire_page_tokens();
    let err = adapter.list(&folder, Some(&token), 2).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidCursor);
}

#[tokio::test]
async fn test_sequential_parts_reject_gaps() {
    let adapter = MemoryAdapter::new().with_limits(PartLimits {
        independent_parts: false,
        ..MemoryAdapter::DEFAULT_LIMITS
    });
    let path = LogicalPath::parse("/seq.bin").unwrap();
    let upload = adapter.begin_multipart(&path, Some(8), 4).await.unwrap();

    let skipped = PartUpload {
        index: 1,
        offset: 4,
        data: Bytes::from_static(b"5678"),
        is_last: true,
    };
    let err = adapter.upload_part(&upload, &skipped).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(adapter.pending_uploads(), 1);

    adapter.abort_multipart(&upload).await.unwrap();
    assert_eq!(adapter.pending_uploads(), 0);
}

#[tokio::test]
async fn test_write_into_missing_folder_is_not_found() {
    let adapter = MemoryAdapter::new();
    let err = adapter
        .write(
            &LogicalPath::parse("/missing/file.txt").unwrap(),
            Bytes::from_static(b"x"),
            &WriteOptions::create_new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
