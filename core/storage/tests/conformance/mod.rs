//! Behaviour every storage adapter must share.
//!
//! Each check works beneath `root`, which must be an existing, empty folder.

use bytes::Bytes;
use std::collections::HashSet;
use std::time::Duration;

use storegate_common::{ByteRange, ErrorKind, LogicalPath};
use storegate_storage::{
    collect_stream, PartLimits, PartUpload, StorageAdapter, WriteOptions,
};

fn child(root: &LogicalPath, name: &str) -> LogicalPath {
    root.join(name).unwrap()
}

fn payload(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

pub async fn stat_and_read_agree(adapter: &dyn StorageAdapter, root: &LogicalPath) {
    let path = child(root, "agree.bin");
    let data = payload(4096);
    adapter
        .write(&path, data.clone(), &WriteOptions::create_new())
        .await
        .unwrap();

    let entry = adapter.stat(&path).await.unwrap();
    let read = collect_stream(adapter.read(&path, None).await.unwrap())
        .await
        .unwrap();
    assert_eq!(entry.size, Some(read.len() as u64));
    assert_eq!(read, data);
    assert_eq!(entry.path, path);
    assert!(!entry.is_folder());
}

pub async fn ranged_read(adapter: &dyn StorageAdapter, root: &LogicalPath) {
    let path = child(root, "range.txt");
    adapter
        .write(&path, Bytes::from_static(b"0123456789"), &WriteOptions::create_new())
        .await
        .unwrap();

    let middle = collect_stream(
        adapter
            .read(&path, Some(ByteRange::new(2, Some(3))))
            .await
            .unwrap(),
    )
    .await
    .unwrap();
    assert_eq!(&middle[..], b"234");

    let tail = collect_stream(adapter.read(&path, Some(ByteRange::from_offset(7))).await.unwrap())
        .await
        .unwrap();
    assert_eq!(&tail[..], b"789");
}

pub async fn create_new_conflicts(adapter: &dyn StorageAdapter, root: &LogicalPath) {
    let path = child(root, "once.txt");
    adapter
        .write(&path, Bytes::from_static(b"first"), &WriteOptions::create_new())
        .await
        .unwrap();

    let err = adapter
        .write(&path, Bytes::from_static(b"second"), &WriteOptions::create_new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    adapter
        .write(&path, Bytes::from_static(b"third"), &WriteOptions::overwrite())
        .await
        .unwrap();
    let data = collect_stream(adapter.read(&path, None).await.unwrap())
        .await
        .unwrap();
    assert_eq!(&data[..], b"third");
}

pub async fn missing_paths_are_not_found(adapter: &dyn StorageAdapter, root: &LogicalPath) {
    let path = child(root, "does-not-exist");
    assert_eq!(adapter.stat(&path).await.unwrap_err().kind(), ErrorKind::NotFound);
    assert!(matches!(
        adapter.read(&path, None).await.map(|_| ()).unwrap_err().kind(),
        ErrorKind::NotFound
    ));
    assert_eq!(adapter.delete(&path).await.unwrap_err().kind(), ErrorKind::NotFound);
}

pub async fn paging_visits_every_child_once(adapter: &dyn StorageAdapter, root: &LogicalPath) {
    let folder = child(root, "paged");
    adapter.create_folder(&folder).await.unwrap();
    let mut expected = HashSet::new();
    for i in 0..7 {
        let name = format!("file-{}.txt", i);
        adapter
            .write(&child(&folder, &name), Bytes::from(name.clone()), &WriteOptions::create_new())
            .await
            .unwrap();
        expected.insert(name);
    }

    let mut seen = HashSet::new();
    let mut token: Option<String> = None;
    loop {
        let page = adapter.list(&folder, token.as_deref(), 3).await.unwrap();
        assert!(page.entries.len() <= 3);
        for entry in page.entries {
            assert!(seen.insert(entry.name.clone()), "duplicate {}", entry.name);
        }
        match page.next_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }
    assert_eq!(seen, expected);
}

pub async fn folders_delete_only_when_empty(adapter: &dyn StorageAdapter, root: &LogicalPath) {
    let folder = child(root, "nonempty");
    adapter.create_folder(&folder).await.unwrap();
    let inner = child(&folder, "inner.txt");
    adapter
        .write(&inner, Bytes::from_static(b"x"), &WriteOptions::create_new())
        .await
        .unwrap();

    assert_eq!(adapter.delete(&folder).await.unwrap_err().kind(), ErrorKind::Conflict);
    assert_eq!(
        adapter.create_folder(&folder).await.unwrap_err().kind(),
        ErrorKind::Conflict
    );

    adapter.delete(&inner).await.unwrap();
    adapter.delete(&folder).await.unwrap();
    assert_eq!(adapter.stat(&folder).await.unwrap_err().kind(), ErrorKind::NotFound);
}

pub async fn rename_respects_overwrite(adapter: &dyn StorageAdapter, root: &LogicalPath) {
    let a = child(root, "a.txt");
    let b = child(root, "b.txt");
    adapter
        .write(&a, Bytes::from_static(b"aaa"), &WriteOptions::create_new())
        .await
        .unwrap();
    adapter
        .write(&b, Bytes::from_static(b"bbb"), &WriteOptions::create_new())
        .await
        .unwrap();

    assert_eq!(
        adapter.rename(&a, &b, false).await.unwrap_err().kind(),
        ErrorKind::Conflict
    );

    let moved = adapter.rename(&a, &b, true).await.unwrap();
    assert_eq!(moved.path, b);
    assert_eq!(adapter.stat(&a).await.unwrap_err().kind(), ErrorKind::NotFound);
    let data = collect_stream(adapter.read(&b, None).await.unwrap())
        .await
        .unwrap();
    assert_eq!(&data[..], b"aaa");
}

pub async fn multipart_round_trip(adapter: &dyn StorageAdapter, root: &LogicalPath) {
    let limits = adapter.part_limits();
    let part_size = limits.negotiate(limits.min_part_size.max(1024), None);
    let total = part_size * 2 + 100;
    let data = payload(total as usize);
    let path = child(root, "multi.bin");

    let upload = adapter
        .begin_multipart(&path, Some(total), part_size)
        .await
        .unwrap();
    let count = PartLimits::part_count(total, part_size);
    let mut receipts = Vec::new();
    for index in 0..count {
        let offset = u64::from(index) * part_size;
        let end = (offset + part_size).min(total);
        let part = PartUpload {
            index,
            offset,
            data: data.slice(offset as usize..end as usize),
            is_last: index + 1 == count,
        };
        receipts.push(adapter.upload_part(&upload, &part).await.unwrap());
    }

    let entry = adapter.complete_multipart(&upload, &receipts).await.unwrap();
    assert_eq!(entry.size, Some(total));
    let read = collect_stream(adapter.read(&path, None).await.unwrap())
        .await
        .unwrap();
    assert_eq!(read, data);
}

pub async fn abort_is_idempotent(adapter: &dyn StorageAdapter, root: &LogicalPath) {
    let limits = adapter.part_limits();
    let part_size = limits.negotiate(limits.min_part_size.max(1024), None);
    let path = child(root, "aborted.bin");

    let upload = adapter
        .begin_multipart(&path, Some(part_size * 2), part_size)
        .await
        .unwrap();
    adapter.abort_multipart(&upload).await.unwrap();
    adapter.abort_multipart(&upload).await.unwrap();
    assert_eq!(adapter.stat(&path).await.unwrap_err().kind(), ErrorKind::NotFound);
}

pub async fn share_link_for_file(adapter: &dyn StorageAdapter, root: &LogicalPath) {
    let path = child(root, "shared.txt");
    adapter
        .write(&path, Bytes::from_static(b"public"), &WriteOptions::create_new())
        .await
        .unwrap();

    let link = adapter
        .share_link(&path, Duration::from_secs(3600))
        .await
        .unwrap();
    assert!(!link.url.is_empty());
}

/// Run every check, each in its own subfolder of `root`.
pub async fn run_all(adapter: &dyn StorageAdapter, root: &LogicalPath) {
    macro_rules! check {
        ($name:ident) => {{
            let scratch = child(root, stringify!($name));
            adapter.create_folder(&scratch).await.unwrap();
            $name(adapter, &scratch).await;
        }};
    }

    check!(stat_and_read_agree);
    check!(ranged_read);
    check!(create_new_conflicts);
    check!(missing_paths_are_not_found);
    check!(paging_visits_every_child_once);
    check!(folders_delete_only_when_empty);
    check!(rename_respects_overwrite);
    check!(multipart_round_trip);
    check!(abort_is_idempotent);
    check!(share_link_for_file);
}
