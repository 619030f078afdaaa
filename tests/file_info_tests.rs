#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use bucketfs::cache::fcache::CacheDir;
use bucketfs::cache::file_info::{FileInfo, FileInfoError, FileInfoKey, FileInfoStore};

fn info(object: &str, generation: i64, size: u64, offset: u64) -> FileInfo {
    FileInfo {
        key: FileInfoKey::new("bkt", object),
        object_generation: generation,
        file_size: size,
        offset,
    }
}

async fn write_local(store: &FileInfoStore, info: &FileInfo, len: usize) {
    let path = store.local_path(info).unwrap();
    tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
    tokio::fs::write(&path, vec![7u8; len]).await.unwrap();
}

async fn open_store(tmp: &tempfile::TempDir, max_weight: u64) -> FileInfoStore {
    let dir = CacheDir::open(tmp.path()).await.unwrap();
    FileInfoStore::new(max_weight, dir)
}

#[tokio::test]
async fn weight_is_the_downloaded_offset() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp, 100).await;

    store.insert(info("a", 1, 80, 10)).unwrap();
    store
        .update_offset(&FileInfoKey::new("bkt", "a"), 1, 80, 60)
        .unwrap();
    assert_eq!(store.cache().occupied_weight(), 60);
}

#[tokio::test]
async fn offset_past_size_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp, 100).await;

    let err = store.insert(info("a", 1, 10, 11)).unwrap_err();
    assert!(matches!(err, FileInfoError::OffsetBeyondSize { offset: 11, size: 10, .. }));
    assert!(store.cache().is_empty());
}

#[tokio::test]
async fn progress_of_another_generation_is_refused() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp, 100).await;
    let key = FileInfoKey::new("bkt", "a");

    store.insert(info("a", 2, 10, 0)).unwrap();
    let err = store.update_offset(&key, 1, 10, 5).unwrap_err();
    assert!(matches!(err, FileInfoError::Superseded { generation: 1, current: 2, .. }));
    assert_eq!(store.peek(&key).unwrap().object_generation, 2);
}

#[tokio::test]
async fn background_progress_does_not_promote() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp, 100).await;

    store.insert(info("a", 1, 50, 10)).unwrap();
    store.insert(info("b", 1, 50, 10)).unwrap();
    store
        .update_offset(&FileInfoKey::new("bkt", "a"), 1, 50, 50)
        .unwrap();

    // "a" grew but stayed least recent, so it is the one evicted.
    let evicted = store.insert(info("c", 1, 50, 50)).unwrap();
    assert_eq!(evicted.len(), 1);
    assert_eq!(evicted[0].key.object, "a");
}

#[tokio::test]
async fn discard_deletes_files_unless_downloading() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp, 100).await;
    let idle = info("idle", 1, 4, 4);
    let busy = info("busy", 1, 4, 4);
    write_local(&store, &idle, 4).await;
    write_local(&store, &busy, 4).await;

    store.mark_downloading(&busy.key, 1);
    store.discard(vec![idle.clone(), busy.clone()]).await;
    assert!(!store.local_path(&idle).unwrap().exists());
    assert!(store.local_path(&busy).unwrap().exists());

    store.finish_downloading(&busy.key, 1);
    assert!(!store.is_downloading(&busy.key, 1));
    store.discard(vec![busy.clone()]).await;
    assert!(!store.local_path(&busy).unwrap().exists());
}

#[tokio::test]
async fn download_pins_are_counted() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp, 100).await;
    let key = FileInfoKey::new("bkt", "a");

    store.mark_downloading(&key, 1);
    store.mark_downloading(&key, 1);
    store.finish_downloading(&key, 1);
    assert!(store.is_downloading(&key, 1));
    assert!(!store.is_downloading(&key, 2));
    store.finish_downloading(&key, 1);
    assert!(!store.is_downloading(&key, 1));
}

#[tokio::test]
async fn stale_generation_is_erased_with_its_file() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp, 100).await;
    let old = info("a", 1, 4, 4);
    store.insert(old.clone()).unwrap();
    write_local(&store, &old, 4).await;

    assert!(store.invalidate_stale(&old.key, 1).await.is_none());
    let erased = store.invalidate_stale(&old.key, 2).await.unwrap();
    assert_eq!(erased, old);
    assert!(store.peek(&old.key).is_none());
    assert!(!store.local_path(&old).unwrap().exists());
}

#[tokio::test]
async fn restore_keeps_trusted_entries_in_order() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp, 100).await;
    let a = info("a", 1, 10, 10);
    let b = info("dir/b", 3, 20, 5);
    let gone = info("gone", 1, 10, 10);
    let short = info("short", 1, 10, 10);
    for (i, len) in [(&a, 10), (&b, 20), (&short, 3)] {
        store.insert(i.clone()).unwrap();
        write_local(&store, i, len).await;
    }
    store.insert(gone.clone()).unwrap();
    let _ = store.look_up(&a.key);
    store.persist().await.unwrap();
    drop(store);

    let dir = CacheDir::open(tmp.path()).await.unwrap();
    let restored = FileInfoStore::restore(100, dir).await.unwrap();
    assert_eq!(restored.peek(&a.key), Some(a.clone()));
    assert_eq!(restored.peek(&b.key), Some(b.clone()));
    assert!(restored.peek(&gone.key).is_none(), "file never written");
    assert!(restored.peek(&short.key).is_none(), "file shorter than offset");
    assert!(!restored.local_path(&short).unwrap().exists());
    assert_eq!(
        restored.cache().keys(),
        [a.key.encode(), b.key.encode()]
    );
    assert_eq!(restored.cache().occupied_weight(), 15);
    restored.cache().check_invariants().unwrap();
}

#[tokio::test]
async fn restore_into_a_smaller_cache_evicts_least_recent() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp, 100).await;
    let old = info("old", 1, 30, 30);
    let new = info("new", 1, 30, 30);
    for i in [&old, &new] {
        store.insert(i.clone()).unwrap();
        write_local(&store, i, 30).await;
    }
    store.persist().await.unwrap();
    drop(store);

    let dir = CacheDir::open(tmp.path()).await.unwrap();
    let restored = FileInfoStore::restore(40, dir).await.unwrap();
    assert_eq!(restored.max_weight(), 40);
    assert!(restored.peek(&new.key).is_some());
    assert!(restored.peek(&old.key).is_none());
    assert!(!restored.local_path(&old).unwrap().exists());
}

#[tokio::test]
async fn corrupt_snapshot_starts_empty_and_clears_files() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp, 100).await;
    let a = info("a", 1, 4, 4);
    write_local(&store, &a, 4).await;
    tokio::fs::write(store.cache_dir().snapshot_path(), b"not a snapshot")
        .await
        .unwrap();
    drop(store);

    let dir = CacheDir::open(tmp.path()).await.unwrap();
    let restored = FileInfoStore::restore(100, dir).await.unwrap();
    assert!(restored.cache().is_empty());
    assert!(!restored.local_path(&a).unwrap().exists());
}

#[tokio::test]
async fn missing_snapshot_starts_empty() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = CacheDir::open(tmp.path()).await.unwrap();
    let restored = FileInfoStore::restore(100, dir).await.unwrap();
    assert!(restored.cache().is_empty());
}

#[tokio::test]
async fn restore_removes_files_no_record_points_at() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp, 100).await;
    let kept = info("dir/kept", 2, 8, 8);
    store.insert(kept.clone()).unwrap();
    write_local(&store, &kept, 8).await;
    store.persist().await.unwrap();

    // Written after the snapshot, or left behind by an older generation.
    let unsaved = info("unsaved", 1, 4, 4);
    let stale = info("dir/kept", 1, 8, 8);
    write_local(&store, &unsaved, 4).await;
    write_local(&store, &stale, 8).await;
    drop(store);

    let dir = CacheDir::open(tmp.path()).await.unwrap();
    let objects = dir.objects_root();
    let restored = FileInfoStore::restore(100, dir).await.unwrap();
    assert_eq!(restored.peek(&kept.key), Some(kept.clone()));
    assert!(restored.local_path(&kept).unwrap().exists());
    assert!(!restored.local_path(&unsaved).unwrap().exists());
    assert!(!restored.local_path(&stale).unwrap().exists());
    assert!(
        !objects.join("bkt").join("1").exists(),
        "emptied generation directories are pruned"
    );
}

#[tokio::test]
async fn untracked_files_are_removed_once_no_download_holds_them() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp, 100).await;
    let tracked = info("tracked", 1, 4, 4);
    let loose = info("loose", 1, 4, 4);
    store.insert(tracked.clone()).unwrap();
    write_local(&store, &tracked, 4).await;
    write_local(&store, &loose, 4).await;

    assert!(!store.remove_untracked(&tracked.key, 1).await);
    assert!(store.local_path(&tracked).unwrap().exists());

    store.mark_downloading(&loose.key, 1);
    assert!(!store.remove_untracked(&loose.key, 1).await);
    assert!(store.finish_downloading(&loose.key, 1));
    assert!(store.remove_untracked(&loose.key, 1).await);
    assert!(!store.local_path(&loose).unwrap().exists());

    // Another generation on record does not vouch for this one.
    let old = info("tracked", 0, 4, 4);
    write_local(&store, &old, 4).await;
    assert!(store.remove_untracked(&old.key, 0).await);
}
