//! Integration tests for the metadata cache and the changes poller

use std::sync::Arc;
use std::time::Duration;

use ::common::metadata::{ChangesPoller, MetadataCache, MetadataStore};
use ::common::testkit::{file, folder, FakeDrive};

struct Env {
    cache: MetadataCache,
    poller: ChangesPoller,
    drive: Arc<FakeDrive>,
    _dir: tempfile::TempDir,
}

async fn setup() -> Env {
    let dir = tempfile::TempDir::new().unwrap();
    let store = MetadataStore::open(&dir.path().join("cache.db"))
        .await
        .unwrap();
    let drive = Arc::new(FakeDrive::with_root("root-id"));
    let cache = MetadataCache::new(store.clone(), drive.clone());
    let poller = ChangesPoller::new(store, drive.clone(), Duration::from_secs(60));
    Env {
        cache,
        poller,
        drive,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_initial_pass_builds_tree() {
    let env = setup().await;
    env.drive.push_page(
        "1",
        vec![
            FakeDrive::updated(folder("a", "A", "root-id")),
            FakeDrive::updated(folder("b", "B", "root-id")),
            FakeDrive::updated(file("f1", "old", "a", 10)),
        ],
        None,
        Some("10"),
    );

    let root = env.cache.resolve_root("root").await.unwrap();
    env.poller.poll().await.unwrap();

    let names: Vec<String> = env
        .cache
        .list(&root.object_id)
        .await
        .unwrap()
        .into_iter()
        .map(|o| o.name)
        .collect();
    assert_eq!(names, vec!["A", "B"]);
    assert_eq!(env.cache.lookup("a", "old").await.unwrap().size, 10);
}

#[tokio::test]
async fn test_rename_then_lookup() {
    let env = setup().await;
    for object in [
        folder("a", "A", "root-id"),
        folder("b", "B", "root-id"),
        file("f1", "old", "a", 10),
    ] {
        env.drive.insert(object.clone());
        env.cache.store().update(&object).await.unwrap();
    }

    env.cache.rename("f1", "a", "b", "new").await.unwrap();

    assert!(env.cache.lookup("a", "old").await.unwrap_err().is_not_found());
    let moved = env.cache.lookup("b", "new").await.unwrap();
    assert_eq!(moved.object_id, "f1");
    assert_eq!(moved.parents, vec!["b".to_string()]);
}

#[tokio::test]
async fn test_removed_change_clears_both_tables() {
    let env = setup().await;
    env.drive.push_page(
        "1",
        vec![FakeDrive::updated(file("f1", "a.txt", "root-id", 1))],
        None,
        Some("2"),
    );
    env.poller.poll().await.unwrap();
    assert!(env.cache.get("f1").await.is_ok());

    env.drive
        .push_page("2", vec![FakeDrive::removed("f1")], None, Some("3"));
    env.poller.poll().await.unwrap();

    let store = env.cache.store();
    assert!(env.cache.get("f1").await.unwrap_err().is_not_found());
    assert!(env
        .cache
        .lookup("root-id", "a.txt")
        .await
        .unwrap_err()
        .is_not_found());
    assert!(store.index_entries().await.unwrap().is_empty());
    assert_eq!(store.page_token().await.unwrap().as_deref(), Some("3"));
}

#[tokio::test]
async fn test_local_mkdir_survives_replay() {
    let env = setup().await;
    let created = env.cache.mkdir("root-id", "new-dir").await.unwrap();

    // the feed later reports the same folder
    env.drive.push_page(
        "1",
        vec![FakeDrive::updated(created.clone())],
        None,
        Some("2"),
    );
    env.poller.poll().await.unwrap();

    assert_eq!(
        env.cache.lookup("root-id", "new-dir").await.unwrap(),
        created
    );
    assert_eq!(env.cache.list("root-id").await.unwrap().len(), 1);
}
