use std::sync::Arc;

use super::MetadataStore;
use crate::drive::RemoteDrive;
use crate::error::{Error, Result};
use crate::object::{is_valid_name, Object};

/// Object lookups for the filesystem adapter, answered from the local store.
///
/// Namespace mutations call the remote API first and then apply the record it
/// returns, so the local index never runs ahead of the remote side.
#[derive(Clone)]
pub struct MetadataCache {
    store: MetadataStore,
    remote: Arc<dyn RemoteDrive>,
}

impl std::fmt::Debug for MetadataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataCache")
            .field("store", &self.store)
            .finish()
    }
}

impl MetadataCache {
    pub fn new(store: MetadataStore, remote: Arc<dyn RemoteDrive>) -> Self {
        Self { store, remote }
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn remote(&self) -> &Arc<dyn RemoteDrive> {
        &self.remote
    }

    pub async fn get(&self, object_id: &str) -> Result<Object> {
        self.store.get(object_id).await
    }

    pub async fn list(&self, parent_id: &str) -> Result<Vec<Object>> {
        self.store.list(parent_id).await
    }

    pub async fn lookup(&self, parent_id: &str, name: &str) -> Result<Object> {
        self.store.lookup(parent_id, name).await
    }

    /// Create a folder named `name` under `parent_id`.
    pub async fn mkdir(&self, parent_id: &str, name: &str) -> Result<Object> {
        check_name(name)?;
        let object = self.remote.create_folder(parent_id, name).await?;
        self.store.update(&object).await?;
        tracing::info!(object_id = %object.object_id, parent_id, name, "created folder");
        Ok(object)
    }

    /// Remove `object_id` from `parent_id`. An object with other parents is
    /// only detached; otherwise it is trashed when allowed.
    pub async fn remove(&self, object_id: &str, parent_id: &str) -> Result<()> {
        let object = self.store.get(object_id).await?;
        let detach_only = object.parents.iter().any(|p| p != parent_id) || !object.can_trash;

        if detach_only {
            let updated = self.remote.remove_parent(object_id, parent_id).await?;
            self.store.update(&updated).await?;
            tracing::info!(object_id, parent_id, "detached object from parent");
        } else {
            self.remote.trash(object_id).await?;
            self.store.delete(object_id).await?;
            tracing::info!(object_id, "trashed object");
        }
        Ok(())
    }

    /// Move and rename in one step.
    pub async fn rename(
        &self,
        object_id: &str,
        old_parent: &str,
        new_parent: &str,
        new_name: &str,
    ) -> Result<Object> {
        check_name(new_name)?;
        let object = self
            .remote
            .move_object(object_id, old_parent, new_parent, new_name)
            .await?;
        self.store.update(&object).await?;
        tracing::info!(object_id, old_parent, new_parent, new_name, "renamed object");
        Ok(object)
    }

    /// Resolve the mount root. `alias` may be a real object id already in the
    /// store or an alias such as `root`, which only the remote side can map.
    pub async fn resolve_root(&self, alias: &str) -> Result<Object> {
        if let Some(object) = self.store.try_get(alias).await? {
            return Ok(object);
        }
        let object = self.remote.get_object(alias).await?;
        if !object.is_dir {
            return Err(Error::InvalidConfig(format!(
                "root node {} is not a folder",
                alias
            )));
        }
        self.store.update(&object).await?;
        tracing::info!(alias, object_id = %object.object_id, "resolved root node");
        Ok(object)
    }

    /// Replace the local children of `parent_id` with a fresh remote listing.
    pub async fn sync_children(&self, parent_id: &str) -> Result<usize> {
        let children = self.remote.list_children(parent_id).await?;
        self.store.update_batch(&children).await?;
        tracing::debug!(parent_id, count = children.len(), "synced children");
        Ok(children.len())
    }
}

fn check_name(name: &str) -> Result<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(Error::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{file, folder, FakeDrive};

    async fn setup() -> (MetadataCache, Arc<FakeDrive>) {
        let drive = Arc::new(FakeDrive::with_root("root-id"));
        let store = MetadataStore::in_memory().await.unwrap();
        (MetadataCache::new(store, drive.clone()), drive)
    }

    async fn seed(cache: &MetadataCache, drive: &FakeDrive, object: Object) {
        drive.insert(object.clone());
        cache.store().update(&object).await.unwrap();
    }

    #[tokio::test]
    async fn test_rename_across_parents() {
        let (cache, drive) = setup().await;
        seed(&cache, &drive, folder("a", "A", "root-id")).await;
        seed(&cache, &drive, folder("b", "B", "root-id")).await;
        seed(&cache, &drive, file("f1", "old", "a", 5)).await;

        let moved = cache.rename("f1", "a", "b", "new").await.unwrap();
        assert_eq!(moved.parents, vec!["b".to_string()]);

        assert!(cache.lookup("a", "old").await.unwrap_err().is_not_found());
        let found = cache.lookup("b", "new").await.unwrap();
        assert_eq!(found.object_id, "f1");
        assert_eq!(found.parents, vec!["b".to_string()]);
        assert!(cache.list("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rename_rejects_separator() {
        let (cache, drive) = setup().await;
        seed(&cache, &drive, file("f1", "old", "root-id", 5)).await;

        let err = cache.rename("f1", "root-id", "root-id", "a/b").await.unwrap_err();
        assert!(matches!(err, Error::InvalidName(_)));
        assert_eq!(drive.object("f1").unwrap().name, "old");
    }

    #[tokio::test]
    async fn test_mkdir_indexes_new_folder() {
        let (cache, _drive) = setup().await;
        let created = cache.mkdir("root-id", "photos").await.unwrap();
        assert!(created.is_dir);
        assert_eq!(cache.lookup("root-id", "photos").await.unwrap(), created);

        assert!(matches!(
            cache.mkdir("root-id", "").await.unwrap_err(),
            Error::InvalidName(_)
        ));
    }

    #[tokio::test]
    async fn test_remove_trashes_single_parent_object() {
        let (cache, drive) = setup().await;
        seed(&cache, &drive, file("f1", "a.txt", "root-id", 5)).await;

        cache.remove("f1", "root-id").await.unwrap();
        assert_eq!(drive.trashed_ids(), vec!["f1".to_string()]);
        assert!(cache.get("f1").await.unwrap_err().is_not_found());
        assert!(cache.lookup("root-id", "a.txt").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_remove_detaches_shared_object() {
        let (cache, drive) = setup().await;
        let mut shared = file("f1", "a.txt", "root-id", 5);
        shared.parents.push("other".to_string());
        seed(&cache, &drive, shared).await;

        cache.remove("f1", "root-id").await.unwrap();
        assert!(drive.trashed_ids().is_empty());
        assert!(cache.lookup("root-id", "a.txt").await.unwrap_err().is_not_found());
        assert_eq!(cache.lookup("other", "a.txt").await.unwrap().object_id, "f1");
    }

    #[tokio::test]
    async fn test_resolve_root_alias() {
        let (cache, drive) = setup().await;
        let root = cache.resolve_root("root").await.unwrap();
        assert_eq!(root.object_id, "root-id");
        assert_eq!(drive.get_calls(), 1);

        // stored under its real id, so resolving by id stays local
        cache.resolve_root("root-id").await.unwrap();
        assert_eq!(drive.get_calls(), 1);
    }

    #[tokio::test]
    async fn test_resolve_root_must_be_folder() {
        let (cache, drive) = setup().await;
        drive.insert(file("f1", "a.txt", "root-id", 5));
        assert!(matches!(
            cache.resolve_root("f1").await.unwrap_err(),
            Error::InvalidConfig(_)
        ));
    }

    #[tokio::test]
    async fn test_sync_children() {
        let (cache, drive) = setup().await;
        drive.insert(file("f1", "a.txt", "root-id", 5));
        drive.insert(folder("d1", "docs", "root-id"));

        assert_eq!(cache.sync_children("root-id").await.unwrap(), 2);
        let names: Vec<String> = cache
            .list("root-id")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.name)
            .collect();
        assert_eq!(names, vec!["a.txt", "docs"]);
    }
}
