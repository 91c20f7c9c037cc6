use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::drive::{ChangePage, RemoteChange, RemoteDrive};
use crate::error::{Error, Result};
use crate::object::Object;

use super::folder;

/// Remote drive held in memory.
///
/// The changes feed is scripted per page token with [`FakeDrive::push_page`].
/// Unknown tokens answer with an empty, final page.
#[derive(Debug, Default)]
pub struct FakeDrive {
    state: Mutex<State>,
    change_calls: AtomicUsize,
    get_calls: AtomicUsize,
    changes_delay: Mutex<Option<Duration>>,
}

#[derive(Debug, Default)]
struct State {
    objects: HashMap<String, Object>,
    aliases: HashMap<String, String>,
    pages: HashMap<String, ChangePage>,
    trashed: Vec<String>,
    next_id: usize,
}

impl FakeDrive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drive whose `root` alias resolves to a folder with id `root_id`.
    pub fn with_root(root_id: &str) -> Self {
        let drive = Self::new();
        let mut root = folder(root_id, "My Drive", "");
        root.parents.clear();
        root.can_trash = false;
        drive.insert(root);
        drive.alias("root", root_id);
        drive
    }

    pub fn insert(&self, object: Object) {
        self.state
            .lock()
            .objects
            .insert(object.object_id.clone(), object);
    }

    pub fn alias(&self, alias: &str, object_id: &str) {
        self.state
            .lock()
            .aliases
            .insert(alias.to_string(), object_id.to_string());
    }

    pub fn object(&self, object_id: &str) -> Option<Object> {
        self.state.lock().objects.get(object_id).cloned()
    }

    /// Answer `changes(token)` with this page.
    pub fn push_page(
        &self,
        token: &str,
        changes: Vec<RemoteChange>,
        next_page_token: Option<&str>,
        new_start_page_token: Option<&str>,
    ) {
        self.state.lock().pages.insert(
            token.to_string(),
            ChangePage {
                changes,
                next_page_token: next_page_token.map(str::to_string),
                new_start_page_token: new_start_page_token.map(str::to_string),
            },
        );
    }

    /// Slow down every `changes` call.
    pub fn set_changes_delay(&self, delay: Duration) {
        *self.changes_delay.lock() = Some(delay);
    }

    pub fn updated(object: Object) -> RemoteChange {
        RemoteChange {
            object_id: object.object_id.clone(),
            removed: false,
            explicitly_trashed: false,
            object: Some(object),
        }
    }

    pub fn removed(object_id: &str) -> RemoteChange {
        RemoteChange {
            object_id: object_id.to_string(),
            removed: true,
            explicitly_trashed: false,
            object: None,
        }
    }

    pub fn trashed(object: Object) -> RemoteChange {
        RemoteChange {
            object_id: object.object_id.clone(),
            removed: false,
            explicitly_trashed: true,
            object: Some(object),
        }
    }

    pub fn change_calls(&self) -> usize {
        self.change_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn trashed_ids(&self) -> Vec<String> {
        self.state.lock().trashed.clone()
    }

    fn with_object<T>(&self, object_id: &str, f: impl FnOnce(&mut Object) -> T) -> Result<T> {
        let mut state = self.state.lock();
        state
            .objects
            .get_mut(object_id)
            .map(f)
            .ok_or_else(|| Error::NotFound(object_id.to_string()))
    }
}

#[async_trait::async_trait]
impl RemoteDrive for FakeDrive {
    async fn get_object(&self, object_id: &str) -> Result<Object> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        let id = state
            .aliases
            .get(object_id)
            .map(String::as_str)
            .unwrap_or(object_id);
        state
            .objects
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(object_id.to_string()))
    }

    async fn list_children(&self, parent_id: &str) -> Result<Vec<Object>> {
        let state = self.state.lock();
        let mut children: Vec<Object> = state
            .objects
            .values()
            .filter(|o| o.has_parent(parent_id) && !state.trashed.contains(&o.object_id))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    async fn changes(&self, page_token: &str, _page_size: u32) -> Result<ChangePage> {
        self.change_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.changes_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let page = self.state.lock().pages.get(page_token).cloned();
        Ok(page.unwrap_or_else(|| ChangePage {
            new_start_page_token: Some(page_token.to_string()),
            ..Default::default()
        }))
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<Object> {
        let id = {
            let mut state = self.state.lock();
            state.next_id += 1;
            format!("folder-{}", state.next_id)
        };
        let object = folder(&id, name, parent_id);
        self.insert(object.clone());
        Ok(object)
    }

    async fn trash(&self, object_id: &str) -> Result<()> {
        self.with_object(object_id, |_| ())?;
        self.state.lock().trashed.push(object_id.to_string());
        Ok(())
    }

    async fn remove_parent(&self, object_id: &str, parent_id: &str) -> Result<Object> {
        self.with_object(object_id, |o| {
            o.parents.retain(|p| p != parent_id);
            o.clone()
        })
    }

    async fn move_object(
        &self,
        object_id: &str,
        old_parent: &str,
        new_parent: &str,
        new_name: &str,
    ) -> Result<Object> {
        self.with_object(object_id, |o| {
            if old_parent != new_parent {
                o.parents.retain(|p| p != old_parent);
                o.parents.push(new_parent.to_string());
            }
            o.name = new_name.to_string();
            o.clone()
        })
    }
}
