use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Separator between parent id and name in the `(parent, name)` index key.
pub const NAME_SEPARATOR: char = '/';

/// Immutable snapshot of a remote file or folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Object {
    /// Opaque, globally unique remote id
    pub object_id: String,
    /// Unique within each parent; never contains `/`
    pub name: String,
    pub is_dir: bool,
    /// Content length in bytes, 0 for directories
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    /// Resolvable without an extra round-trip
    pub download_url: String,
    /// Usually a single entry; shared items may have several
    pub parents: Vec<String>,
    /// Deletion trashes the object when set, otherwise only detaches the parent
    pub can_trash: bool,
}

impl Object {
    /// Index keys this record occupies in the `(parent, name)` index.
    pub fn parent_keys(&self) -> impl Iterator<Item = String> + '_ {
        self.parents
            .iter()
            .map(move |parent| parent_key(parent, &self.name))
    }

    pub fn has_parent(&self, parent_id: &str) -> bool {
        self.parents.iter().any(|p| p == parent_id)
    }
}

/// Key for the `(parent, name)` index: `<parent>/<name>`.
pub fn parent_key(parent_id: &str, name: &str) -> String {
    format!("{}{}{}", parent_id, NAME_SEPARATOR, name)
}

/// Prefix shared by every index key under `parent_id`.
pub fn parent_prefix(parent_id: &str) -> String {
    format!("{}{}", parent_id, NAME_SEPARATOR)
}

/// Names reaching the index must not contain the key separator.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(NAME_SEPARATOR)
}

/// Replace stray separators in a name coming from the remote side.
pub fn escape_name(name: &str) -> String {
    name.replace(NAME_SEPARATOR, "\u{2215}")
}
