/// In-memory stand-ins for the remote side
///
/// [`FakeDrive`] implements [`crate::drive::RemoteDrive`] over a map of
/// objects and a scripted changes feed, so the metadata cache and the
/// changes poller can be exercised without network access.
///
/// # Example
///
/// ```rust,ignore
/// use common::testkit::{file, FakeDrive};
///
/// let drive = FakeDrive::new();
/// drive.insert(file("f1", "a.txt", "root", 10));
/// drive.push_page("1", vec![FakeDrive::removed("f1")], None, Some("2"));
/// ```
mod drive;

pub use drive::FakeDrive;

use chrono::{TimeZone, Utc};

use crate::object::Object;

/// File record under a single parent.
pub fn file(id: &str, name: &str, parent: &str, size: u64) -> Object {
    Object {
        object_id: id.to_string(),
        name: name.to_string(),
        is_dir: false,
        size,
        last_modified: Utc.timestamp_opt(1_700_000_000, 0).single().unwrap_or_default(),
        download_url: format!("http://127.0.0.1/files/{}?alt=media", id),
        parents: vec![parent.to_string()],
        can_trash: true,
    }
}

/// Folder record under a single parent.
pub fn folder(id: &str, name: &str, parent: &str) -> Object {
    Object {
        is_dir: true,
        size: 0,
        ..file(id, name, parent, 0)
    }
}
