//! Remote API boundary.
//!
//! - **[`TokenSource`]**: bearer tokens, refreshed transparently
//! - **[`DriveClient`]**: Drive v3 over `reqwest`
//! - **[`RemoteDrive`]**: the operations the metadata subsystem needs from the remote side
//!
//! The ranged download itself lives in [`crate::chunk::Downloader`], which
//! borrows the client's HTTP connection pool and token source.

pub mod auth;
mod client;
pub mod types;

pub use auth::{ClientCredentials, RefreshingTokenSource, StaticTokenSource, Token, TokenSource};
pub use client::{DriveClient, DEFAULT_API_BASE};

use crate::error::Result;
use crate::object::Object;

/// One entry of the remote changes feed.
#[derive(Debug, Clone)]
pub struct RemoteChange {
    pub object_id: String,
    pub removed: bool,
    pub explicitly_trashed: bool,
    /// Present unless the change is a removal
    pub object: Option<Object>,
}

/// One page of the remote changes feed.
#[derive(Debug, Clone, Default)]
pub struct ChangePage {
    pub changes: Vec<RemoteChange>,
    pub next_page_token: Option<String>,
    /// Set on the last page; the pass is complete once it arrives
    pub new_start_page_token: Option<String>,
}

/// Remote operations consumed by the metadata cache and the changes poller.
#[async_trait::async_trait]
pub trait RemoteDrive: Send + Sync {
    /// Fetch a single object by id (aliases such as `root` are accepted).
    async fn get_object(&self, object_id: &str) -> Result<Object>;

    /// Every non-trashed child of `parent_id`.
    async fn list_children(&self, parent_id: &str) -> Result<Vec<Object>>;

    /// One page of changes starting at `page_token`.
    async fn changes(&self, page_token: &str, page_size: u32) -> Result<ChangePage>;

    /// Create a folder and return its record.
    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<Object>;

    /// Move an object to the trash.
    async fn trash(&self, object_id: &str) -> Result<()>;

    /// Detach an object from one parent and return the updated record.
    async fn remove_parent(&self, object_id: &str, parent_id: &str) -> Result<Object>;

    /// Reparent and rename an object in one call, returning the updated record.
    async fn move_object(
        &self,
        object_id: &str,
        old_parent: &str,
        new_parent: &str,
        new_name: &str,
    ) -> Result<Object>;
}
