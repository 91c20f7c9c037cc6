//! Metadata subsystem
//!
//! - **[`MetadataStore`]**: SQLite tables `objects`, `parents_index` and
//!   `page_token`; every multi-key write is one transaction
//! - **[`MetadataCache`]**: the operations the filesystem adapter calls;
//!   mutations go to the remote side first and the returned record is applied
//!   locally
//! - **[`ChangesPoller`]**: background task replaying the remote changes feed
//!   into the store

mod cache;
mod poller;
mod store;

pub use cache::MetadataCache;
pub use poller::{ChangesPoller, PollStats, CHANGES_PAGE_SIZE, DEFAULT_PAGE_TOKEN};
pub use store::{MetadataStore, Mutation};
