/**
 * Error taxonomy shared by the chunk and
 *  metadata subsystems.
 */
pub mod error;
/**
 * Immutable snapshot of a remote file or folder.
 */
pub mod object;
/**
 * Remote API plumbing: OAuth2 bearer tokens,
 *  the Drive v3 client and its JSON mapping.
 */
pub mod drive;
/**
 * Chunk subsystem.
 *  - Bounded on-disk chunk store with LRU eviction
 *  - Deduplicating two-tier request queue
 *  - Worker pool of ranged downloaders
 *  - Read-ahead policy
 */
pub mod chunk;
/**
 * Metadata subsystem.
 *  SQLite-backed object index kept fresh
 *  by the remote changes feed.
 */
pub mod metadata;
/**
 * In-memory remote drive for tests.
 */
pub mod testkit;

pub use error::{Error, Result};

pub mod prelude {
    pub use crate::chunk::{ChunkConfig, ChunkId, ChunkManager, ChunkStore, Downloader, Janitor};
    pub use crate::drive::{DriveClient, RemoteDrive, TokenSource};
    pub use crate::error::{Error, Result};
    pub use crate::metadata::{ChangesPoller, MetadataCache, MetadataStore};
    pub use crate::object::Object;
}
