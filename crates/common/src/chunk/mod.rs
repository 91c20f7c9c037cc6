//! Chunk subsystem
//!
//! Reads from the filesystem arrive as `(object, offset, size)` and are
//! served out of fixed-size, aligned chunks:
//!
//! ```text
//! ChunkManager::read ──split──► ChunkRequest ──► RequestQueue (high | low)
//!                                                    │ dedupe table
//!                                                    ▼
//!                                   worker ──► ChunkStore (hit) ──► waiters
//!                                      │
//!                                      └─► Downloader (miss) ──► ChunkStore + waiters
//! ```
//!
//! - **[`ChunkStore`]**: bounded on-disk slots with LRU eviction and CRC32 headers
//! - **[`RequestQueue`]**: two-tier queue coalescing concurrent fetches of one chunk
//! - **[`Downloader`]**: ranged HTTP GET with throttle backoff
//! - **[`ChunkManager`]**: splits reads, schedules read-ahead, runs the worker pool
//! - **[`Janitor`]**: periodic sweep of the chunk directory

mod downloader;
mod janitor;
mod lru;
mod manager;
mod queue;
mod store;

use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

pub use downloader::{is_throttled, Downloader, Fetcher, RetryPolicy};
pub use janitor::{Janitor, JanitorMode, SweepStats};
pub use manager::ChunkManager;
pub use queue::{ChunkReply, RequestQueue, Waiter};
pub use store::{ChunkStore, HEADER_SIZE};

use crate::error::{Error, Result};
use crate::object::Object;

/// Smallest accepted chunk size.
pub const MIN_CHUNK_SIZE: u64 = 4096;

/// Identity of one chunk: `(object_id, offset_start)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId {
    pub object_id: String,
    pub offset: u64,
}

impl ChunkId {
    pub fn new(object_id: impl Into<String>, offset: u64) -> Self {
        Self {
            object_id: object_id.into(),
            offset,
        }
    }

    /// Stable 64-bit fingerprint written into the on-disk header.
    pub fn fingerprint(&self) -> u64 {
        use std::hash::{DefaultHasher, Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        self.object_id.hash(&mut hasher);
        self.offset.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_id, self.offset)
    }
}

/// Tuning knobs for the chunk subsystem.
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// Bytes per chunk; at least 4096 and a multiple of 1024
    pub chunk_size: u64,
    /// Resident chunk slots in the backing file
    pub max_chunks: usize,
    /// Chunks preloaded after the last one a read touches
    pub load_ahead: usize,
    /// Concurrent downloader workers
    pub threads: usize,
    /// Deadline for one wait on a chunk reply
    pub timeout: Duration,
    /// Extra waits after the first deadline passes
    pub timeout_retries: usize,
    /// Pending requests per queue tier
    pub queue_capacity: usize,
    /// High-tier dequeues after which one low-tier item is serviced
    pub fairness: usize,
    /// Serve resident chunks through a memory map of the backing file
    pub mmap: bool,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10 * 1024 * 1024,
            max_chunks: 10,
            load_ahead: 3,
            threads: 4,
            timeout: Duration::from_secs(10),
            timeout_retries: 3,
            queue_capacity: 100,
            fairness: 8,
            mmap: true,
        }
    }
}

impl ChunkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size < MIN_CHUNK_SIZE {
            return Err(Error::InvalidConfig(format!(
                "chunk size {} is below the minimum of {}",
                self.chunk_size, MIN_CHUNK_SIZE
            )));
        }
        if self.chunk_size % 1024 != 0 {
            return Err(Error::InvalidConfig(format!(
                "chunk size {} is not a multiple of 1024",
                self.chunk_size
            )));
        }
        if self.chunk_size > u32::MAX as u64 {
            return Err(Error::InvalidConfig(format!(
                "chunk size {} does not fit the chunk header",
                self.chunk_size
            )));
        }
        if self.max_chunks < 2 {
            return Err(Error::InvalidConfig(format!(
                "max chunks must be at least 2, got {}",
                self.max_chunks
            )));
        }
        if self.load_ahead >= self.max_chunks {
            return Err(Error::InvalidConfig(format!(
                "load ahead ({}) must be below max chunks ({})",
                self.load_ahead, self.max_chunks
            )));
        }
        if self.threads == 0 {
            return Err(Error::InvalidConfig("at least one worker thread is required".into()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::InvalidConfig("queue capacity must be positive".into()));
        }
        Ok(())
    }
}

/// A pending fetch of one chunk on behalf of one reader.
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub id: ChunkId,
    pub object: Arc<Object>,
    /// Chunk-aligned start of the fetch
    pub offset_start: u64,
    /// Exclusive end, clamped to the object size
    pub offset_end: u64,
    /// Portion of the chunk the caller needs, relative to `offset_start`
    pub sub_range: Range<usize>,
    /// Read-ahead request, queued on the low tier
    pub preload: bool,
}

impl ChunkRequest {
    pub fn new(
        object: Arc<Object>,
        offset_start: u64,
        chunk_size: u64,
        sub_range: Range<usize>,
        preload: bool,
    ) -> Self {
        let offset_end = (offset_start + chunk_size).min(object.size);
        Self {
            id: ChunkId::new(object.object_id.clone(), offset_start),
            object,
            offset_start,
            offset_end,
            sub_range,
            preload,
        }
    }

    /// Inclusive last byte, as used in the `Range` header.
    pub fn last_byte(&self) -> u64 {
        self.offset_end.saturating_sub(1)
    }

    pub fn len(&self) -> usize {
        (self.offset_end - self.offset_start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.offset_end <= self.offset_start
    }
}

/// Split `[offset, offset + size)` into ranges that never cross a chunk
/// boundary. Interior ranges are exactly `chunk_size` long; the first and
/// last may be short.
pub fn split(offset: u64, size: u64, chunk_size: u64) -> Vec<(u64, u64)> {
    let mut ranges = Vec::new();
    if size == 0 || chunk_size == 0 {
        return ranges;
    }

    let end = offset + size;
    let mut cursor = offset;
    while cursor < end {
        let boundary = (cursor / chunk_size + 1) * chunk_size;
        let next = boundary.min(end);
        ranges.push((cursor, next - cursor));
        cursor = next;
    }
    ranges
}

/// Start of the chunk containing `offset`.
pub fn align_down(offset: u64, chunk_size: u64) -> u64 {
    offset - offset % chunk_size
}
