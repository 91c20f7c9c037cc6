//! Two-tier request queue with an in-flight dedupe table.
//!
//! Synchronous reads go to the `high` tier, read-ahead to `low`. Both tiers
//! are bounded `flume` channels shared by every worker. The dedupe table maps
//! each in-flight [`ChunkId`] to a broadcast channel; a second request for the
//! same chunk attaches a new receiver instead of queueing another fetch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{ChunkId, ChunkRequest};
use crate::error::{Error, Result};

/// Outcome of one chunk fetch: the full chunk body or the error.
pub type ChunkReply = Result<Bytes>;

/// Receiving end attached to an in-flight fetch.
#[derive(Debug)]
pub struct Waiter {
    id: ChunkId,
    rx: broadcast::Receiver<ChunkReply>,
}

impl Waiter {
    pub fn id(&self) -> &ChunkId {
        &self.id
    }

    /// Wait for the fetch outcome. `None` when the fetch was abandoned
    /// without a result.
    pub async fn recv(&mut self) -> Option<ChunkReply> {
        self.rx.recv().await.ok()
    }
}

#[derive(Debug)]
struct InFlight {
    tx: broadcast::Sender<ChunkReply>,
    /// Queued on the low tier only
    preload: bool,
    /// A copy was pushed onto the high tier after a synchronous reader attached
    promoted: bool,
    /// A worker has taken this fetch
    dispatched: bool,
}

impl InFlight {
    fn new(preload: bool) -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            preload,
            promoted: false,
            dispatched: false,
        }
    }
}

/// Bounded, deduplicating, two-tier queue of chunk fetches.
pub struct RequestQueue {
    high_tx: flume::Sender<ChunkRequest>,
    high_rx: flume::Receiver<ChunkRequest>,
    low_tx: flume::Sender<ChunkRequest>,
    low_rx: flume::Receiver<ChunkRequest>,
    inflight: Mutex<HashMap<ChunkId, InFlight>>,
    fairness: usize,
    high_streak: AtomicUsize,
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("high", &self.high_rx.len())
            .field("low", &self.low_rx.len())
            .field("in_flight", &self.in_flight_count())
            .finish()
    }
}

impl RequestQueue {
    /// `capacity` bounds each tier; after `fairness` consecutive high-tier
    /// dequeues one low-tier item is served if present.
    pub fn new(capacity: usize, fairness: usize) -> Self {
        let (high_tx, high_rx) = flume::bounded(capacity);
        let (low_tx, low_rx) = flume::bounded(capacity);
        Self {
            high_tx,
            high_rx,
            low_tx,
            low_rx,
            inflight: Mutex::new(HashMap::new()),
            fairness: fairness.max(1),
            high_streak: AtomicUsize::new(0),
        }
    }

    /// Queue a fetch, or attach to the one already in flight for the same
    /// chunk. Blocks while the target tier is full.
    pub async fn submit(&self, request: ChunkRequest) -> Result<Waiter> {
        let (waiter, enqueue) = {
            let mut table = self.inflight.lock();
            match table.get_mut(&request.id) {
                Some(entry) => {
                    let waiter = Waiter {
                        id: request.id.clone(),
                        rx: entry.tx.subscribe(),
                    };
                    // a blocking reader must not wait behind queued read-ahead
                    let promote =
                        !request.preload && entry.preload && !entry.promoted && !entry.dispatched;
                    if promote {
                        entry.promoted = true;
                    }
                    tracing::trace!(chunk = %request.id, promote, "attached to in-flight fetch");
                    (waiter, promote)
                }
                None => {
                    let entry = InFlight::new(request.preload);
                    let waiter = Waiter {
                        id: request.id.clone(),
                        rx: entry.tx.subscribe(),
                    };
                    table.insert(request.id.clone(), entry);
                    (waiter, true)
                }
            }
        };

        if enqueue {
            let id = request.id.clone();
            let tier = if request.preload {
                &self.low_tx
            } else {
                &self.high_tx
            };
            if tier.send_async(request).await.is_err() {
                self.abandon(&id);
                return Err(Error::Cancelled);
            }
        }
        Ok(waiter)
    }

    /// Non-blocking submit for read-ahead. Returns `false` when the chunk is
    /// already in flight or the tier is full, in which case nothing is queued.
    pub fn try_submit(&self, request: ChunkRequest) -> bool {
        let mut table = self.inflight.lock();
        if table.contains_key(&request.id) {
            return false;
        }

        let id = request.id.clone();
        table.insert(id.clone(), InFlight::new(request.preload));
        let tier = if request.preload {
            &self.low_tx
        } else {
            &self.high_tx
        };
        match tier.try_send(request) {
            Ok(()) => true,
            Err(e) => {
                if matches!(e, flume::TrySendError::Full(_)) {
                    tracing::debug!(chunk = %id, "queue full, dropping read-ahead");
                }
                table.remove(&id);
                false
            }
        }
    }

    /// Next fetch to perform, preferring the high tier. Items whose fetch was
    /// already taken by another worker are skipped.
    pub async fn next(&self) -> Option<ChunkRequest> {
        loop {
            let request = self.recv_any().await?;
            let mut table = self.inflight.lock();
            match table.get_mut(&request.id) {
                Some(entry) if !entry.dispatched => {
                    entry.dispatched = true;
                    return Some(request);
                }
                _ => {
                    tracing::trace!(chunk = %request.id, "skipping duplicate queue entry");
                }
            }
        }
    }

    /// Broadcast the outcome to every attached waiter, then drop the chunk
    /// from the dedupe table.
    pub fn complete(&self, id: &ChunkId, reply: ChunkReply) {
        let mut table = self.inflight.lock();
        if let Some(entry) = table.remove(id) {
            // no receivers means nobody is waiting, e.g. a read-ahead
            let _ = entry.tx.send(reply);
        }
    }

    /// Drop an in-flight entry without a result; attached waiters see `None`.
    pub fn abandon(&self, id: &ChunkId) {
        self.inflight.lock().remove(id);
    }

    pub fn is_in_flight(&self, id: &ChunkId) -> bool {
        self.inflight.lock().contains_key(id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Queued items per tier as `(high, low)`.
    pub fn pending(&self) -> (usize, usize) {
        (self.high_rx.len(), self.low_rx.len())
    }

    async fn recv_any(&self) -> Option<ChunkRequest> {
        if self.high_streak.load(Ordering::Relaxed) >= self.fairness {
            if let Ok(request) = self.low_rx.try_recv() {
                self.high_streak.store(0, Ordering::Relaxed);
                return Some(request);
            }
        }
        if let Ok(request) = self.high_rx.try_recv() {
            self.high_streak.fetch_add(1, Ordering::Relaxed);
            return Some(request);
        }
        if let Ok(request) = self.low_rx.try_recv() {
            self.high_streak.store(0, Ordering::Relaxed);
            return Some(request);
        }

        tokio::select! {
            biased;
            request = self.high_rx.recv_async() => {
                self.high_streak.fetch_add(1, Ordering::Relaxed);
                request.ok()
            }
            request = self.low_rx.recv_async() => {
                self.high_streak.store(0, Ordering::Relaxed);
                request.ok()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Object;
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;

    const CHUNK: u64 = 4096;

    fn object() -> Arc<Object> {
        Arc::new(Object {
            object_id: "obj".to_string(),
            name: "file".to_string(),
            is_dir: false,
            size: 100 * CHUNK,
            last_modified: Utc::now(),
            download_url: "http://localhost/obj".to_string(),
            parents: vec!["root".to_string()],
            can_trash: true,
        })
    }

    fn request(index: u64, preload: bool) -> ChunkRequest {
        ChunkRequest::new(object(), index * CHUNK, CHUNK, 0..CHUNK as usize, preload)
    }

    #[tokio::test]
    async fn test_duplicate_submit_attaches() {
        let queue = RequestQueue::new(10, 8);
        let mut first = queue.submit(request(0, false)).await.unwrap();
        let mut second = queue.submit(request(0, false)).await.unwrap();

        assert_eq!(queue.pending(), (1, 0));
        assert_eq!(queue.in_flight_count(), 1);

        let taken = queue.next().await.unwrap();
        queue.complete(&taken.id, Ok(Bytes::from_static(b"chunk")));

        assert_eq!(first.recv().await.unwrap().unwrap(), Bytes::from_static(b"chunk"));
        assert_eq!(second.recv().await.unwrap().unwrap(), Bytes::from_static(b"chunk"));
        assert!(!queue.is_in_flight(&taken.id));
    }

    #[tokio::test]
    async fn test_errors_reach_every_waiter() {
        let queue = RequestQueue::new(10, 8);
        let mut a = queue.submit(request(1, false)).await.unwrap();
        let mut b = queue.submit(request(1, false)).await.unwrap();
        let taken = queue.next().await.unwrap();
        queue.complete(&taken.id, Err(Error::QuotaExceeded));

        assert!(matches!(a.recv().await.unwrap(), Err(Error::QuotaExceeded)));
        assert!(matches!(b.recv().await.unwrap(), Err(Error::QuotaExceeded)));
    }

    #[tokio::test]
    async fn test_high_tier_preferred() {
        let queue = RequestQueue::new(10, 8);
        assert!(queue.try_submit(request(5, true)));
        let _w = queue.submit(request(1, false)).await.unwrap();

        assert_eq!(queue.next().await.unwrap().id.offset, CHUNK);
        assert_eq!(queue.next().await.unwrap().id.offset, 5 * CHUNK);
    }

    #[tokio::test]
    async fn test_low_tier_not_starved() {
        let queue = RequestQueue::new(20, 2);
        assert!(queue.try_submit(request(50, true)));
        let mut waiters = Vec::new();
        for i in 0..5 {
            waiters.push(queue.submit(request(i, false)).await.unwrap());
        }

        let order: Vec<u64> = {
            let mut out = Vec::new();
            for _ in 0..6 {
                out.push(queue.next().await.unwrap().id.offset / CHUNK);
            }
            out
        };
        // two high dequeues, then the low item gets its turn
        assert_eq!(order, vec![0, 1, 50, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_try_submit_drops_when_full() {
        let queue = RequestQueue::new(2, 8);
        assert!(queue.try_submit(request(0, true)));
        assert!(queue.try_submit(request(1, true)));
        assert!(!queue.try_submit(request(2, true)));
        assert!(!queue.is_in_flight(&request(2, true).id));
        // already in flight
        assert!(!queue.try_submit(request(0, true)));
    }

    #[tokio::test]
    async fn test_submit_blocks_when_full() {
        let queue = Arc::new(RequestQueue::new(1, 8));
        let _a = queue.submit(request(0, false)).await.unwrap();

        let blocked = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.submit(request(1, false)).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        queue.next().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_blocking_reader_promotes_read_ahead() {
        let queue = RequestQueue::new(10, 8);
        // fill the low tier ahead of the chunk we will need
        assert!(queue.try_submit(request(8, true)));
        assert!(queue.try_submit(request(9, true)));

        let mut waiter = queue.submit(request(9, false)).await.unwrap();
        assert_eq!(queue.pending(), (1, 2));

        let first = queue.next().await.unwrap();
        assert_eq!(first.id.offset, 9 * CHUNK);
        queue.complete(&first.id, Ok(Bytes::from_static(b"nine")));
        assert_eq!(waiter.recv().await.unwrap().unwrap(), Bytes::from_static(b"nine"));

        // the stale low-tier copy of chunk 9 is skipped
        let second = queue.next().await.unwrap();
        assert_eq!(second.id.offset, 8 * CHUNK);
        assert_eq!(queue.pending(), (0, 0));
    }

    #[tokio::test]
    async fn test_abandon_closes_waiters() {
        let queue = RequestQueue::new(10, 8);
        let mut waiter = queue.submit(request(3, false)).await.unwrap();
        queue.abandon(waiter.id());
        assert!(waiter.recv().await.is_none());
    }
}
