//! Read orchestration and the downloader worker pool.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{
    align_down, split, ChunkConfig, ChunkRequest, ChunkStore, Fetcher, RequestQueue, Waiter,
};
use crate::error::{Error, Result};
use crate::object::Object;

/// One chunk's share of a read.
enum Part {
    Ready(Bytes),
    Pending(ChunkRequest, Waiter),
}

/// Entry point of the chunk subsystem for the filesystem adapter.
///
/// Owns the request queue and the `threads` worker tasks that drain it.
/// Constructed once at startup and shared behind an `Arc`.
pub struct ChunkManager {
    config: ChunkConfig,
    store: Arc<ChunkStore>,
    queue: Arc<RequestQueue>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ChunkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkManager")
            .field("config", &self.config)
            .field("queue", &self.queue)
            .finish()
    }
}

impl ChunkManager {
    /// Validate `config` and spawn the worker pool. Workers exit when
    /// `shutdown` fires or its sender is dropped.
    pub fn start(
        config: ChunkConfig,
        store: Arc<ChunkStore>,
        fetcher: Arc<dyn Fetcher>,
        shutdown: watch::Receiver<()>,
    ) -> Result<Self> {
        config.validate()?;
        if store.chunk_size() as u64 != config.chunk_size {
            return Err(Error::InvalidConfig(format!(
                "chunk store slots hold {} bytes, manager expects {}",
                store.chunk_size(),
                config.chunk_size
            )));
        }
        if store.max_chunks() < config.max_chunks {
            return Err(Error::InvalidConfig(format!(
                "chunk store has {} slots, manager expects {}",
                store.max_chunks(),
                config.max_chunks
            )));
        }

        let queue = Arc::new(RequestQueue::new(config.queue_capacity, config.fairness));
        let workers = (0..config.threads)
            .map(|n| {
                tokio::spawn(worker(
                    n,
                    queue.clone(),
                    store.clone(),
                    fetcher.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();

        tracing::info!(
            threads = config.threads,
            chunk_size = config.chunk_size,
            load_ahead = config.load_ahead,
            "chunk manager started"
        );

        Ok(Self {
            config,
            store,
            queue,
            workers: Mutex::new(workers),
        })
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    /// `size` bytes of `object` starting at `offset`. Reads past the end of
    /// the object are truncated; a read starting at or past the end is empty.
    pub async fn read(&self, object: &Arc<Object>, offset: u64, size: u64) -> Result<Bytes> {
        if size == 0 || offset >= object.size {
            return Ok(Bytes::new());
        }
        let size = size.min(object.size - offset);
        let chunk_size = self.config.chunk_size;

        let mut parts = Vec::new();
        for (range_offset, range_size) in split(offset, size, chunk_size) {
            let chunk_start = align_down(range_offset, chunk_size);
            let sub_start = (range_offset - chunk_start) as usize;
            let request = ChunkRequest::new(
                object.clone(),
                chunk_start,
                chunk_size,
                sub_start..sub_start + range_size as usize,
                false,
            );
            // resident chunks never wait for a worker
            let part = match self.store.load(&request.id) {
                Some(chunk) if chunk.len() >= request.sub_range.end => {
                    tracing::trace!(chunk = %request.id, "chunk store hit");
                    Part::Ready(chunk.slice(request.sub_range.clone()))
                }
                _ => {
                    let waiter = self.queue.submit(request.clone()).await?;
                    Part::Pending(request, waiter)
                }
            };
            parts.push(part);
        }

        self.preload(object, align_down(offset + size - 1, chunk_size));

        if parts.len() == 1 {
            return match parts.remove(0) {
                Part::Ready(data) => Ok(data),
                Part::Pending(request, waiter) => self.wait(request, waiter).await,
            };
        }

        let mut out = BytesMut::with_capacity(size as usize);
        for part in parts {
            match part {
                Part::Ready(data) => out.extend_from_slice(&data),
                Part::Pending(request, waiter) => {
                    out.extend_from_slice(&self.wait(request, waiter).await?)
                }
            }
        }
        Ok(out.freeze())
    }

    /// Queue read-ahead for the `load_ahead` chunks following the one at
    /// `last_chunk`. Resident chunks are skipped; requests that do not fit
    /// in the low tier are dropped.
    pub fn preload(&self, object: &Arc<Object>, last_chunk: u64) {
        let chunk_size = self.config.chunk_size;
        for n in 1..=self.config.load_ahead as u64 {
            let start = last_chunk + n * chunk_size;
            if start >= object.size {
                break;
            }
            let request = ChunkRequest::new(object.clone(), start, chunk_size, 0..0, true);
            if self.store.contains(&request.id) {
                continue;
            }
            if self.queue.try_submit(request) {
                tracing::trace!(object_id = %object.object_id, offset = start, "queued read-ahead");
            }
        }
    }

    /// Wait for every worker to exit after shutdown was signalled.
    pub async fn join(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(e) = handle.await {
                tracing::error!("chunk worker panicked: {}", e);
            }
        }
    }

    /// Await one chunk and cut the caller's sub-range out of it. Each expired
    /// deadline resubmits the request, which attaches to the fetch if it is
    /// still in flight.
    async fn wait(&self, request: ChunkRequest, mut waiter: Waiter) -> Result<Bytes> {
        let mut retries = 0;
        loop {
            match tokio::time::timeout(self.config.timeout, waiter.recv()).await {
                Ok(Some(reply)) => {
                    let chunk = reply?;
                    if chunk.len() < request.sub_range.end {
                        return Err(Error::Integrity(format!(
                            "chunk {} has {} bytes, read needs {}",
                            request.id,
                            chunk.len(),
                            request.sub_range.end
                        )));
                    }
                    return Ok(chunk.slice(request.sub_range.clone()));
                }
                Ok(None) | Err(_) => {
                    if retries >= self.config.timeout_retries {
                        tracing::warn!(chunk = %request.id, retries, "chunk read timed out");
                        return Err(Error::Timeout);
                    }
                    retries += 1;
                    tracing::debug!(chunk = %request.id, retries, "chunk read deadline passed, resubmitting");
                    waiter = self.queue.submit(request.clone()).await?;
                }
            }
        }
    }
}

async fn worker(
    n: usize,
    queue: Arc<RequestQueue>,
    store: Arc<ChunkStore>,
    fetcher: Arc<dyn Fetcher>,
    mut shutdown: watch::Receiver<()>,
) {
    tracing::debug!(worker = n, "chunk worker started");
    loop {
        let request = tokio::select! {
            _ = shutdown.changed() => break,
            request = queue.next() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let reply = match store.load(&request.id) {
            Some(chunk) => {
                tracing::trace!(worker = n, chunk = %request.id, "chunk store hit");
                Ok(chunk)
            }
            None => download(n, &request, &store, fetcher.as_ref()).await,
        };
        queue.complete(&request.id, reply);
    }
    tracing::debug!(worker = n, "chunk worker stopped");
}

/// Fetch a missing chunk and make it resident. A body that fails its length
/// check is fetched once more before the error is reported.
async fn download(
    n: usize,
    request: &ChunkRequest,
    store: &ChunkStore,
    fetcher: &dyn Fetcher,
) -> Result<Bytes> {
    tracing::debug!(
        worker = n,
        chunk = %request.id,
        preload = request.preload,
        "downloading chunk"
    );
    let chunk = match fetcher.fetch(request).await {
        Err(Error::Integrity(reason)) => {
            tracing::warn!(chunk = %request.id, "refetching chunk: {}", reason);
            fetcher.fetch(request).await
        }
        other => other,
    };

    match chunk {
        Ok(chunk) => {
            if let Err(e) = store.store(&request.id, &chunk) {
                tracing::warn!(chunk = %request.id, "failed to store chunk: {}", e);
            }
            Ok(chunk)
        }
        Err(e) => {
            tracing::warn!(chunk = %request.id, "chunk download failed: {}", e);
            Err(e)
        }
    }
}
