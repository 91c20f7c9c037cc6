use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::{MetadataStore, Mutation};
use crate::drive::RemoteDrive;
use crate::error::Result;

/// Token meaning "replay the feed from the beginning".
pub const DEFAULT_PAGE_TOKEN: &str = "1";

pub const CHANGES_PAGE_SIZE: u32 = 1000;

/// Totals of one pass over the changes feed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollStats {
    pub pages: usize,
    pub updated: usize,
    pub deleted: usize,
}

/// Replays the remote changes feed into the metadata store.
pub struct ChangesPoller {
    store: MetadataStore,
    remote: Arc<dyn RemoteDrive>,
    interval: Duration,
    busy: AtomicBool,
}

/// Clears the busy flag when a pass ends, including on error.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ChangesPoller {
    pub fn new(store: MetadataStore, remote: Arc<dyn RemoteDrive>, interval: Duration) -> Self {
        Self {
            store,
            remote,
            interval,
            busy: AtomicBool::new(false),
        }
    }

    /// Run one pass. Returns `None` without touching the store when another
    /// pass is already in progress.
    pub async fn poll(&self) -> Result<Option<PollStats>> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("changes pass already running, skipping");
            return Ok(None);
        }
        let _guard = PassGuard(&self.busy);

        let mut token = self
            .store
            .page_token()
            .await?
            .unwrap_or_else(|| DEFAULT_PAGE_TOKEN.to_string());
        let mut stats = PollStats::default();

        loop {
            let page = self.remote.changes(&token, CHANGES_PAGE_SIZE).await?;
            stats.pages += 1;

            let mut mutations = Vec::with_capacity(page.changes.len());
            for change in page.changes {
                if change.removed || change.explicitly_trashed {
                    stats.deleted += 1;
                    mutations.push(Mutation::Delete(change.object_id));
                } else if let Some(object) = change.object {
                    stats.updated += 1;
                    mutations.push(Mutation::Update(object));
                } else {
                    tracing::debug!(object_id = %change.object_id, "change without a record, skipping");
                }
            }

            // the last page carries the token to resume from next time
            let (next, done) = match (page.new_start_page_token, page.next_page_token) {
                (Some(start), _) => (Some(start), true),
                (None, Some(next)) => (Some(next), false),
                (None, None) => {
                    tracing::warn!(token = %token, "changes page carried no continuation token");
                    (None, true)
                }
            };

            self.store.apply(&mutations, next.as_deref()).await?;
            match next {
                Some(next) if !done => token = next,
                _ => break,
            }
        }

        if stats.updated > 0 || stats.deleted > 0 {
            tracing::info!(
                pages = stats.pages,
                updated = stats.updated,
                deleted = stats.deleted,
                "applied remote changes"
            );
        }
        Ok(Some(stats))
    }

    /// Poll immediately, then every `interval` until `shutdown` fires.
    /// Failed passes are logged and retried on the next tick.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.poll().await {
                tracing::warn!("changes pass failed: {}", e);
            }
        }
        tracing::debug!("changes poller stopped");
    }
}
