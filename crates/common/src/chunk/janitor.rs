//! Periodic cleanup of the chunk directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::sync::watch;

use crate::error::Result;

/// What a sweep is allowed to delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JanitorMode {
    /// Delete regular files older than `chunk_age`, then prune empty directories
    Sweep { chunk_age: Duration },
    /// Only prune empty directories; chunk files are owned by the chunk store
    PruneOnly,
}

/// Totals of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub files_removed: usize,
    pub dirs_removed: usize,
}

#[derive(Debug, Clone)]
pub struct Janitor {
    root: PathBuf,
    interval: Duration,
    mode: JanitorMode,
    protected: Vec<PathBuf>,
}

impl Janitor {
    pub fn new(root: impl Into<PathBuf>, interval: Duration, mode: JanitorMode) -> Self {
        Self {
            root: root.into(),
            interval,
            mode,
            protected: Vec::new(),
        }
    }

    /// Never delete `path`, whatever its age.
    pub fn protect(mut self, path: impl Into<PathBuf>) -> Self {
        self.protected.push(path.into());
        self
    }

    pub fn mode(&self) -> JanitorMode {
        self.mode
    }

    /// One pass over the directory tree. The root itself is kept.
    pub fn sweep(&self) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        if !self.root.exists() {
            return Ok(stats);
        }
        self.sweep_dir(&self.root, SystemTime::now(), &mut stats)?;
        Ok(stats)
    }

    /// Sweep every `interval` until `shutdown` fires. The first sweep runs
    /// immediately.
    pub async fn run(self, mut shutdown: watch::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            let janitor = self.clone();
            match tokio::task::spawn_blocking(move || janitor.sweep()).await {
                Ok(Ok(stats)) if stats != SweepStats::default() => {
                    tracing::info!(
                        files = stats.files_removed,
                        dirs = stats.dirs_removed,
                        "janitor sweep"
                    );
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::warn!(root = %self.root.display(), "janitor sweep failed: {}", e),
                Err(e) => tracing::error!("janitor task panicked: {}", e),
            }
        }
        tracing::debug!("janitor stopped");
    }

    /// Returns whether `dir` is empty after the sweep.
    fn sweep_dir(&self, dir: &Path, now: SystemTime, stats: &mut SweepStats) -> io::Result<bool> {
        let mut empty = true;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                if self.sweep_dir(&path, now, stats)? {
                    match fs::remove_dir(&path) {
                        Ok(()) => {
                            stats.dirs_removed += 1;
                            continue;
                        }
                        // raced with a writer
                        Err(e) => {
                            tracing::debug!(path = %path.display(), "keeping directory: {}", e);
                        }
                    }
                }
                empty = false;
                continue;
            }

            if file_type.is_file() && self.is_expired(&path, &entry.metadata()?, now) {
                match fs::remove_file(&path) {
                    Ok(()) => {
                        tracing::debug!(path = %path.display(), "removed expired chunk file");
                        stats.files_removed += 1;
                        continue;
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e),
                }
            }
            empty = false;
        }
        Ok(empty)
    }

    fn is_expired(&self, path: &Path, metadata: &fs::Metadata, now: SystemTime) -> bool {
        let JanitorMode::Sweep { chunk_age } = self.mode else {
            return false;
        };
        if self.protected.iter().any(|p| p == path) {
            return false;
        }
        metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age > chunk_age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"chunk").unwrap();
    }

    #[test]
    fn test_prune_only_keeps_files() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("a/chunk-0"));
        fs::create_dir_all(dir.path().join("b/c")).unwrap();

        let janitor = Janitor::new(dir.path(), Duration::from_secs(60), JanitorMode::PruneOnly);
        let stats = janitor.sweep().unwrap();

        assert_eq!(stats, SweepStats { files_removed: 0, dirs_removed: 2 });
        assert!(dir.path().join("a/chunk-0").exists());
        assert!(!dir.path().join("b").exists());
        assert!(dir.path().exists());
    }

    #[test]
    fn test_sweep_removes_expired_files() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("obj/0"));
        touch(&dir.path().join("obj/4096"));
        touch(&dir.path().join("chunks.bin"));

        let janitor = Janitor::new(
            dir.path(),
            Duration::from_secs(60),
            JanitorMode::Sweep {
                chunk_age: Duration::ZERO,
            },
        )
        .protect(dir.path().join("chunks.bin"));
        std::thread::sleep(Duration::from_millis(10));
        let stats = janitor.sweep().unwrap();

        assert_eq!(stats, SweepStats { files_removed: 2, dirs_removed: 1 });
        assert!(!dir.path().join("obj").exists());
        assert!(dir.path().join("chunks.bin").exists());
    }

    #[test]
    fn test_sweep_keeps_fresh_files() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("obj/0"));

        let janitor = Janitor::new(
            dir.path(),
            Duration::from_secs(60),
            JanitorMode::Sweep {
                chunk_age: Duration::from_secs(3600),
            },
        );
        assert_eq!(janitor.sweep().unwrap(), SweepStats::default());
        assert!(dir.path().join("obj/0").exists());
    }

    #[test]
    fn test_missing_root_is_noop() {
        let dir = TempDir::new().unwrap();
        let janitor = Janitor::new(
            dir.path().join("absent"),
            Duration::from_secs(60),
            JanitorMode::PruneOnly,
        );
        assert_eq!(janitor.sweep().unwrap(), SweepStats::default());
    }

    #[tokio::test]
    async fn test_run_sweeps_until_shutdown() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("empty")).unwrap();

        let (tx, rx) = watch::channel(());
        let janitor = Janitor::new(dir.path(), Duration::from_millis(10), JanitorMode::PruneOnly);
        let task = tokio::spawn(janitor.run(rx));

        for _ in 0..100 {
            if !dir.path().join("empty").exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!dir.path().join("empty").exists());

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
