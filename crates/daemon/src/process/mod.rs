pub mod utils;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use common::chunk::{ChunkManager, ChunkStore, Downloader, Janitor, JanitorMode};
use common::drive::{DriveClient, RefreshingTokenSource};
use common::metadata::{ChangesPoller, MetadataCache, MetadataStore};
use common::object::Object;

use crate::credentials;
use crate::service_config::ConfigError;
use crate::ServiceConfig;

const FINAL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Startup and shutdown failures. Each maps to a distinct process exit code.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("failed to create config directory: {0}")]
    ConfigDir(std::io::Error),
    #[error("failed to create temp directory: {0}")]
    TempDir(std::io::Error),
    #[error("failed to open chunk store: {0}")]
    ChunkStore(common::Error),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to open metadata cache: {0}")]
    Cache(common::Error),
    #[error("remote drive unavailable: {0}")]
    Remote(common::Error),
    #[error("failed to mount: {0}")]
    Mount(std::io::Error),
    #[error("built without FUSE support")]
    MountUnsupported,
    #[error("failed to install signal handlers: {0}")]
    Signals(std::io::Error),
    #[error("failed to shut down within {} seconds", FINAL_SHUTDOWN_TIMEOUT.as_secs())]
    ShutdownTimeout,
}

impl ServiceError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ServiceError::ConfigDir(_) => 1,
            ServiceError::TempDir(_) | ServiceError::ChunkStore(_) => 2,
            ServiceError::Config(_) | ServiceError::Signals(_) => 3,
            ServiceError::Cache(_) => 4,
            ServiceError::Remote(_) => 5,
            ServiceError::Mount(_) | ServiceError::MountUnsupported => 6,
            ServiceError::ShutdownTimeout => 7,
        }
    }
}

/// Handle for gracefully shutting down the service.
pub struct ShutdownHandle {
    graceful_waiter: tokio::task::JoinHandle<()>,
    handles: Vec<tokio::task::JoinHandle<()>>,
    shutdown_tx: watch::Sender<()>,
    chunks: Arc<ChunkManager>,
    #[cfg(feature = "fuse")]
    session: Option<fuser::BackgroundSession>,
}

impl ShutdownHandle {
    /// Block until the service shuts down (via signal or explicit shutdown),
    /// then unmount and join every background task.
    pub async fn wait(mut self) -> Result<(), ServiceError> {
        let _ = (&mut self.graceful_waiter).await;
        tracing::info!("shutting down");

        #[cfg(feature = "fuse")]
        if let Some(session) = self.session.take() {
            // dropping the session unmounts
            tokio::task::block_in_place(move || drop(session));
        }

        let chunks = self.chunks.clone();
        let mut tasks = std::mem::take(&mut self.handles);
        tasks.push(tokio::spawn(async move { chunks.join().await }));
        shutdown_and_join(tasks).await
    }

    /// Trigger shutdown programmatically.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Initialize logging, panic handler, and build info reporting.
/// Returns guards that must be kept alive for the duration of the program.
fn init_logging(
    service_config: &ServiceConfig,
) -> Vec<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::fmt::format::FmtSpan;

    let mut guards = Vec::new();

    // Stdout layer
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(stdout_guard);

    let stdout_env_filter = EnvFilter::builder()
        .with_default_directive(service_config.log_level.into())
        .from_env_lossy();

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(stdout_writer)
        .with_filter(stdout_env_filter);

    // File layer (if log_dir is set)
    if let Some(log_dir) = &service_config.log_dir {
        if let Err(e) = std::fs::create_dir_all(log_dir) {
            eprintln!(
                "Warning: Failed to create log directory {:?}: {}",
                log_dir, e
            );
        }

        let file_appender = tracing_appender::rolling::daily(log_dir, "drivefs.log");
        let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        guards.push(file_guard);

        let file_env_filter = EnvFilter::builder()
            .with_default_directive(service_config.log_level.into())
            .from_env_lossy();

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(file_env_filter);

        tracing_subscriber::registry()
            .with(stdout_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry().with(stdout_layer).init();
    }

    utils::register_panic_logger();
    utils::report_build_info();

    guards
}

/// Metadata side of the service: the cache, its poller and the mount root.
struct Metadata {
    cache: Arc<MetadataCache>,
    poller: Arc<ChangesPoller>,
    root: Object,
    client: DriveClient,
}

async fn open_metadata(service_config: &ServiceConfig) -> Result<Metadata, ServiceError> {
    let credentials_path = service_config.credentials_path();
    let token_path = service_config.token_path();
    let http = reqwest::Client::new();

    let credentials = credentials::load_or_prompt_credentials(
        &credentials_path,
        &mut std::io::stdin().lock(),
        &mut std::io::stdout(),
    )?;
    let token = credentials::load_or_authorize_token(
        &token_path,
        &http,
        &credentials,
        &mut std::io::stdin().lock(),
        &mut std::io::stdout(),
    )
    .await?;

    let store = MetadataStore::open(&service_config.cache_path())
        .await
        .map_err(ServiceError::Cache)?;

    let tokens = RefreshingTokenSource::new(http.clone(), credentials, token, Some(token_path))
        .map_err(ServiceError::Remote)?;
    let client = DriveClient::new(http, Arc::new(tokens));
    let remote = Arc::new(client.clone());

    let cache = Arc::new(MetadataCache::new(store.clone(), remote.clone()));
    let root = cache
        .resolve_root(&service_config.root_node_id)
        .await
        .map_err(ServiceError::Remote)?;

    // the poller fills in the rest; a failed warm-up only delays the first listing
    if let Err(e) = cache.sync_children(&root.object_id).await {
        tracing::warn!(root = %root.object_id, error = %e, "could not list root folder");
    }

    let poller = Arc::new(ChangesPoller::new(
        store,
        remote,
        service_config.refresh_interval,
    ));

    Ok(Metadata {
        cache,
        poller,
        root,
        client,
    })
}

/// Create local state, connect to the remote drive, spawn background tasks
/// and mount the filesystem.
pub async fn start_service(service_config: &ServiceConfig) -> Result<ShutdownHandle, ServiceError> {
    std::fs::create_dir_all(&service_config.config_dir).map_err(ServiceError::ConfigDir)?;
    std::fs::create_dir_all(service_config.chunks_dir()).map_err(ServiceError::TempDir)?;

    let metadata = open_metadata(service_config).await?;

    let (graceful_waiter, shutdown_tx, shutdown_rx) =
        utils::graceful_shutdown_blocker().map_err(ServiceError::Signals)?;

    let chunk_config = service_config.chunks.clone();
    let store = ChunkStore::open(
        &service_config.chunks_dir(),
        chunk_config.chunk_size,
        chunk_config.max_chunks,
        chunk_config.mmap,
    )
    .map_err(ServiceError::ChunkStore)?;
    let store = Arc::new(store);
    let downloader = Arc::new(Downloader::from_client(&metadata.client));
    let chunks = Arc::new(
        ChunkManager::start(chunk_config, store.clone(), downloader, shutdown_rx.clone())
            .map_err(ServiceError::ChunkStore)?,
    );

    let mut handles = Vec::new();

    // Changes poller
    let poller = metadata.poller.clone();
    let poller_rx = shutdown_rx.clone();
    handles.push(tokio::spawn(async move { poller.run(poller_rx).await }));

    // Janitor; the chunk store owns its backing file
    let janitor = Janitor::new(
        service_config.chunks_dir(),
        service_config.clear_interval,
        JanitorMode::PruneOnly,
    )
    .protect(store.path());
    let janitor_rx = shutdown_rx.clone();
    handles.push(tokio::spawn(async move { janitor.run(janitor_rx).await }));

    #[cfg(feature = "fuse")]
    let session = {
        let fs = crate::fuse::DriveFs::new(
            tokio::runtime::Handle::current(),
            metadata.cache.clone(),
            chunks.clone(),
            &metadata.root,
            service_config.uid.unwrap_or_else(|| unsafe { libc::getuid() }),
            service_config.gid.unwrap_or_else(|| unsafe { libc::getgid() }),
        );
        match crate::fuse::mount(fs, &service_config.mountpoint, &service_config.fuse_options) {
            Ok(session) => Some(session),
            Err(e) => {
                let _ = shutdown_tx.send(());
                return Err(ServiceError::Mount(e));
            }
        }
    };

    #[cfg(not(feature = "fuse"))]
    {
        let _ = shutdown_tx.send(());
        let _ = (&metadata.cache, &metadata.root);
        return Err(ServiceError::MountUnsupported);
    }

    #[cfg(feature = "fuse")]
    {
        tracing::info!(
            mountpoint = %service_config.mountpoint.display(),
            root = %metadata.root.object_id,
            "drive mounted"
        );

        Ok(ShutdownHandle {
            graceful_waiter,
            handles,
            shutdown_tx,
            chunks,
            session,
        })
    }
}

/// Join all handles with timeout.
async fn shutdown_and_join(
    handles: Vec<tokio::task::JoinHandle<()>>,
) -> Result<(), ServiceError> {
    if timeout(FINAL_SHUTDOWN_TIMEOUT, join_all(handles))
        .await
        .is_err()
    {
        return Err(ServiceError::ShutdownTimeout);
    }
    Ok(())
}

/// Runs the service until a shutdown signal is received. Logs any failure
/// before returning it, so the caller only has to pick the exit code.
pub async fn spawn_service(service_config: &ServiceConfig) -> Result<(), ServiceError> {
    let _guards = init_logging(service_config);

    let result = match start_service(service_config).await {
        Ok(handle) => handle.wait().await,
        Err(e) => Err(e),
    };
    if let Err(e) = &result {
        tracing::error!(exit_code = e.exit_code(), "{}", e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_follow_startup_order() {
        let io = || std::io::Error::other("boom");
        assert_eq!(ServiceError::ConfigDir(io()).exit_code(), 1);
        assert_eq!(ServiceError::TempDir(io()).exit_code(), 2);
        assert_eq!(
            ServiceError::ChunkStore(common::Error::Integrity("slot".into())).exit_code(),
            2
        );
        assert_eq!(
            ServiceError::Config(ConfigError::Empty("client id")).exit_code(),
            3
        );
        assert_eq!(
            ServiceError::Cache(common::Error::NotFound("db".into())).exit_code(),
            4
        );
        assert_eq!(
            ServiceError::Remote(common::Error::QuotaExceeded).exit_code(),
            5
        );
        assert_eq!(ServiceError::Mount(io()).exit_code(), 6);
    }
}
