//! Shared test utilities for chunk and metadata integration tests
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::header::{AUTHORIZATION, CONTENT_RANGE, RANGE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::watch;

use ::common::chunk::{ChunkConfig, ChunkManager, ChunkStore, Downloader, RetryPolicy};
use ::common::drive::StaticTokenSource;
use ::common::object::Object;

pub const TOKEN: &str = "test-token";

/// State behind the fake download endpoint.
#[derive(Default)]
pub struct ServerState {
    pub content: Vec<u8>,
    /// Responses served before any ranged body, in order
    pub script: Mutex<VecDeque<(StatusCode, String)>>,
    /// Ranged requests per start offset
    pub hits: Mutex<HashMap<u64, usize>>,
    pub requests: AtomicUsize,
    pub delay: Mutex<Option<Duration>>,
}

impl ServerState {
    pub fn hits(&self, start: u64) -> usize {
        self.hits.lock().get(&start).copied().unwrap_or(0)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn push_response(&self, status: StatusCode, body: &str) {
        self.script.lock().push_back((status, body.to_string()));
    }
}

pub struct RemoteServer {
    pub base: String,
    pub state: Arc<ServerState>,
}

impl RemoteServer {
    pub fn object(&self, id: &str) -> Arc<Object> {
        Arc::new(Object {
            object_id: id.to_string(),
            name: format!("{}.bin", id),
            is_dir: false,
            size: self.state.content.len() as u64,
            last_modified: Utc::now(),
            download_url: format!("{}/files/{}?alt=media", self.base, id),
            parents: vec!["root".to_string()],
            can_trash: true,
        })
    }
}

/// Deterministic object body.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn parse_range(value: &str) -> Option<(u64, u64)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

async fn download(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    state.requests.fetch_add(1, Ordering::SeqCst);

    let authorized = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {}", TOKEN));
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let scripted = state.script.lock().pop_front();
    if let Some((status, body)) = scripted {
        return (status, body).into_response();
    }

    let delay = *state.delay.lock();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    let Some((start, end)) = headers
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range)
    else {
        return (StatusCode::OK, state.content.clone()).into_response();
    };
    *state.hits.lock().entry(start).or_default() += 1;

    let len = state.content.len() as u64;
    let end = end.min(len - 1);
    (
        StatusCode::PARTIAL_CONTENT,
        [(CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, len))],
        state.content[start as usize..=end as usize].to_vec(),
    )
        .into_response()
}

/// Serve `content` for every `/files/{id}` on an ephemeral local port.
pub async fn spawn_server(content: Vec<u8>) -> RemoteServer {
    let state = Arc::new(ServerState {
        content,
        ..Default::default()
    });
    let app = Router::new()
        .route("/files/:id", get(download))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    RemoteServer {
        base: format!("http://{}", addr),
        state,
    }
}

/// Downloader with millisecond backoff.
pub fn downloader(base_delay: Duration) -> Downloader {
    Downloader::new(
        reqwest::Client::new(),
        Arc::new(StaticTokenSource(TOKEN.to_string())),
    )
    .with_policy(RetryPolicy {
        base_delay,
        max_retries: 4,
    })
}

pub struct ChunkEnv {
    pub manager: ChunkManager,
    pub store: Arc<ChunkStore>,
    pub server: RemoteServer,
    pub shutdown: watch::Sender<()>,
    _dir: TempDir,
}

/// Chunk manager wired to a local server serving `content`.
pub async fn setup_chunks(content: Vec<u8>, config: ChunkConfig) -> ChunkEnv {
    let server = spawn_server(content).await;
    let dir = TempDir::new().unwrap();
    let store = Arc::new(
        ChunkStore::open(
            &dir.path().join("chunks"),
            config.chunk_size,
            config.max_chunks,
            config.mmap,
        )
        .unwrap(),
    );
    let (shutdown, rx) = watch::channel(());
    let fetcher = Arc::new(downloader(Duration::from_millis(5)));
    let manager = ChunkManager::start(config, store.clone(), fetcher, rx).unwrap();

    ChunkEnv {
        manager,
        store,
        server,
        shutdown,
        _dir: dir,
    }
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
