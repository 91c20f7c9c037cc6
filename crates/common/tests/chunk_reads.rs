//! Integration tests for chunked reads through the manager, store and downloader

mod common;

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::time::Duration;

use axum::http::StatusCode;

use ::common::chunk::{ChunkConfig, ChunkId, HEADER_SIZE};
use ::common::Error;

const CHUNK: u64 = 64 * 1024;

fn config(load_ahead: usize) -> ChunkConfig {
    ChunkConfig {
        chunk_size: CHUNK,
        max_chunks: 4,
        load_ahead,
        threads: 4,
        timeout: Duration::from_secs(5),
        timeout_retries: 1,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_cold_read_fetches_chunk_and_read_ahead() {
    let content = common::pattern(2 * CHUNK as usize);
    let env = common::setup_chunks(content.clone(), config(1)).await;
    let object = env.server.object("obj");

    let data = env.manager.read(&object, 0, CHUNK / 4).await.unwrap();
    assert_eq!(data.as_ref(), &content[..(CHUNK / 4) as usize]);

    let store = env.store.clone();
    assert!(
        common::eventually(|| {
            store.contains(&ChunkId::new("obj", 0)) && store.contains(&ChunkId::new("obj", CHUNK))
        })
        .await
    );
    assert_eq!(env.server.state.hits(0), 1);
    assert_eq!(env.server.state.hits(CHUNK), 1);
}

#[tokio::test]
async fn test_overlapping_reads_share_one_download() {
    let content = common::pattern(4 * CHUNK as usize);
    let env = common::setup_chunks(content.clone(), config(0)).await;
    *env.server.state.delay.lock() = Some(Duration::from_millis(50));
    let object = env.server.object("obj");

    let (a, b) = tokio::join!(
        env.manager.read(&object, 0, 2 * CHUNK),
        env.manager.read(&object, CHUNK, 2 * CHUNK)
    );
    assert_eq!(a.unwrap().as_ref(), &content[..2 * CHUNK as usize]);
    assert_eq!(
        b.unwrap().as_ref(),
        &content[CHUNK as usize..3 * CHUNK as usize]
    );
    assert_eq!(env.server.state.hits(0), 1);
    assert_eq!(env.server.state.hits(CHUNK), 1);
    assert_eq!(env.server.state.hits(2 * CHUNK), 1);
}

#[tokio::test]
async fn test_unaligned_read_of_tail() {
    let len = 3 * CHUNK as usize - 123;
    let content = common::pattern(len);
    let env = common::setup_chunks(content.clone(), config(0)).await;
    let object = env.server.object("obj");

    let offset = CHUNK - 10;
    let data = env.manager.read(&object, offset, 10 * CHUNK).await.unwrap();
    assert_eq!(data.as_ref(), &content[offset as usize..]);
}

#[tokio::test]
async fn test_corrupt_chunk_is_refetched() {
    let content = common::pattern(CHUNK as usize);
    let env = common::setup_chunks(
        content.clone(),
        ChunkConfig {
            mmap: false,
            ..config(0)
        },
    )
    .await;
    let object = env.server.object("obj");

    env.manager.read(&object, 0, 100).await.unwrap();
    assert!(env.store.contains(&ChunkId::new("obj", 0)));

    // flip body bytes of every slot so whichever holds the chunk fails its CRC
    let file = OpenOptions::new()
        .write(true)
        .open(env.store.path())
        .unwrap();
    for slot in 0..env.store.max_chunks() as u64 {
        let pos = slot * (HEADER_SIZE as u64 + CHUNK) + HEADER_SIZE as u64;
        file.write_all_at(&[0xff; 8], pos).unwrap();
    }

    let data = env.manager.read(&object, 0, 100).await.unwrap();
    assert_eq!(data.as_ref(), &content[..100]);
    assert_eq!(env.server.state.hits(0), 2);

    // re-populated, so the next read is a hit
    env.manager.read(&object, 0, 100).await.unwrap();
    assert_eq!(env.server.state.hits(0), 2);
}

#[tokio::test]
async fn test_store_stays_bounded() {
    let content = common::pattern(10 * CHUNK as usize);
    let env = common::setup_chunks(content.clone(), config(0)).await;
    let object = env.server.object("obj");

    for n in 0..10 {
        let data = env.manager.read(&object, n * CHUNK, CHUNK).await.unwrap();
        assert_eq!(data.len() as u64, CHUNK);
        assert!(env.store.len() <= 4);
    }
    assert_eq!(env.store.len(), 4);
}

#[tokio::test]
async fn test_download_error_reaches_reader() {
    let content = common::pattern(CHUNK as usize);
    let env = common::setup_chunks(content, config(0)).await;
    env.server
        .state
        .push_response(StatusCode::NOT_FOUND, "fileNotFound");
    let object = env.server.object("obj");

    let err = env.manager.read(&object, 0, 10).await.unwrap_err();
    assert!(matches!(err, Error::Protocol { status: 404 }));

    // the failure is not cached
    assert!(env.manager.read(&object, 0, 10).await.is_ok());
}
