//! Startup failures and their exit codes
//!
//! These tests stop before the remote drive is contacted or anything is
//! mounted, so they need neither network access nor FUSE privileges.

use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;

use common::chunk::ChunkConfig;
use drivefs_daemon::{start_service, ServiceConfig, ServiceError};

fn config(root: &Path) -> ServiceConfig {
    ServiceConfig {
        mountpoint: root.join("mnt"),
        config_dir: root.join("config"),
        temp_dir: root.join("temp"),
        chunks: ChunkConfig {
            chunk_size: 64 * 1024,
            max_chunks: 4,
            load_ahead: 1,
            ..Default::default()
        },
        refresh_interval: Duration::from_secs(60),
        clear_interval: Duration::from_secs(60),
        chunk_age: Duration::from_secs(1800),
        root_node_id: "root".to_string(),
        uid: None,
        gid: None,
        fuse_options: Vec::new(),
        log_level: tracing::Level::INFO,
        log_dir: None,
    }
}

fn write_credentials(config_dir: &Path) {
    std::fs::create_dir_all(config_dir).unwrap();
    std::fs::write(
        config_dir.join("config.json"),
        r#"{"client_id":"id","client_secret":"secret"}"#,
    )
    .unwrap();
    std::fs::write(
        config_dir.join("token.json"),
        r#"{"access_token":"a","refresh_token":"r","expiry":"2030-01-01T00:00:00Z","token_type":"Bearer"}"#,
    )
    .unwrap();
}

async fn start_err(config: &ServiceConfig) -> ServiceError {
    match start_service(config).await {
        Ok(_) => panic!("service started unexpectedly"),
        Err(e) => e,
    }
}

#[tokio::test]
async fn test_unusable_config_dir_exits_1() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path());
    std::fs::write(&config.config_dir, b"not a directory").unwrap();

    let err = start_err(&config).await;
    assert!(matches!(err, ServiceError::ConfigDir(_)));
    assert_eq!(err.exit_code(), 1);
}

#[tokio::test]
async fn test_unusable_temp_dir_exits_2() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path());
    std::fs::write(&config.temp_dir, b"not a directory").unwrap();

    let err = start_err(&config).await;
    assert!(matches!(err, ServiceError::TempDir(_)));
    assert_eq!(err.exit_code(), 2);
    // the config dir was created before the failure
    assert!(config.config_dir.is_dir());
}

#[tokio::test]
async fn test_malformed_credentials_exit_3() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path());
    std::fs::create_dir_all(&config.config_dir).unwrap();
    std::fs::write(config.credentials_path(), b"{").unwrap();

    let err = start_err(&config).await;
    assert!(matches!(err, ServiceError::Config(_)));
    assert_eq!(err.exit_code(), 3);
    assert!(config.chunks_dir().is_dir());
}

#[tokio::test]
async fn test_unopenable_cache_exits_4() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path());
    write_credentials(&config.config_dir);
    std::fs::create_dir_all(config.cache_path()).unwrap();

    let err = start_err(&config).await;
    assert!(matches!(err, ServiceError::Cache(_)));
    assert_eq!(err.exit_code(), 4);
}
