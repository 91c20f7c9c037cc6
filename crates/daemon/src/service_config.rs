use std::path::PathBuf;
use std::time::Duration;

use common::chunk::ChunkConfig;

/// Directory under the home directory holding credentials and the metadata cache.
pub const CONFIG_DIR_NAME: &str = ".drivefs";
/// Directory under the system temp dir holding the chunk store.
pub const TEMP_DIR_NAME: &str = "drivefs";

pub const CREDENTIALS_FILE: &str = "config.json";
pub const TOKEN_FILE: &str = "token.json";
pub const CACHE_FILE: &str = "cache.db";
pub const CHUNKS_DIR: &str = "chunks";

#[derive(Debug, Clone)]
pub struct Config {
    /// Where the filesystem is mounted
    pub mountpoint: PathBuf,

    // local state
    /// Holds `config.json`, `token.json` and `cache.db`
    pub config_dir: PathBuf,
    /// Holds the chunk store under `chunks/`
    pub temp_dir: PathBuf,

    // chunk subsystem
    pub chunks: ChunkConfig,

    // background tasks
    /// Interval between passes over the remote changes feed
    pub refresh_interval: Duration,
    /// Interval between sweeps of the chunk directory
    pub clear_interval: Duration,
    /// Loose chunk files older than this are swept
    pub chunk_age: Duration,

    // filesystem presentation
    /// Remote folder id (or alias) shown at the mount root
    pub root_node_id: String,
    /// Owner reported for every inode, the process uid if not set
    pub uid: Option<u32>,
    /// Group reported for every inode, the process gid if not set
    pub gid: Option<u32>,
    /// Passed through to the mount verbatim
    pub fuse_options: Vec<String>,

    // logging
    pub log_level: tracing::Level,
    /// Directory for log files (optional, logs to stdout only if not set)
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine the home directory")]
    NoHomeDirectory,
    #[error(transparent)]
    Invalid(#[from] common::Error),
    #[error("authorization failed: {0}")]
    Authorization(common::Error),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.chunks.validate()?;
        if self.root_node_id.is_empty() {
            return Err(ConfigError::Empty("root node id"));
        }
        Ok(())
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.config_dir.join(CREDENTIALS_FILE)
    }

    pub fn token_path(&self) -> PathBuf {
        self.config_dir.join(TOKEN_FILE)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.config_dir.join(CACHE_FILE)
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.temp_dir.join(CHUNKS_DIR)
    }
}

pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::NoHomeDirectory)?;
    Ok(home.join(CONFIG_DIR_NAME))
}

pub fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join(TEMP_DIR_NAME)
}
