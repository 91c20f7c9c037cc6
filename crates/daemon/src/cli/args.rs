pub use clap::Parser;

use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;

use common::chunk::ChunkConfig;
use drivefs_daemon::service_config::{default_config_dir, default_temp_dir, ConfigError};
use drivefs_daemon::ServiceConfig;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<Verbosity> for tracing::Level {
    fn from(v: Verbosity) -> Self {
        match v {
            Verbosity::Error => tracing::Level::ERROR,
            Verbosity::Warn => tracing::Level::WARN,
            Verbosity::Info => tracing::Level::INFO,
            Verbosity::Debug => tracing::Level::DEBUG,
            Verbosity::Trace => tracing::Level::TRACE,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "drivefs")]
#[command(version, about = "Mount a Google Drive as a local filesystem")]
pub struct Args {
    /// Directory to mount the drive on
    pub mountpoint: PathBuf,

    #[arg(long, value_enum, default_value_t = Verbosity::Info)]
    pub verbosity: Verbosity,

    /// Holds config.json, token.json and cache.db (defaults to ~/.drivefs)
    #[arg(long)]
    pub config_dir: Option<PathBuf>,

    /// Holds the chunk store (defaults to <system temp>/drivefs)
    #[arg(long)]
    pub temp_dir: Option<PathBuf>,

    /// Bytes per chunk; at least 4096 and a multiple of 1024
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    pub chunk_size: u64,

    /// Interval between passes over the remote changes feed
    #[arg(long, default_value = "1m", value_parser = humantime::parse_duration)]
    pub refresh_interval: Duration,

    /// Interval between sweeps of the chunk directory
    #[arg(long, default_value = "1m", value_parser = humantime::parse_duration)]
    pub clear_interval: Duration,

    /// Age after which loose chunk files are swept
    #[arg(long, default_value = "30m", value_parser = humantime::parse_duration)]
    pub chunk_age: Duration,

    /// Chunks kept on disk
    #[arg(long, default_value_t = 10)]
    pub max_chunks: usize,

    /// Chunks preloaded after each read
    #[arg(long, default_value_t = 3)]
    pub load_ahead: usize,

    /// Concurrent downloads (defaults to the number of CPUs)
    #[arg(long)]
    pub threads: Option<usize>,

    /// Deadline for one wait on a chunk
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,

    /// Extra waits on a chunk before a read fails
    #[arg(long, default_value_t = 3)]
    pub timeout_retries: usize,

    /// Remote folder shown at the mount root
    #[arg(long, default_value = "root")]
    pub root_node_id: String,

    /// Owner of every file (defaults to the current user)
    #[arg(long)]
    pub uid: Option<u32>,

    /// Group of every file (defaults to the current group)
    #[arg(long)]
    pub gid: Option<u32>,

    /// Extra mount options, comma separated
    #[arg(short = 'o', long = "fuse-options", value_delimiter = ',')]
    pub fuse_options: Vec<String>,

    /// Pending chunk requests per priority tier
    #[arg(long, default_value_t = 100)]
    pub queue_capacity: usize,

    /// Priority dequeues after which one read-ahead is serviced
    #[arg(long, default_value_t = 8)]
    pub fairness: usize,

    /// Use positional file I/O instead of memory mapping the chunk store
    #[arg(long)]
    pub no_mmap: bool,

    /// Directory for log files (logs to stdout only if not set)
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

impl Args {
    pub fn into_config(self) -> Result<ServiceConfig, ConfigError> {
        let threads = self.threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });

        let config_dir = match self.config_dir {
            Some(dir) => dir,
            None => default_config_dir()?,
        };

        let config = ServiceConfig {
            mountpoint: self.mountpoint,
            config_dir,
            temp_dir: self.temp_dir.unwrap_or_else(default_temp_dir),
            chunks: ChunkConfig {
                chunk_size: self.chunk_size,
                max_chunks: self.max_chunks,
                load_ahead: self.load_ahead,
                threads,
                timeout: self.timeout,
                timeout_retries: self.timeout_retries,
                queue_capacity: self.queue_capacity,
                fairness: self.fairness,
                mmap: !self.no_mmap,
            },
            refresh_interval: self.refresh_interval,
            clear_interval: self.clear_interval,
            chunk_age: self.chunk_age,
            root_node_id: self.root_node_id,
            uid: self.uid,
            gid: self.gid,
            fuse_options: self.fuse_options,
            log_level: self.verbosity.into(),
            log_dir: self.log_dir,
        };
        config.validate()?;
        Ok(config)
    }
}
