use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

const GIB: u64 = 1024 * 1024 * 1024;

/// Config file (TOML). All fields optional; CLI args take precedence.
/// Default location: `{config_dir}/cloudgw/config.toml`
/// (Linux: `~/.config/cloudgw/config.toml`)
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    pub data_dir: Option<PathBuf>,
    pub store_dir: Option<PathBuf>,
    pub cache_size: Option<u64>,
    pub cache_entries: Option<usize>,
    pub max_open_entries: Option<usize>,
    pub upload_threads: Option<usize>,
    pub removal_threads: Option<usize>,
    pub quota: Option<u64>,
    pub max_obj_size: Option<u64>,
    /// Seconds a dirty block must sit idle before background upload.
    pub commit_delay: Option<u64>,
}

impl ConfigFile {
    fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                eprintln!("Warning: failed to parse config file {path:?}: {e}");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }
}

/// cloudgw: flush a gateway block cache to its object store.
#[derive(Parser, Debug)]
#[command(name = "cloudgw", about = "Cloud gateway block cache maintenance")]
pub struct CliArgs {
    /// Path to config file (default: {config_dir}/cloudgw/config.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Data directory holding the metadata database and the cache.
    #[arg(short, long)]
    pub data_dir: Option<PathBuf>,

    /// Directory of the local object store backend.
    #[arg(short, long)]
    pub store_dir: Option<PathBuf>,

    /// Cache size limit in bytes.
    #[arg(long)]
    pub cache_size: Option<u64>,

    /// Maximum number of cached blocks.
    #[arg(long)]
    pub cache_entries: Option<usize>,

    /// Number of upload worker threads (0 uploads synchronously).
    #[arg(long)]
    pub upload_threads: Option<usize>,

    /// Number of removal worker threads (0 removes synchronously).
    #[arg(long)]
    pub removal_threads: Option<usize>,

    /// Only print statistics, do not upload anything.
    #[arg(long)]
    pub stats_only: bool,
}

/// Tunables of the block cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub cache_dir: PathBuf,
    pub max_size: u64,
    pub max_entries: usize,
    pub max_open_entries: usize,
    /// Number of staging subdirectories.
    pub shard_count: u64,
    pub upload_threads: usize,
    pub removal_threads: usize,
    pub removal_queue_len: usize,
    pub fullspeed_factor: f64,
    pub fullspeed_gap: u64,
    pub upload_retry_delay: Duration,
    pub download_attempts: u32,
    pub download_retry_delay: Duration,
    pub commit_delay: Duration,
    pub close_idle_after: Duration,
    pub commit_interval: Duration,
    pub worker_check_interval: Duration,
    pub quota: u64,
}

impl CacheConfig {
    /// Defaults for a cache staged below `cache_dir`.
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            max_size: GIB,
            max_entries: 768,
            max_open_entries: 250_000,
            shard_count: 100,
            upload_threads: 1,
            removal_threads: 10,
            removal_queue_len: 1024,
            fullspeed_factor: 0.8,
            fullspeed_gap: GIB,
            upload_retry_delay: Duration::from_secs(10),
            download_attempts: 10,
            download_retry_delay: Duration::from_secs(5),
            commit_delay: Duration::from_secs(60),
            close_idle_after: Duration::from_secs(360),
            commit_interval: Duration::from_secs(5),
            worker_check_interval: Duration::from_secs(300),
            quota: 10 * 1024 * GIB,
        }
    }
}

/// Resolved application configuration.
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub store_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub db_path: PathBuf,
    pub cache_size: u64,
    pub cache_entries: usize,
    pub max_open_entries: usize,
    pub upload_threads: usize,
    pub removal_threads: usize,
    pub quota: u64,
    pub max_obj_size: u64,
    pub commit_delay_secs: u64,
}

impl AppConfig {
    pub fn from_args(args: &CliArgs) -> anyhow::Result<Self> {
        let config_path = args.config.clone().or_else(|| {
            directories::ProjectDirs::from("", "", "cloudgw")
                .map(|p| p.config_dir().join("config.toml"))
        });
        let cfg = config_path
            .as_deref()
            .map(ConfigFile::load)
            .unwrap_or_default();
        Self::resolve(args, cfg)
    }

    fn resolve(args: &CliArgs, cfg: ConfigFile) -> anyhow::Result<Self> {
        // Data directory (CLI > config > platform default)
        let data_dir = args
            .data_dir
            .clone()
            .or(cfg.data_dir)
            .or_else(|| {
                directories::ProjectDirs::from("", "", "cloudgw")
                    .map(|p| p.data_dir().to_path_buf())
            })
            .ok_or_else(|| anyhow::anyhow!("Cannot determine data directory"))?;

        let store_dir = args
            .store_dir
            .clone()
            .or(cfg.store_dir)
            .unwrap_or_else(|| data_dir.join("objects"));
        let cache_dir = data_dir.join("cache");
        let db_path = data_dir.join("metadata.db");

        let defaults = CacheConfig::new(cache_dir.clone());
        let max_obj_size = cfg.max_obj_size.unwrap_or(4 * 1024 * 1024);
        if max_obj_size == 0 {
            anyhow::bail!("max_obj_size must be positive");
        }

        Ok(Self {
            data_dir,
            store_dir,
            cache_dir,
            db_path,
            cache_size: args
                .cache_size
                .or(cfg.cache_size)
                .unwrap_or(defaults.max_size),
            cache_entries: args
                .cache_entries
                .or(cfg.cache_entries)
                .unwrap_or(defaults.max_entries),
            max_open_entries: cfg.max_open_entries.unwrap_or(defaults.max_open_entries),
            upload_threads: args
                .upload_threads
                .or(cfg.upload_threads)
                .unwrap_or(defaults.upload_threads),
            removal_threads: args
                .removal_threads
                .or(cfg.removal_threads)
                .unwrap_or(defaults.removal_threads),
            quota: cfg.quota.unwrap_or(defaults.quota),
            max_obj_size,
            commit_delay_secs: cfg
                .commit_delay
                .unwrap_or(defaults.commit_delay.as_secs()),
        })
    }

    /// Cache tunables derived from this configuration.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_size: self.cache_size,
            max_entries: self.cache_entries,
            max_open_entries: self.max_open_entries,
            upload_threads: self.upload_threads,
            removal_threads: self.removal_threads,
            quota: self.quota,
            commit_delay: Duration::from_secs(self.commit_delay_secs),
            ..CacheConfig::new(self.cache_dir.clone())
        }
    }

    /// Ensure all required directories exist.
    pub fn ensure_dirs(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.store_dir)?;
        std::fs::create_dir_all(&self.cache_dir)?;
        Ok(())
    }
}
