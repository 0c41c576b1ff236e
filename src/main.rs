use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use cloudgw::cache::BlockCache;
use cloudgw::config::{AppConfig, CliArgs};
use cloudgw::fuse_fs::BlockFs;
use cloudgw::metadata::MetadataDb;
use cloudgw::store::LocalObjectStore;

fn main() -> Result<()> {
    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();
    let config = AppConfig::from_args(&args)?;
    config.ensure_dirs()?;
    info!(data_dir = ?config.data_dir, "Starting cloudgw");

    let db = Arc::new(MetadataDb::open(&config.db_path)?);
    info!("Opened metadata database at {:?}", config.db_path);

    let store = Arc::new(LocalObjectStore::new(config.store_dir.clone())?);
    info!("Object store at {:?}", config.store_dir);

    let cache = Arc::new(BlockCache::new(config.cache_config(), db.clone(), store)?);
    let fs = BlockFs::new(db, Arc::clone(&cache), config.max_obj_size);
    info!(block_size = fs.block_size(), "Block file system ready");
    let result = flush(&fs, args.stats_only);
    cache.destroy();
    result?;

    let stats = fs.cache_stats();
    let totals = fs.fs_stats()?;
    println!("Directory entries:    {}", totals.entries);
    println!("Inodes:               {}", totals.inodes);
    println!("Data objects:         {}", totals.objects);
    println!("Total data size:      {}", totals.fs_size);
    println!("After de-duplication: {}", totals.dedup_size);
    println!("Stored size:          {}", totals.stored_size);
    println!(
        "Cache:                {} entries, {} bytes ({} dirty entries, {} dirty bytes)",
        stats.entries, stats.size, stats.dirty_entries, stats.dirty_size
    );

    info!("Done.");
    Ok(())
}

/// Adopt the staged blocks and, unless only statistics are wanted, upload
/// every dirty one and wait for the backend to settle.
fn flush(fs: &BlockFs, stats_only: bool) -> Result<()> {
    let loaded = fs.cache().load_staged()?;
    info!(loaded, "Adopted staged blocks");
    if !fs.check_quota()? {
        warn!("File system exceeds its quota, writes disabled");
    }
    if stats_only {
        return Ok(());
    }
    fs.commit_all_dirty()?;
    fs.cache().wait_idle();
    info!("All dirty blocks uploaded");
    Ok(())
}
