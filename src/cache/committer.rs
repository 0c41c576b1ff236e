use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::retry::ShutdownToken;
use super::BlockCache;

/// Pause after a failed probe before uploading is attempted again.
const NETWORK_BACKOFF: Duration = Duration::from_secs(60);

/// Background thread that uploads idle dirty blocks and keeps the cache tidy.
///
/// Every `commit_interval` it closes idle descriptors, uploads blocks that
/// have not been touched for `commit_delay` (when uploading is switched on,
/// forced or requested for a snapshot), re-checks the counters and
/// periodically restarts dead workers.
pub struct Committer {
    stop: ShutdownToken,
    handle: Option<JoinHandle<()>>,
}

impl Committer {
    pub fn spawn(cache: Arc<BlockCache>) -> io::Result<Self> {
        let stop = ShutdownToken::new();
        let token = stop.clone();
        let handle = thread::Builder::new()
            .name("committer".into())
            .spawn(move || run(&cache, &token))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for the current pass to finish.
    pub fn stop(mut self) {
        self.join();
    }

    fn join(&mut self) {
        self.stop.trigger();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Committer thread panicked");
            }
        }
    }
}

impl Drop for Committer {
    fn drop(&mut self) {
        self.join();
    }
}

fn run(cache: &BlockCache, stop: &ShutdownToken) {
    let interval = cache.config().commit_interval;
    let check_interval = cache.config().worker_check_interval;
    let cache_down = cache.shutdown_token();
    let mut last_check = Instant::now();
    info!(interval_ms = interval.as_millis() as u64, "Committer started");

    loop {
        if stop.sleep(interval) || cache_down.is_triggered() {
            break;
        }

        cache.close_idle();

        if cache.should_upload() {
            match cache.upload_idle() {
                Ok(0) => {}
                Ok(uploaded) => debug!(uploaded, "Background upload pass"),
                Err(e) => error!(error = %e, "Background upload failed"),
            }
            if !cache.stats().network_ok {
                warn!(backoff_secs = NETWORK_BACKOFF.as_secs(), "Backend unreachable, pausing uploads");
                if stop.sleep(NETWORK_BACKOFF) {
                    break;
                }
            }
        }

        cache.reconcile();

        if last_check.elapsed() >= check_interval {
            let restarted = cache.check_workers();
            if restarted > 0 {
                warn!(restarted, "Restarted dead cache workers");
            }
            last_check = Instant::now();
        }
    }

    info!("Committer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::metadata::MetadataDb;
    use crate::store::MemoryObjectStore;
    use tempfile::TempDir;

    fn setup() -> (Arc<BlockCache>, Arc<MemoryObjectStore>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            shard_count: 4,
            upload_threads: 1,
            removal_threads: 1,
            commit_delay: Duration::ZERO,
            commit_interval: Duration::from_millis(10),
            ..CacheConfig::new(dir.path().join("cache"))
        };
        let db = Arc::new(MetadataDb::open_memory().unwrap());
        let store = Arc::new(MemoryObjectStore::new());
        let cache = Arc::new(BlockCache::new(config, db, store.clone()).unwrap());
        (cache, store, dir)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_uploads_when_enabled() {
        let (cache, store, _dir) = setup();
        cache.get(2, 0).unwrap().write(0, b"background").unwrap();
        let committer = Committer::spawn(Arc::clone(&cache)).unwrap();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(store.put_count(), 0);

        cache.set_upload_enabled(true);
        assert!(wait_for(|| cache.stats().dirty_entries == 0));
        cache.wait_idle();
        assert_eq!(store.put_count(), 1);

        committer.stop();
        cache.destroy();
    }

    #[test]
    fn test_snapshot_request_is_cleared_once_flushed() {
        let (cache, _store, _dir) = setup();
        cache.get(2, 0).unwrap().write(0, b"snapshot me").unwrap();
        cache.request_snapshot_upload();
        let committer = Committer::spawn(Arc::clone(&cache)).unwrap();

        assert!(wait_for(|| !cache.should_upload()));
        assert_eq!(cache.stats().dirty_entries, 0);

        committer.stop();
        cache.destroy();
    }

    #[test]
    fn test_stop_is_prompt() {
        let (cache, _store, _dir) = setup();
        let committer = Committer::spawn(Arc::clone(&cache)).unwrap();
        let started = Instant::now();
        drop(committer);
        assert!(started.elapsed() < Duration::from_secs(5));
        cache.destroy();
    }
}
