pub mod committer;
pub mod entry;
pub mod retry;
pub mod transit;
pub mod workers;

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Seek, SeekFrom};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{bounded, SendError, Sender};
use lru::LruCache;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::config::CacheConfig;
use crate::metadata::types::Linkage;
use crate::metadata::MetadataDb;
use crate::store::hasher::hash_reader;
use crate::store::ObjectStore;
use crate::{BlockId, BlockKey, GatewayError, ObjectId, Result};
use entry::{is_partial_mode, parse_staging_name, staging_path, CacheEntry};
use retry::{Retry, RetryError, RetryPolicy, ShutdownToken};
use transit::InTransit;
use workers::{Job, WorkerPool};

/// Open descriptors closed per `expire_opened` call.
const EXPIRE_OPENED_BATCH: usize = 100;
/// Clean entries dropped per round before the deficit is re-checked.
const CLEAN_BATCH: usize = 10;
/// Dirty entries uploaded per eviction round.
const UPLOAD_BATCH: usize = 5;
/// Eviction rounds without progress before giving up.
const EXPIRE_MAX_IDLE_ROUNDS: u32 = 50;
/// Background uploads between backend probes.
const PROBE_EVERY: usize = 100;

/// Snapshot of the cache counters for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub size: u64,
    pub dirty_size: u64,
    pub entries: usize,
    pub dirty_entries: u64,
    pub max_size: u64,
    pub max_entries: usize,
    /// A transfer is in progress.
    pub uploading: bool,
    pub write_enabled: bool,
    pub network_ok: bool,
    pub forced_upload: bool,
}

struct UploadJob {
    key: BlockKey,
    obj_id: ObjectId,
    file: File,
    size: u64,
}

struct CacheState {
    entries: LruCache<BlockKey, CacheEntry>,
    /// Entries holding a descriptor, least recently used last.
    opened: LruCache<BlockKey, ()>,
    size: u64,
    dirty_size: u64,
    dirty_entries: u64,
    max_entries: usize,
    in_transit: InTransit,
    pending_removals: usize,
    /// Inodes whose blocks should lose their descriptors.
    close_requested: HashSet<u64>,
    forced_upload: bool,
    snapshot_upload: bool,
    upload_enabled: bool,
    write_enabled: bool,
    network_ok: bool,
}

type State<'a> = MutexGuard<'a, CacheState>;

struct Inner {
    config: CacheConfig,
    db: Arc<MetadataDb>,
    store: Arc<dyn ObjectStore>,
    state: Mutex<CacheState>,
    transfer_completed: Condvar,
    shutdown: ShutdownToken,
    upload_tx: Option<Sender<Job<UploadJob>>>,
    removal_tx: Option<Sender<Job<ObjectId>>>,
}

#[derive(Default)]
struct Pools {
    upload: Option<WorkerPool<UploadJob>>,
    removal: Option<WorkerPool<ObjectId>>,
}

/// Local block cache in front of a deduplicating object store.
///
/// One coarse lock protects the entry table, the counters and the in-transit
/// markers. It is released around every backend transfer, every wait for a
/// transfer and every hand-off to a worker queue. Staged content lives in
/// `{cache_dir}/subdir_<n>/<inode>-<blockno>`.
pub struct BlockCache {
    inner: Arc<Inner>,
    pools: Mutex<Pools>,
    destroyed: AtomicBool,
}

impl BlockCache {
    /// Create the cache and start its worker pools.
    pub fn new(
        config: CacheConfig,
        db: Arc<MetadataDb>,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self> {
        fs::create_dir_all(&config.cache_dir)?;
        for shard in 0..config.shard_count.max(1) {
            fs::create_dir_all(config.cache_dir.join(format!("subdir_{shard}")))?;
        }

        let upload_chan = (config.upload_threads > 0).then(|| bounded(1));
        let removal_chan =
            (config.removal_threads > 0).then(|| bounded(config.removal_queue_len.max(1)));

        let state = CacheState {
            entries: LruCache::unbounded(),
            opened: LruCache::unbounded(),
            size: 0,
            dirty_size: 0,
            dirty_entries: 0,
            max_entries: config.max_entries,
            in_transit: InTransit::default(),
            pending_removals: 0,
            close_requested: HashSet::new(),
            forced_upload: false,
            snapshot_upload: false,
            upload_enabled: false,
            write_enabled: true,
            network_ok: true,
        };
        let inner = Arc::new(Inner {
            db,
            store,
            state: Mutex::new(state),
            transfer_completed: Condvar::new(),
            shutdown: ShutdownToken::new(),
            upload_tx: upload_chan.as_ref().map(|(tx, _)| tx.clone()),
            removal_tx: removal_chan.as_ref().map(|(tx, _)| tx.clone()),
            config,
        });

        let mut pools = Pools::default();
        if let Some((tx, rx)) = upload_chan {
            let worker = Arc::clone(&inner);
            pools.upload = Some(WorkerPool::spawn(
                "upload",
                inner.config.upload_threads,
                tx,
                rx,
                move |job| worker.do_upload(job),
            )?);
        }
        if let Some((tx, rx)) = removal_chan {
            let worker = Arc::clone(&inner);
            pools.removal = Some(WorkerPool::spawn(
                "removal",
                inner.config.removal_threads,
                tx,
                rx,
                move |obj_id| worker.do_removal(obj_id),
            )?);
        }

        info!(
            cache_dir = %inner.config.cache_dir.display(),
            max_size = inner.config.max_size,
            max_entries = inner.config.max_entries,
            upload_threads = inner.config.upload_threads,
            removal_threads = inner.config.removal_threads,
            "Block cache initialized"
        );

        Ok(Self {
            inner,
            pools: Mutex::new(pools),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Path of the staging file for `key`.
    pub fn staging_path(&self, key: BlockKey) -> PathBuf {
        self.inner.staging_path(key)
    }

    /// Exclusive access to block `blockno` of `inode`.
    ///
    /// Downloads or creates the block as needed. The cache lock is held until
    /// the handle is dropped, at which point the size and dirty counters are
    /// updated by the change the caller made.
    pub fn get(&self, inode: u64, blockno: u64) -> Result<BlockHandle<'_>> {
        let key = BlockKey::new(inode, blockno);
        debug!(inode, blockno, "get: start");
        let inner = &*self.inner;
        let mut state = inner.state.lock();

        inner.make_room(&mut state, key)?;
        inner.fetch(&mut state, key, true)?;

        let st = &mut *state;
        st.opened.put(key, ());
        let entry = st
            .entries
            .peek_mut(&key)
            .ok_or_else(|| GatewayError::Other(format!("block {key} vanished from cache")))?;
        entry.touch();
        let old_size = entry.size();
        let was_dirty = entry.is_dirty();

        Ok(BlockHandle {
            inner,
            state,
            key,
            old_size,
            was_dirty,
        })
    }

    /// Drop blocks `start..end` of `inode` from the cache and the metadata.
    ///
    /// Objects left without references are deleted remotely in the background,
    /// after any transfer of the same object has finished.
    pub fn remove(&self, inode: u64, start: u64, end: u64) -> Result<()> {
        debug!(inode, start, end, "remove: start");
        let inner = &*self.inner;
        let mut state = inner.state.lock();

        for blockno in start..end {
            if let Some(entry) = state.entries.peek_mut(&BlockKey::new(inode, blockno)) {
                entry.to_delete = true;
            }
        }

        for blockno in start..end {
            let key = BlockKey::new(inode, blockno);
            if let Some(entry) = inner.detach(&mut state, key) {
                debug!(%key, "Removing block from cache");
                entry.unlink()?;
            }

            match inner.db.release_block(key)? {
                Some(release) => {
                    debug!(%key, ?release, "Released block reference");
                    if let Some(obj_id) = release.orphaned_object() {
                        inner.schedule_removal(&mut state, obj_id);
                    }
                }
                None => debug!(%key, "Block not in metadata"),
            }
        }

        debug!(inode, start, end, "remove: end");
        Ok(())
    }

    /// Start the upload of every dirty block.
    ///
    /// On return all blocks are registered in the metadata; transfers may
    /// still be running.
    pub fn commit(&self) -> Result<()> {
        self.commit_where(|_| true)
    }

    /// Start the upload of the dirty blocks of `inode`.
    pub fn commit_inode(&self, inode: u64) -> Result<()> {
        self.commit_where(|key| key.inode == inode)
    }

    fn commit_where(&self, wanted: impl Fn(&BlockKey) -> bool) -> Result<()> {
        let inner = &*self.inner;
        let mut state = inner.state.lock();
        let keys: Vec<BlockKey> = state
            .entries
            .iter()
            .map(|(key, _)| *key)
            .filter(|key| wanted(key) && state.uploadable(key))
            .collect();
        debug!(blocks = keys.len(), "commit: start");

        for key in keys {
            if state.uploadable(&key) {
                inner.upload(&mut state, key)?;
            }
        }
        Ok(())
    }

    /// Evict every block, uploading dirty ones first.
    pub fn clear(&self) -> Result<()> {
        debug!("clear: start");
        let inner = &*self.inner;
        let mut state = inner.state.lock();
        let saved = state.max_entries;
        state.max_entries = 0;
        let result = inner.expire(&mut state, 0);
        state.max_entries = saved;
        debug!("clear: end");
        result
    }

    /// Block until no transfer or remote deletion is pending.
    pub fn wait_idle(&self) {
        let mut state = self.inner.state.lock();
        while !state.in_transit.is_empty() || state.pending_removals > 0 {
            self.inner.transfer_completed.wait(&mut state);
        }
    }

    /// Adopt the staging files left by a previous run as closed entries.
    ///
    /// Interrupted downloads are deleted. Returns the number of adopted files.
    pub fn load_staged(&self) -> Result<usize> {
        let inner = &*self.inner;
        let cache_dir = inner.config.cache_dir.clone();
        let mut loaded = 0;

        for dirent in fs::read_dir(&cache_dir)? {
            let shard = dirent?;
            if !shard.file_type()?.is_dir() {
                return Err(unexpected_file(&shard.path()));
            }
            for dirent in fs::read_dir(shard.path())? {
                let dirent = dirent?;
                let path = dirent.path();
                let name = dirent.file_name().to_string_lossy().to_string();
                let Some(key) = parse_staging_name(&name) else {
                    return Err(unexpected_file(&path));
                };

                let mode = fs::metadata(&path)?.permissions().mode();
                if is_partial_mode(mode) {
                    warn!(%key, "Deleting partially downloaded block");
                    fs::remove_file(&path)?;
                    continue;
                }

                let mut state = inner.state.lock();
                if state.entries.contains(&key) {
                    continue;
                }
                let expected = inner.staging_path(key);
                if path != expected {
                    info!(%key, from = %path.display(), "Moving staged block to its shard");
                    fs::rename(&path, &expected)?;
                }
                inner.fetch(&mut state, key, false)?;
                loaded += 1;
            }
        }

        let state = inner.state.lock();
        info!(
            loaded,
            size = state.size,
            dirty_entries = state.dirty_entries,
            "Loaded staged blocks"
        );
        Ok(loaded)
    }

    /// Close descriptors idle past `close_idle_after` or belonging to inodes
    /// passed to [`schedule_close`](Self::schedule_close).
    pub fn close_idle(&self) -> usize {
        let inner = &*self.inner;
        let mut state = inner.state.lock();
        let st = &mut *state;
        let requested = std::mem::take(&mut st.close_requested);
        let now = Instant::now();

        let victims: Vec<BlockKey> = st
            .opened
            .iter()
            .map(|(key, _)| *key)
            .filter(|key| !st.in_transit.contains_block(key))
            .filter(|key| {
                requested.contains(&key.inode)
                    || st.entries.peek(key).map_or(true, |entry| {
                        now.duration_since(entry.last_access) > inner.config.close_idle_after
                    })
            })
            .collect();

        for key in &victims {
            st.opened.pop(key);
            if let Some(entry) = st.entries.peek_mut(key) {
                entry.close();
            }
        }
        if !victims.is_empty() {
            debug!(closed = victims.len(), "Closed idle cache descriptors");
        }
        victims.len()
    }

    /// Ask the next [`close_idle`](Self::close_idle) pass to close the blocks of `inode`.
    pub fn schedule_close(&self, inode: u64) {
        self.inner.state.lock().close_requested.insert(inode);
    }

    /// Upload dirty blocks idle for at least `commit_delay`.
    ///
    /// Probes the backend before the first upload and every hundred after it;
    /// stops at the first failed probe. Returns the number of blocks uploaded.
    pub fn upload_idle(&self) -> Result<usize> {
        let inner = &*self.inner;
        let mut state = inner.state.lock();
        let now = Instant::now();
        let keys: Vec<BlockKey> = state
            .entries
            .iter()
            .rev()
            .filter(|(key, entry)| {
                state.uploadable(key)
                    && now.duration_since(entry.last_access) >= inner.config.commit_delay
            })
            .map(|(key, _)| *key)
            .collect();

        let mut uploaded = 0;
        for key in keys {
            if !state.should_upload() || inner.shutdown.is_triggered() {
                break;
            }
            if uploaded % PROBE_EVERY == 0 && !inner.probe(&mut state) {
                warn!("Backend unreachable, delaying background upload");
                break;
            }
            if state.uploadable(&key) {
                inner.upload(&mut state, key)?;
                uploaded += 1;
            }
        }

        if state.snapshot_upload && state.dirty_entries == 0 {
            debug!("Dirty data flushed for snapshot");
            state.snapshot_upload = false;
        }
        Ok(uploaded)
    }

    /// Recompute the counters from the entry table, correcting any drift.
    ///
    /// Returns true if a correction was needed.
    pub fn reconcile(&self) -> bool {
        let mut state = self.inner.state.lock();
        let (mut size, mut dirty_size, mut dirty_entries) = (0u64, 0u64, 0u64);
        for (_, entry) in state.entries.iter() {
            size += entry.size();
            if entry.is_dirty() {
                dirty_size += entry.size();
                dirty_entries += 1;
            }
        }
        if (size, dirty_size, dirty_entries) == (state.size, state.dirty_size, state.dirty_entries) {
            return false;
        }
        error!(
            recorded_size = state.size,
            size,
            recorded_dirty_size = state.dirty_size,
            dirty_size,
            recorded_dirty_entries = state.dirty_entries,
            dirty_entries,
            "Cache accounting drifted, correcting"
        );
        state.size = size;
        state.dirty_size = dirty_size;
        state.dirty_entries = dirty_entries;
        true
    }

    /// Restart dead worker threads. Returns the number restarted.
    pub fn check_workers(&self) -> usize {
        if self.inner.shutdown.is_triggered() {
            return 0;
        }
        let mut pools = self.pools.lock();
        let mut restarted = 0;
        if let Some(pool) = pools.upload.as_mut() {
            restarted += pool.check_alive();
        }
        if let Some(pool) = pools.removal.as_mut() {
            restarted += pool.check_alive();
        }
        restarted
    }

    /// Stop the workers and close every descriptor.
    ///
    /// Queued work is still processed; transfers that keep failing give up.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("destroy: start");
        self.inner.shutdown.trigger();

        let pools = std::mem::take(&mut *self.pools.lock());
        if let Some(pool) = pools.upload {
            pool.shutdown();
        }
        if let Some(pool) = pools.removal {
            pool.shutdown();
        }

        let mut state = self.inner.state.lock();
        let st = &mut *state;
        for (_, entry) in st.entries.iter_mut() {
            entry.close();
        }
        st.opened.clear();
        info!(entries = st.entries.len(), dirty_entries = st.dirty_entries, "Block cache shut down");
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock();
        CacheStats {
            size: state.size,
            dirty_size: state.dirty_size,
            entries: state.entries.len(),
            dirty_entries: state.dirty_entries,
            max_size: self.inner.config.max_size,
            max_entries: state.max_entries,
            uploading: !state.in_transit.is_empty(),
            write_enabled: state.write_enabled,
            network_ok: state.network_ok,
            forced_upload: state.forced_upload,
        }
    }

    /// Switch scheduled background uploading on or off.
    pub fn set_upload_enabled(&self, enabled: bool) {
        info!(enabled, "Background upload switched");
        self.inner.state.lock().upload_enabled = enabled;
    }

    /// Request background uploading until no dirty block is left.
    pub fn request_snapshot_upload(&self) {
        self.inner.state.lock().snapshot_upload = true;
    }

    /// Whether the background committer should upload right now.
    pub fn should_upload(&self) -> bool {
        self.inner.state.lock().should_upload()
    }

    /// Enable or disable writes depending on the logical file system size.
    pub fn check_quota(&self, fs_size: u64) -> bool {
        let enabled = fs_size <= self.inner.config.quota;
        let mut state = self.inner.state.lock();
        if state.write_enabled != enabled {
            warn!(fs_size, quota = self.inner.config.quota, enabled, "Write switch changed");
        }
        state.write_enabled = enabled;
        enabled
    }

    pub fn write_enabled(&self) -> bool {
        self.inner.state.lock().write_enabled
    }

    pub(crate) fn shutdown_token(&self) -> ShutdownToken {
        self.inner.shutdown.clone()
    }
}

/// Releases the bookkeeping of a transfer if its thread unwinds, so waiters
/// on the block or object are not stuck behind a dead worker.
struct TransferGuard<'a> {
    inner: &'a Inner,
    key: Option<BlockKey>,
    obj_id: Option<ObjectId>,
    removal: bool,
}

impl Drop for TransferGuard<'_> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            return;
        }
        error!(key = ?self.key, obj_id = ?self.obj_id, removal = self.removal, "Transfer panicked, releasing it");
        let mut state = self.inner.state.lock();
        if self.removal {
            state.pending_removals = state.pending_removals.saturating_sub(1);
        }
        self.inner.finish_transfer(&mut state, self.key, self.obj_id);
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let open = self
            .inner
            .state
            .lock()
            .entries
            .iter()
            .any(|(_, entry)| entry.is_open());
        self.destroy();
        if open && !std::thread::panicking() {
            panic!("BlockCache dropped without calling destroy() while entries were open");
        }
    }
}

impl CacheState {
    /// Dirty, not being removed and not already in transit.
    fn uploadable(&self, key: &BlockKey) -> bool {
        !self.in_transit.contains_block(key)
            && self
                .entries
                .peek(key)
                .is_some_and(|entry| entry.is_dirty() && !entry.to_delete)
    }

    fn should_upload(&self) -> bool {
        self.upload_enabled || self.forced_upload || self.snapshot_upload
    }
}

impl Inner {
    fn staging_path(&self, key: BlockKey) -> PathBuf {
        staging_path(&self.config.cache_dir, key, self.config.shard_count)
    }

    /// Wait until some transfer completes. Returns at once if none is running.
    fn wait(&self, state: &mut State<'_>) {
        if state.in_transit.is_empty() {
            return;
        }
        self.transfer_completed.wait(state);
    }

    fn finish_transfer(&self, state: &mut State<'_>, key: Option<BlockKey>, obj_id: Option<ObjectId>) {
        if let Some(key) = key {
            state.in_transit.remove_block(&key);
        }
        if let Some(obj_id) = obj_id {
            state.in_transit.remove_object(&obj_id);
        }
        self.transfer_completed.notify_all();
    }

    /// Write a no-op object to check the backend, recording the result.
    fn probe(&self, state: &mut State<'_>) -> bool {
        let result = MutexGuard::unlocked(state, || self.store.probe());
        if let Err(e) = &result {
            error!(error = %e, "Backend probe failed, network appears to be down");
        }
        state.network_ok = result.is_ok();
        state.network_ok
    }

    /// Enforce the descriptor budget and the size/entry ceilings before
    /// `key` is fetched.
    fn make_room(&self, state: &mut State<'_>, key: BlockKey) -> Result<()> {
        if state.opened.len() > self.config.max_open_entries {
            self.expire_opened(state);
        }
        let reserve = usize::from(!state.entries.contains(&key));
        if state.size > self.config.max_size || state.entries.len() + reserve > state.max_entries {
            self.expire(state, reserve)?;
        }
        Ok(())
    }

    fn expire_opened(&self, state: &mut State<'_>) {
        let st = &mut **state;
        let victims: Vec<BlockKey> = st
            .opened
            .iter()
            .rev()
            .map(|(key, _)| *key)
            .filter(|key| !st.in_transit.contains_block(key))
            .take(EXPIRE_OPENED_BATCH)
            .collect();
        for key in &victims {
            st.opened.pop(key);
            if let Some(entry) = st.entries.peek_mut(key) {
                entry.close();
            }
        }
        debug!(closed = victims.len(), "Closed least recently used descriptors");
    }

    /// Shrink the cache below its ceilings, leaving room for `reserve` new entries.
    ///
    /// Clean entries go first. Dirty entries are only dropped after they have
    /// been uploaded.
    fn expire(&self, state: &mut State<'_>, reserve: usize) -> Result<()> {
        debug!("expire: start");
        let max_size = self.config.max_size;
        let mut idle_rounds = 0;
        let mut force_search_clean = false;

        while state.entries.len() + reserve > state.max_entries
            || (!state.entries.is_empty() && state.size > max_size)
        {
            let mut need_size = state.size as i64 - max_size as i64;
            let mut need_entries = (state.entries.len() + reserve) as i64 - state.max_entries as i64;
            let replace_all_clean = (state.dirty_entries as f64)
                < self.config.fullspeed_factor * state.max_entries as f64;
            let skip_dirty = replace_all_clean || force_search_clean;
            let mut progressed = false;

            let mut victims = Vec::new();
            let st: &CacheState = state;
            for (key, entry) in st.entries.iter().rev() {
                let in_transit = st.in_transit.contains_block(key);
                if entry.is_dirty() {
                    if skip_dirty || in_transit {
                        continue;
                    }
                    break;
                }
                if in_transit {
                    continue;
                }
                victims.push(*key);
                need_entries -= 1;
                need_size -= entry.size() as i64;
                if victims.len() > CLEAN_BATCH && need_size <= 0 && need_entries <= 0 {
                    break;
                }
            }
            for key in victims {
                if let Some(entry) = self.detach(state, key) {
                    debug!(%key, "Evicting clean block");
                    entry.unlink()?;
                    progressed = true;
                }
            }
            if need_size <= 0 && need_entries <= 0 {
                break;
            }

            if !self.probe(state) {
                if max_size <= state.dirty_size || state.max_entries as u64 <= state.dirty_entries {
                    return Err(GatewayError::NoBuffers);
                }
                force_search_clean = true;
                idle_rounds += 1;
                if idle_rounds > EXPIRE_MAX_IDLE_ROUNDS {
                    error!("Cannot free cache space while the backend is unreachable");
                    break;
                }
                continue;
            }

            let st: &CacheState = state;
            let candidates: Vec<BlockKey> = st
                .entries
                .iter()
                .rev()
                .map(|(key, _)| *key)
                .filter(|key| st.uploadable(key))
                .take(UPLOAD_BATCH)
                .collect();
            for key in candidates {
                if !state.uploadable(&key) {
                    continue;
                }
                debug!(%key, "expire: uploading dirty block");
                self.upload(state, key)?;
                progressed = true;
            }

            if progressed {
                idle_rounds = 0;
            } else {
                idle_rounds += 1;
                if idle_rounds > EXPIRE_MAX_IDLE_ROUNDS {
                    error!(
                        entries = state.entries.len(),
                        size = state.size,
                        dirty_entries = state.dirty_entries,
                        "Cache expiry made no progress, giving up"
                    );
                    break;
                }
            }

            debug!("expire: waiting for transfers");
            self.wait(state);
        }

        debug!("expire: end");
        Ok(())
    }

    /// Remove `key` from the entry table and the counters.
    fn detach(&self, state: &mut State<'_>, key: BlockKey) -> Option<CacheEntry> {
        let st = &mut **state;
        let entry = st.entries.pop(&key)?;
        st.opened.pop(&key);
        st.size = st.size.saturating_sub(entry.size());
        if entry.is_dirty() {
            st.dirty_size = st.dirty_size.saturating_sub(entry.size());
            st.dirty_entries = st.dirty_entries.saturating_sub(1);
        }
        Some(entry)
    }

    /// Make sure `key` has an entry in the table, opened if `open` is set.
    fn fetch(&self, state: &mut State<'_>, key: BlockKey, open: bool) -> Result<()> {
        loop {
            if state.in_transit.contains_block(&key) {
                debug!(%key, "Block in transit, waiting");
                self.wait(state);
                continue;
            }

            if let Some(entry) = state.entries.get_mut(&key) {
                if open && !entry.is_open() {
                    entry.reopen()?;
                }
                return Ok(());
            }

            let path = self.staging_path(key);
            match fs::metadata(&path) {
                Ok(meta) if is_partial_mode(meta.permissions().mode()) => {
                    warn!(%key, "Discarding partially downloaded block");
                    fs::remove_file(&path)?;
                }
                Ok(_) => {
                    let entry = if open {
                        CacheEntry::open(key, path)?
                    } else {
                        CacheEntry::load(key, path)?
                    };
                    debug!(%key, size = entry.size(), dirty = entry.is_dirty(), "Adopted staged block");
                    state.size += entry.size();
                    if entry.is_dirty() {
                        state.dirty_size += entry.size();
                        state.dirty_entries += 1;
                    }
                    state.entries.put(key, entry);
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }

            let Some(block_id) = self.db.block_of(key)? else {
                debug!(%key, "Creating new block");
                let mut entry = CacheEntry::create(key, path)?;
                if !open {
                    entry.close();
                }
                state.entries.put(key, entry);
                return Ok(());
            };

            let obj_id = self.db.object_of(block_id)?.ok_or_else(|| {
                GatewayError::Other(format!("block {block_id} has no object"))
            })?;
            if state.in_transit.contains_object(&obj_id) {
                debug!(%key, %obj_id, "Object in transit, waiting");
                self.wait(state);
                continue;
            }

            if self.download(state, key, block_id, obj_id, path)? {
                if !open {
                    if let Some(entry) = state.entries.peek_mut(&key) {
                        entry.close();
                    }
                }
                return Ok(());
            }
        }
    }

    /// Download `obj_id` into the staging file of `key`.
    ///
    /// Returns false if the block was relinked while the lock was released,
    /// in which case the downloaded copy is discarded.
    fn download(
        &self,
        state: &mut State<'_>,
        key: BlockKey,
        block_id: BlockId,
        obj_id: ObjectId,
        path: PathBuf,
    ) -> Result<bool> {
        state.in_transit.insert_block(key);
        state.in_transit.insert_object(obj_id);
        debug!(%key, %obj_id, "Downloading object");

        let policy = RetryPolicy::bounded(
            self.config.download_attempts,
            self.config.download_retry_delay,
        );
        let result = MutexGuard::unlocked(state, || {
            Retry::new(policy, &self.shutdown).run("download", |_| {
                let mut entry = CacheEntry::create_partial(key, path.clone())?;
                let fetched = self
                    .store
                    .get(&obj_id.key())
                    .and_then(|mut reader| Ok(entry.fill_from(&mut reader)?));
                match fetched {
                    Ok(_) => Ok(entry),
                    Err(e) => {
                        let _ = entry.unlink();
                        Err(e)
                    }
                }
            })
        });

        let linked = self.db.block_of(key);
        self.finish_transfer(state, Some(key), Some(obj_id));

        let mut entry = match result {
            Ok(entry) => entry,
            Err(RetryError::Permanent(e)) => {
                error!(%key, %obj_id, error = %e, "Backend lost an object, fsck required");
                return Err(GatewayError::Corrupted {
                    obj_id,
                    detail: e.to_string(),
                });
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                error!(%key, %obj_id, attempts, error = %last, "Download failed");
                state.network_ok = false;
                return Err(GatewayError::TryAgain(format!(
                    "object {} unavailable: {last}",
                    obj_id.key()
                )));
            }
            Err(RetryError::Aborted) => return Err(GatewayError::ShuttingDown),
        };
        state.network_ok = true;

        match linked {
            Ok(Some(current)) if current == block_id => {}
            Ok(_) => {
                debug!(%key, "Block relinked during download, discarding copy");
                entry.unlink()?;
                return Ok(false);
            }
            Err(e) => {
                let _ = entry.unlink();
                return Err(e);
            }
        }

        if let Err(e) = entry.mark_clean() {
            let _ = entry.unlink();
            return Err(e.into());
        }
        state.size += entry.size();
        state.entries.put(key, entry);
        Ok(true)
    }

    /// Register the content of `key` in the metadata and start its upload.
    ///
    /// Returns the number of bytes that become clean once the transfer
    /// finishes, or 0 if the entry went away meanwhile.
    fn upload(&self, state: &mut State<'_>, key: BlockKey) -> Result<u64> {
        let reader = match state.entries.peek(&key) {
            Some(entry) => entry.open_reader(),
            None => return Ok(0),
        };
        let mut file = reader?;
        if !state.in_transit.insert_block(key) {
            return Ok(0);
        }
        debug!(%key, "upload: start");

        let hashed = MutexGuard::unlocked(state, || hash_reader(&mut file));
        let (hash, size) = match hashed {
            Ok(hashed) => hashed,
            Err(e) => {
                self.finish_transfer(state, Some(key), None);
                return Err(e.into());
            }
        };

        if !state.entries.peek(&key).is_some_and(|entry| !entry.to_delete) {
            debug!(%key, "Block removed while hashing, skipping upload");
            self.finish_transfer(state, Some(key), None);
            return Ok(0);
        }

        let outcome = match self.db.commit_block(key, &hash, size) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.finish_transfer(state, Some(key), None);
                return Err(e);
            }
        };

        // The old object row is already gone, so its blob must be queued now.
        if let Some(obj_id) = outcome.released.and_then(|r| r.orphaned_object()) {
            debug!(%key, %obj_id, "Previous object unreferenced");
            self.schedule_removal(state, obj_id);
        }

        let resend = match outcome.linkage {
            Linkage::New { obj_id, block_id } => {
                debug!(%key, %block_id, %obj_id, "New content, queueing upload");
                Some(obj_id)
            }
            Linkage::Unchanged { block_id } | Linkage::Deduplicated { block_id } => {
                match outcome
                    .unconfirmed
                    .filter(|obj_id| !state.in_transit.contains_object(obj_id))
                {
                    Some(obj_id) => {
                        warn!(%key, %block_id, %obj_id, "Object of reused block was never confirmed, uploading again");
                        Some(obj_id)
                    }
                    None => {
                        debug!(%key, %block_id, linkage = ?outcome.linkage, "Content already stored");
                        let cleaned = self.mark_entry_clean(state, key);
                        self.finish_transfer(state, Some(key), None);
                        cleaned?;
                        None
                    }
                }
            }
        };

        if let Some(obj_id) = resend {
            state.in_transit.insert_object(obj_id);
            self.dispatch_upload(
                state,
                UploadJob {
                    key,
                    obj_id,
                    file,
                    size,
                },
            );
        }
        Ok(size)
    }

    /// Hand `job` to the upload workers, or run it inline when there are none.
    fn dispatch_upload(&self, state: &mut State<'_>, job: UploadJob) {
        let job = match &self.upload_tx {
            Some(tx) => match MutexGuard::unlocked(state, || tx.send(Job::Work(job))) {
                Ok(()) => return,
                Err(SendError(Job::Work(job))) => {
                    warn!(key = %job.key, obj_id = %job.obj_id, "Upload queue closed, uploading synchronously");
                    job
                }
                Err(SendError(Job::Quit)) => return,
            },
            None => {
                warn!(key = %job.key, obj_id = %job.obj_id, "No upload workers, uploading synchronously");
                job
            }
        };
        MutexGuard::unlocked(state, || self.do_upload(job));
    }

    fn mark_entry_clean(&self, state: &mut State<'_>, key: BlockKey) -> io::Result<()> {
        let st = &mut **state;
        if let Some(entry) = st.entries.peek_mut(&key) {
            if entry.is_dirty() {
                let size = entry.size();
                entry.mark_clean()?;
                st.dirty_size = st.dirty_size.saturating_sub(size);
                st.dirty_entries = st.dirty_entries.saturating_sub(1);
            }
        }
        Ok(())
    }

    /// Physical upload of one object. Runs without the cache lock.
    fn do_upload(&self, job: UploadJob) {
        let UploadJob {
            key,
            obj_id,
            mut file,
            size,
        } = job;
        let _unwind = TransferGuard {
            inner: self,
            key: Some(key),
            obj_id: Some(obj_id),
            removal: false,
        };
        self.relax_forced_upload(&mut self.state.lock());

        let started = Instant::now();
        let policy = RetryPolicy::unbounded(self.config.upload_retry_delay);
        let result = Retry::new(policy, &self.shutdown).run("upload", |_| {
            file.seek(SeekFrom::Start(0))?;
            self.store.put(&obj_id.key(), &mut file)
        });

        let mut state = self.state.lock();
        match result {
            Ok(stored) => {
                state.network_ok = true;
                debug!(
                    %key,
                    %obj_id,
                    size,
                    stored,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Uploaded object"
                );
                match self.db.set_object_size(obj_id, stored) {
                    Ok(true) => {
                        if let Err(e) = self.mark_entry_clean(&mut state, key) {
                            error!(%key, error = %e, "Failed to mark block clean");
                        }
                    }
                    Ok(false) => debug!(%obj_id, "Object was removed during upload"),
                    Err(e) => error!(%obj_id, error = %e, "Failed to record object size"),
                }
                self.relax_forced_upload(&mut state);
            }
            Err(e) => {
                state.network_ok = false;
                error!(%key, %obj_id, error = %e, "Upload failed, block stays dirty");
            }
        }
        self.finish_transfer(&mut state, Some(key), Some(obj_id));
    }

    /// Queue the remote deletion of an unreferenced object.
    ///
    /// Falls back to deleting inline when no removal worker can take it.
    fn schedule_removal(&self, state: &mut State<'_>, obj_id: ObjectId) {
        state.pending_removals += 1;
        match &self.removal_tx {
            Some(tx) => {
                debug!(%obj_id, "Queueing object removal");
                if MutexGuard::unlocked(state, || tx.send(Job::Work(obj_id))).is_ok() {
                    return;
                }
                warn!(%obj_id, "Removal queue closed, removing synchronously");
            }
            None => warn!(%obj_id, "No removal workers, removing synchronously"),
        }
        MutexGuard::unlocked(state, || self.do_removal(obj_id));
    }

    /// Delete an object remotely once no transfer of it is running.
    fn do_removal(&self, obj_id: ObjectId) {
        let _unwind = TransferGuard {
            inner: self,
            key: None,
            obj_id: None,
            removal: true,
        };
        {
            let mut state = self.state.lock();
            while state.in_transit.contains_object(&obj_id) {
                debug!(%obj_id, "Waiting for transfer before removal");
                self.transfer_completed.wait(&mut state);
            }
        }

        let policy = RetryPolicy::unbounded(self.config.upload_retry_delay);
        let result =
            Retry::new(policy, &self.shutdown).run("delete", |_| self.store.delete(&obj_id.key()));
        match result {
            Ok(()) => debug!(%obj_id, "Removed object"),
            Err(RetryError::Permanent(e)) => {
                warn!(%obj_id, error = %e, "Object already missing from backend")
            }
            Err(e) => error!(%obj_id, error = %e, "Failed to remove object"),
        }

        let mut state = self.state.lock();
        state.pending_removals = state.pending_removals.saturating_sub(1);
        self.transfer_completed.notify_all();
    }

    fn check_forced_upload(&self, state: &mut CacheState) {
        let factor = self.config.fullspeed_factor;
        if state.dirty_size as f64 > factor * self.config.max_size as f64
            || state.dirty_entries as f64 > factor * state.max_entries as f64
        {
            if !state.forced_upload {
                info!(dirty_size = state.dirty_size, dirty_entries = state.dirty_entries, "Forcing full-speed upload");
            }
            state.forced_upload = true;
        }
    }

    /// Leave full-speed mode once dirty data is well below the threshold.
    fn relax_forced_upload(&self, state: &mut CacheState) {
        if !state.forced_upload {
            return;
        }
        let threshold = self.config.fullspeed_factor * self.config.max_size as f64;
        let gap = (self.config.fullspeed_gap as f64).min(threshold / 2.0);
        if (state.dirty_size as f64) < threshold - gap
            && (state.dirty_entries as f64) < self.config.fullspeed_factor * state.max_entries as f64
        {
            info!(dirty_size = state.dirty_size, "Leaving full-speed upload");
            state.forced_upload = false;
        }
    }
}

fn unexpected_file(path: &Path) -> GatewayError {
    GatewayError::Other(format!("unexpected file in cache directory: {}", path.display()))
}

/// Scoped, exclusive access to one cached block.
///
/// Holds the cache lock. Dropping the handle applies the size and dirty
/// changes to the cache counters.
pub struct BlockHandle<'a> {
    inner: &'a Inner,
    state: State<'a>,
    key: BlockKey,
    old_size: u64,
    was_dirty: bool,
}

impl BlockHandle<'_> {
    pub fn key(&self) -> BlockKey {
        self.key
    }

    fn entry_mut(&mut self) -> Result<&mut CacheEntry> {
        let key = self.key;
        self.state
            .entries
            .peek_mut(&key)
            .ok_or_else(|| GatewayError::Other(format!("block {key} vanished from cache")))
    }

    pub fn size(&self) -> u64 {
        self.state.entries.peek(&self.key).map_or(0, CacheEntry::size)
    }

    pub fn is_dirty(&self) -> bool {
        self.state
            .entries
            .peek(&self.key)
            .is_some_and(CacheEntry::is_dirty)
    }

    /// Read up to `len` bytes at `offset`; short at end of block.
    pub fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let entry = self.entry_mut()?;
        entry.seek(offset)?;
        Ok(entry.read(len)?)
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let entry = self.entry_mut()?;
        entry.seek(offset)?;
        entry.write(data)?;
        Ok(())
    }

    pub fn truncate(&mut self, size: u64) -> Result<()> {
        self.entry_mut()?.truncate(size)?;
        Ok(())
    }
}

impl Drop for BlockHandle<'_> {
    fn drop(&mut self) {
        let key = self.key;
        let st = &mut *self.state;
        let Some(entry) = st.entries.peek(&key) else {
            return;
        };
        let (size, dirty) = (entry.size(), entry.is_dirty());
        let delta = size as i64 - self.old_size as i64;

        adjust(&mut st.size, delta, "size");
        if self.was_dirty {
            adjust(&mut st.dirty_size, delta, "dirty_size");
        } else if dirty {
            st.dirty_size += size;
            st.dirty_entries += 1;
        }
        self.inner.check_forced_upload(st);
        debug!(%key, "get: end");
    }
}

/// Apply `delta` to a counter, clamping at zero.
fn adjust(counter: &mut u64, delta: i64, name: &str) {
    let value = *counter as i64 + delta;
    if value < 0 {
        warn!(counter = name, value, "Cache counter went negative, clamping");
        *counter = 0;
    } else {
        *counter = value as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryObjectStore;
    use crate::sha256;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        cache: BlockCache,
        db: Arc<MetadataDb>,
        store: Arc<MemoryObjectStore>,
        _dir: TempDir,
    }

    fn test_config(dir: &Path) -> CacheConfig {
        CacheConfig {
            shard_count: 8,
            upload_threads: 0,
            removal_threads: 0,
            upload_retry_delay: Duration::from_millis(10),
            download_attempts: 3,
            download_retry_delay: Duration::from_millis(10),
            ..CacheConfig::new(dir.join("cache"))
        }
    }

    fn setup_with(tweak: impl FnOnce(&mut CacheConfig)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        tweak(&mut config);
        let db = Arc::new(MetadataDb::open_memory().unwrap());
        let store = Arc::new(MemoryObjectStore::new());
        let cache = BlockCache::new(config, db.clone(), store.clone()).unwrap();
        Fixture {
            cache,
            db,
            store,
            _dir: dir,
        }
    }

    fn setup() -> Fixture {
        setup_with(|_| {})
    }

    fn write_block(cache: &BlockCache, inode: u64, blockno: u64, data: &[u8]) {
        let mut handle = cache.get(inode, blockno).unwrap();
        handle.write(0, data).unwrap();
    }

    fn read_block(cache: &BlockCache, inode: u64, blockno: u64) -> Vec<u8> {
        let mut handle = cache.get(inode, blockno).unwrap();
        handle.read(0, 1 << 20).unwrap()
    }

    fn mode_of(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode()
    }

    #[test]
    fn test_new_block_is_empty_and_clean() {
        let fx = setup();
        {
            let handle = fx.cache.get(2, 0).unwrap();
            assert_eq!(handle.size(), 0);
            assert!(!handle.is_dirty());
        }
        let stats = fx.cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.size, 0);
        assert_eq!(stats.dirty_entries, 0);
        assert!(fx.cache.staging_path(BlockKey::new(2, 0)).exists());
        fx.cache.destroy();
    }

    #[test]
    fn test_write_updates_accounting() {
        let fx = setup();
        write_block(&fx.cache, 2, 0, &[7u8; 100]);
        {
            let mut handle = fx.cache.get(2, 0).unwrap();
            handle.write(150, b"tail").unwrap();
        }
        let stats = fx.cache.stats();
        assert_eq!(stats.size, 154);
        assert_eq!(stats.dirty_size, 154);
        assert_eq!(stats.dirty_entries, 1);
        assert!(!fx.cache.reconcile());
        fx.cache.destroy();
    }

    #[test]
    fn test_commit_uploads_synchronously() {
        let fx = setup();
        write_block(&fx.cache, 2, 0, b"hello block");
        fx.cache.commit().unwrap();

        assert_eq!(fx.store.put_count(), 1);
        let stats = fx.cache.stats();
        assert_eq!(stats.dirty_size, 0);
        assert_eq!(stats.dirty_entries, 0);
        assert_eq!(stats.size, 11);

        let block_id = fx.db.block_of(BlockKey::new(2, 0)).unwrap().unwrap();
        let obj_id = fx.db.object_of(block_id).unwrap().unwrap();
        assert_eq!(fx.db.get_object(obj_id).unwrap().unwrap().size, Some(11));
        assert_eq!(fx.store.object(&obj_id.key()).unwrap(), b"hello block");
        let mode = mode_of(&fx.cache.staging_path(BlockKey::new(2, 0)));
        assert_eq!(mode & 0o777, 0o400);
        fx.cache.destroy();
    }

    #[test]
    fn test_commit_inode_only_touches_that_inode() {
        let fx = setup();
        write_block(&fx.cache, 2, 0, b"two");
        write_block(&fx.cache, 3, 0, b"three");
        fx.cache.commit_inode(3).unwrap();
        assert_eq!(fx.store.put_count(), 1);
        assert!(fx.db.block_of(BlockKey::new(2, 0)).unwrap().is_none());
        assert_eq!(fx.cache.stats().dirty_entries, 1);
        fx.cache.destroy();
    }

    #[test]
    fn test_commit_with_worker_pool() {
        let fx = setup_with(|c| {
            c.upload_threads = 2;
            c.removal_threads = 2;
        });
        for blockno in 0..4 {
            write_block(&fx.cache, 2, blockno, format!("block {blockno}").as_bytes());
        }
        fx.cache.commit().unwrap();
        fx.cache.wait_idle();
        assert_eq!(fx.store.put_count(), 4);
        assert_eq!(fx.cache.stats().dirty_entries, 0);
        assert_eq!(fx.db.count_objects().unwrap(), 4);
        fx.cache.destroy();
    }

    #[test]
    fn test_identical_blocks_are_deduplicated() {
        let fx = setup();
        write_block(&fx.cache, 2, 0, b"same content");
        write_block(&fx.cache, 3, 5, b"same content");
        fx.cache.commit().unwrap();

        assert_eq!(fx.store.put_count(), 1);
        assert_eq!(fx.db.count_objects().unwrap(), 1);
        let a = fx.db.block_of(BlockKey::new(2, 0)).unwrap();
        let b = fx.db.block_of(BlockKey::new(3, 5)).unwrap();
        assert_eq!(a, b);
        let block = fx.db.block_by_hash(&sha256(b"same content")).unwrap().unwrap();
        assert_eq!(block.refcount, 2);
        assert_eq!(fx.db.block_references(block.id).unwrap(), 2);
        assert_eq!(fx.cache.stats().dirty_entries, 0);
        fx.cache.destroy();
    }

    #[test]
    fn test_rewrite_removes_old_object() {
        let fx = setup_with(|c| c.removal_threads = 1);
        write_block(&fx.cache, 2, 0, b"version one");
        fx.cache.commit().unwrap();
        write_block(&fx.cache, 2, 0, b"version two");
        fx.cache.commit().unwrap();
        fx.cache.wait_idle();

        assert_eq!(fx.store.put_count(), 2);
        assert_eq!(fx.store.deleted_keys(), vec!["data_1".to_string()]);
        assert_eq!(fx.db.count_objects().unwrap(), 1);
        assert!(fx.db.block_by_hash(&sha256(b"version one")).unwrap().is_none());
        fx.cache.destroy();
    }

    #[test]
    fn test_unchanged_content_is_not_uploaded_again() {
        let fx = setup();
        write_block(&fx.cache, 2, 0, b"stable");
        fx.cache.commit().unwrap();
        write_block(&fx.cache, 2, 0, b"stable");
        assert_eq!(fx.cache.stats().dirty_entries, 1);
        fx.cache.commit().unwrap();
        assert_eq!(fx.store.put_count(), 1);
        assert_eq!(fx.cache.stats().dirty_entries, 0);
        fx.cache.destroy();
    }

    #[test]
    fn test_clear_then_download() {
        let fx = setup();
        write_block(&fx.cache, 2, 0, b"round trip through backend");
        fx.cache.clear().unwrap();
        assert!(fx.cache.is_empty());
        assert!(!fx.cache.staging_path(BlockKey::new(2, 0)).exists());
        assert_eq!(fx.cache.stats().size, 0);

        assert_eq!(read_block(&fx.cache, 2, 0), b"round trip through backend");
        assert_eq!(fx.store.get_count(), 1);
        let stats = fx.cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.size, 26);
        assert_eq!(stats.dirty_entries, 0);
        let mode = mode_of(&fx.cache.staging_path(BlockKey::new(2, 0)));
        assert!(!is_partial_mode(mode));
        fx.cache.destroy();
    }

    #[test]
    fn test_eviction_with_single_entry_budget() {
        let fx = setup_with(|c| c.max_entries = 1);
        drop(fx.cache.get(2, 0).unwrap());
        let first = fx.cache.staging_path(BlockKey::new(2, 0));
        assert!(first.exists());

        drop(fx.cache.get(2, 1).unwrap());
        assert!(!first.exists());
        assert_eq!(fx.cache.len(), 1);
        assert_eq!(fx.cache.stats().entries, 1);
        fx.cache.destroy();
    }

    #[test]
    fn test_eviction_uploads_dirty_block_first() {
        let fx = setup_with(|c| c.max_entries = 1);
        write_block(&fx.cache, 2, 0, b"must survive");
        drop(fx.cache.get(2, 1).unwrap());

        assert_eq!(fx.store.put_count(), 1);
        assert_eq!(fx.cache.len(), 1);
        let block_id = fx.db.block_of(BlockKey::new(2, 0)).unwrap().unwrap();
        let obj_id = fx.db.object_of(block_id).unwrap().unwrap();
        assert_eq!(fx.store.object(&obj_id.key()).unwrap(), b"must survive");
        fx.cache.destroy();
    }

    #[test]
    fn test_eviction_refuses_to_drop_dirty_data_offline() {
        let fx = setup_with(|c| c.max_entries = 1);
        write_block(&fx.cache, 2, 0, b"unsaved");
        fx.store.set_offline(true);

        let err = fx.cache.get(2, 1).err().unwrap();
        assert!(matches!(err, GatewayError::NoBuffers));
        assert_eq!(err.to_errno(), libc::ENOBUFS);
        assert!(!fx.cache.stats().network_ok);
        assert!(fx.cache.staging_path(BlockKey::new(2, 0)).exists());
        assert_eq!(fx.cache.stats().dirty_entries, 1);
        assert_eq!(read_block(&fx.cache, 2, 0), b"unsaved");
        fx.cache.destroy();
    }

    #[test]
    fn test_offline_eviction_still_drops_clean_blocks() {
        let fx = setup_with(|c| c.max_entries = 3);
        write_block(&fx.cache, 2, 0, b"dirty");
        drop(fx.cache.get(2, 1).unwrap());
        drop(fx.cache.get(2, 2).unwrap());
        fx.store.set_offline(true);

        drop(fx.cache.get(2, 3).unwrap());
        assert_eq!(fx.store.put_count(), 0);
        assert!(fx.cache.staging_path(BlockKey::new(2, 0)).exists());
        assert!(!fx.cache.staging_path(BlockKey::new(2, 1)).exists());
        assert!(!fx.cache.staging_path(BlockKey::new(2, 2)).exists());
        assert_eq!(fx.cache.len(), 2);
        fx.cache.destroy();
    }

    #[test]
    fn test_missing_object_is_corruption() {
        let fx = setup();
        write_block(&fx.cache, 2, 0, b"lost");
        fx.cache.clear().unwrap();
        fx.store.delete("data_1").unwrap();

        let err = fx.cache.get(2, 0).err().unwrap();
        assert!(matches!(err, GatewayError::Corrupted { obj_id: ObjectId(1), .. }));
        assert!(!fx.cache.staging_path(BlockKey::new(2, 0)).exists());
        fx.cache.destroy();
    }

    #[test]
    fn test_download_retries_transient_failures() {
        let fx = setup();
        write_block(&fx.cache, 2, 0, b"flaky");
        fx.cache.clear().unwrap();
        fx.store.fail_next(2);
        assert_eq!(read_block(&fx.cache, 2, 0), b"flaky");
        fx.cache.destroy();
    }

    #[test]
    fn test_download_gives_up_after_bounded_attempts() {
        let fx = setup();
        write_block(&fx.cache, 2, 0, b"unreachable");
        fx.cache.clear().unwrap();
        fx.store.set_offline(true);

        let err = fx.cache.get(2, 0).err().unwrap();
        assert!(matches!(err, GatewayError::TryAgain(_)));
        assert_eq!(err.to_errno(), libc::EAGAIN);
        assert!(!fx.cache.staging_path(BlockKey::new(2, 0)).exists());
        assert!(fx.cache.is_empty());

        fx.store.set_offline(false);
        assert_eq!(read_block(&fx.cache, 2, 0), b"unreachable");
        fx.cache.destroy();
    }

    #[test]
    fn test_upload_retries_until_success() {
        let fx = setup_with(|c| c.upload_threads = 1);
        fx.store.fail_next(3);
        write_block(&fx.cache, 2, 0, b"eventually");
        fx.cache.commit().unwrap();
        fx.cache.wait_idle();
        assert_eq!(fx.store.put_count(), 1);
        assert_eq!(fx.cache.stats().dirty_entries, 0);
        fx.cache.destroy();
    }

    #[test]
    fn test_shutdown_aborts_upload_retries() {
        let fx = setup_with(|c| {
            c.upload_threads = 1;
            c.upload_retry_delay = Duration::from_secs(30);
        });
        write_block(&fx.cache, 2, 0, b"stuck");
        fx.store.set_offline(true);
        fx.cache.commit().unwrap();

        let started = Instant::now();
        fx.cache.destroy();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(fx.cache.stats().dirty_entries, 1);
        let mode = mode_of(&fx.cache.staging_path(BlockKey::new(2, 0)));
        assert!(entry::is_dirty_mode(mode));
    }

    #[test]
    fn test_get_waits_for_upload_in_progress() {
        let fx = setup_with(|c| c.upload_threads = 1);
        let cache = Arc::new(fx.cache);
        write_block(&cache, 2, 0, b"in flight");
        fx.store.hold_puts();
        cache.commit().unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let reader = {
            let cache = Arc::clone(&cache);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let dirty = cache.get(2, 0).unwrap().is_dirty();
                done.store(true, Ordering::SeqCst);
                dirty
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!done.load(Ordering::SeqCst));
        assert!(cache.stats().uploading);

        fx.store.release_puts();
        assert!(!reader.join().unwrap());
        assert!(done.load(Ordering::SeqCst));
        cache.destroy();
    }

    #[test]
    fn test_concurrent_gets_share_one_download() {
        let fx = setup();
        write_block(&fx.cache, 2, 0, b"fetched once");
        fx.cache.clear().unwrap();
        assert!(fx.cache.is_empty());

        let cache = Arc::new(fx.cache);
        fx.store.hold_gets();
        let readers: Vec<_> = (0..2)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || read_block(&cache, 2, 0))
            })
            .collect();

        thread::sleep(Duration::from_millis(100));
        assert!(cache.stats().uploading);
        assert_eq!(fx.store.get_count(), 0);

        fx.store.release_gets();
        for reader in readers {
            assert_eq!(reader.join().unwrap(), b"fetched once");
        }
        assert_eq!(fx.store.get_count(), 1);
        assert_eq!(cache.stats().entries, 1);
        cache.destroy();
    }

    #[test]
    fn test_worker_panic_releases_block() {
        let fx = setup_with(|c| c.upload_threads = 1);
        write_block(&fx.cache, 2, 0, b"crash once");
        fx.store.panic_next_puts(1);
        fx.cache.commit().unwrap();
        fx.cache.wait_idle();
        assert!(!fx.cache.stats().uploading);
        assert_eq!(fx.cache.stats().dirty_entries, 1);

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut restarted = 0;
        while restarted == 0 && Instant::now() < deadline {
            restarted = fx.cache.check_workers();
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(restarted, 1);
        assert_eq!(read_block(&fx.cache, 2, 0), b"crash once");

        fx.cache.commit().unwrap();
        fx.cache.wait_idle();
        assert_eq!(fx.store.put_count(), 1);
        assert_eq!(fx.cache.stats().dirty_entries, 0);
        fx.cache.destroy();
    }

    #[test]
    fn test_rewrite_after_workers_stop_still_removes_old_object() {
        let fx = setup_with(|c| {
            c.upload_threads = 1;
            c.removal_threads = 1;
        });
        write_block(&fx.cache, 2, 0, b"version one");
        fx.cache.commit().unwrap();
        fx.cache.wait_idle();
        let block_id = fx.db.block_of(BlockKey::new(2, 0)).unwrap().unwrap();
        let old = fx.db.object_of(block_id).unwrap().unwrap();
        write_block(&fx.cache, 2, 0, b"version two");

        let pools = std::mem::take(&mut *fx.cache.pools.lock());
        pools.upload.unwrap().shutdown();
        pools.removal.unwrap().shutdown();

        fx.cache.commit().unwrap();
        fx.cache.wait_idle();
        assert_eq!(fx.store.deleted_keys(), vec![old.key()]);
        assert!(!fx.store.contains(&old.key()));
        assert_eq!(fx.store.put_count(), 2);
        assert_eq!(fx.db.count_objects().unwrap(), 1);
        assert_eq!(fx.cache.stats().dirty_entries, 0);
        fx.cache.destroy();
    }

    #[test]
    fn test_removal_waits_for_upload_to_finish() {
        let fx = setup_with(|c| {
            c.upload_threads = 1;
            c.removal_threads = 1;
        });
        write_block(&fx.cache, 2, 0, b"short lived");
        fx.store.hold_puts();
        fx.cache.commit().unwrap();

        fx.cache.remove(2, 0, 1).unwrap();
        assert_eq!(fx.db.count_objects().unwrap(), 0);
        assert!(fx.cache.is_empty());
        thread::sleep(Duration::from_millis(50));
        assert!(fx.store.deleted_keys().is_empty());

        fx.store.release_puts();
        fx.cache.wait_idle();
        assert_eq!(fx.store.deleted_keys(), vec!["data_1".to_string()]);
        assert!(!fx.store.contains("data_1"));
        assert_eq!(fx.cache.stats().dirty_entries, 0);
        fx.cache.destroy();
    }

    #[test]
    fn test_remove_shared_block_keeps_object() {
        let fx = setup();
        write_block(&fx.cache, 2, 0, b"shared");
        write_block(&fx.cache, 3, 0, b"shared");
        fx.cache.commit().unwrap();

        fx.cache.remove(2, 0, 1).unwrap();
        assert!(fx.store.deleted_keys().is_empty());
        let block = fx.db.block_by_hash(&sha256(b"shared")).unwrap().unwrap();
        assert_eq!(block.refcount, 1);
        assert_eq!(fx.cache.len(), 1);

        fx.cache.remove(3, 0, 1).unwrap();
        assert_eq!(fx.store.deleted_keys(), vec!["data_1".to_string()]);
        assert_eq!(fx.db.count_blocks().unwrap(), 0);
        fx.cache.destroy();
    }

    #[test]
    fn test_remove_dirty_block_fixes_accounting() {
        let fx = setup();
        write_block(&fx.cache, 2, 0, b"never uploaded");
        write_block(&fx.cache, 2, 1, b"kept");
        fx.cache.remove(2, 0, 1).unwrap();
        let stats = fx.cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.size, 4);
        assert_eq!(stats.dirty_size, 4);
        assert_eq!(stats.dirty_entries, 1);
        assert!(fx.db.block_of(BlockKey::new(2, 0)).unwrap().is_none());
        fx.cache.destroy();
    }

    #[test]
    fn test_reconcile_corrects_drift() {
        let fx = setup();
        write_block(&fx.cache, 2, 0, b"12345");
        {
            let mut state = fx.cache.inner.state.lock();
            state.size += 40;
            state.dirty_entries = 9;
        }
        assert!(fx.cache.reconcile());
        let stats = fx.cache.stats();
        assert_eq!(stats.size, 5);
        assert_eq!(stats.dirty_size, 5);
        assert_eq!(stats.dirty_entries, 1);
        assert!(!fx.cache.reconcile());
        fx.cache.destroy();
    }

    #[test]
    fn test_load_staged_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(MetadataDb::open_memory().unwrap());
        let store = Arc::new(MemoryObjectStore::new());

        let first = BlockCache::new(test_config(dir.path()), db.clone(), store.clone()).unwrap();
        write_block(&first, 2, 0, b"dirty before restart");
        write_block(&first, 2, 1, b"clean before restart");
        first.commit().unwrap();
        write_block(&first, 2, 0, b"dirty before restart!");
        let partial = first.staging_path(BlockKey::new(9, 9));
        fs::write(&partial, b"half").unwrap();
        fs::set_permissions(&partial, fs::Permissions::from_mode(0o640)).unwrap();
        first.destroy();
        drop(first);

        let second = BlockCache::new(test_config(dir.path()), db, store).unwrap();
        assert_eq!(second.load_staged().unwrap(), 2);
        assert!(!partial.exists());
        let stats = second.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.dirty_entries, 1);
        assert_eq!(stats.dirty_size, 21);
        assert_eq!(read_block(&second, 2, 0), b"dirty before restart!");
        second.destroy();
    }

    #[test]
    fn test_load_staged_rejects_unknown_files() {
        let fx = setup();
        fs::write(fx.cache.config().cache_dir.join("subdir_0").join("junk"), b"x").unwrap();
        assert!(fx.cache.load_staged().is_err());
        fx.cache.destroy();
    }

    #[test]
    fn test_expire_opened_closes_least_recent() {
        let fx = setup_with(|c| c.max_open_entries = 2);
        for blockno in 0..3 {
            drop(fx.cache.get(2, blockno).unwrap());
        }
        drop(fx.cache.get(2, 3).unwrap());
        {
            let state = fx.cache.inner.state.lock();
            assert!(!state.entries.peek(&BlockKey::new(2, 0)).unwrap().is_open());
            assert!(state.entries.peek(&BlockKey::new(2, 3)).unwrap().is_open());
            assert!(state.opened.len() <= 2);
        }
        assert_eq!(fx.cache.len(), 4);
        fx.cache.destroy();
    }

    #[test]
    fn test_close_and_reopen_preserve_content() {
        let fx = setup();
        write_block(&fx.cache, 2, 0, b"persistent");
        write_block(&fx.cache, 3, 0, b"other");
        fx.cache.schedule_close(2);
        assert_eq!(fx.cache.close_idle(), 1);
        {
            let state = fx.cache.inner.state.lock();
            assert!(!state.entries.peek(&BlockKey::new(2, 0)).unwrap().is_open());
            assert!(state.entries.peek(&BlockKey::new(3, 0)).unwrap().is_open());
        }
        assert_eq!(read_block(&fx.cache, 2, 0), b"persistent");
        assert_eq!(fx.cache.stats().dirty_entries, 2);
        fx.cache.destroy();
    }

    #[test]
    fn test_forced_upload_hysteresis() {
        let fx = setup_with(|c| c.max_size = 100);
        write_block(&fx.cache, 2, 0, &[1u8; 90]);
        assert!(fx.cache.stats().forced_upload);
        assert!(fx.cache.should_upload());
        fx.cache.commit().unwrap();
        let stats = fx.cache.stats();
        assert!(!stats.forced_upload);
        assert_eq!(stats.dirty_size, 0);
        fx.cache.destroy();
    }

    #[test]
    fn test_upload_idle_respects_switches() {
        let fx = setup_with(|c| c.commit_delay = Duration::ZERO);
        write_block(&fx.cache, 2, 0, b"background");
        assert_eq!(fx.cache.upload_idle().unwrap(), 0);

        fx.cache.set_upload_enabled(true);
        assert_eq!(fx.cache.upload_idle().unwrap(), 1);
        assert_eq!(fx.store.put_count(), 1);
        fx.cache.destroy();
    }

    #[test]
    fn test_upload_idle_backs_off_when_offline() {
        let fx = setup_with(|c| c.commit_delay = Duration::ZERO);
        fx.cache.request_snapshot_upload();
        write_block(&fx.cache, 2, 0, b"waiting");
        fx.store.set_offline(true);
        assert_eq!(fx.cache.upload_idle().unwrap(), 0);
        assert!(!fx.cache.stats().network_ok);

        fx.store.set_offline(false);
        assert_eq!(fx.cache.upload_idle().unwrap(), 1);
        assert!(!fx.cache.should_upload());
        fx.cache.destroy();
    }

    #[test]
    fn test_check_quota_toggles_writes() {
        let fx = setup_with(|c| c.quota = 1000);
        assert!(fx.cache.check_quota(1000));
        assert!(!fx.cache.check_quota(1001));
        assert!(!fx.cache.write_enabled());
        assert!(!fx.cache.stats().write_enabled);
        assert!(fx.cache.check_quota(10));
        fx.cache.destroy();
    }

    #[test]
    fn test_check_workers_with_healthy_pools() {
        let fx = setup_with(|c| {
            c.upload_threads = 2;
            c.removal_threads = 2;
        });
        assert_eq!(fx.cache.check_workers(), 0);
        fx.cache.destroy();
        assert_eq!(fx.cache.check_workers(), 0);
    }

    #[test]
    #[should_panic(expected = "without calling destroy")]
    fn test_drop_without_destroy_panics() {
        let fx = setup();
        drop(fx.cache.get(2, 0).unwrap());
        drop(fx);
    }
}
