pub mod handle;

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cache::{BlockCache, CacheStats};
use crate::metadata::types::{CopyStats, FsStats, InodeRecord, MODE_DIR, MODE_FILE};
use crate::metadata::MetadataDb;
use crate::{GatewayError, Result};
use handle::HandleTable;

/// File operations over the block cache.
///
/// File content is split into blocks of `block_size` bytes; block `n` of an
/// inode covers bytes `n * block_size .. (n + 1) * block_size`. Directory
/// structure and sizes live in the metadata database.
pub struct BlockFs {
    db: Arc<MetadataDb>,
    cache: Arc<BlockCache>,
    block_size: u64,
    handles: Mutex<HandleTable>,
}

impl BlockFs {
    pub fn new(db: Arc<MetadataDb>, cache: Arc<BlockCache>, block_size: u64) -> Self {
        Self {
            db,
            cache,
            block_size: block_size.max(1),
            handles: Mutex::new(HandleTable::new()),
        }
    }

    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    fn inode(&self, inode: u64) -> Result<InodeRecord> {
        self.db
            .get_inode(inode)?
            .ok_or_else(|| GatewayError::NotFound(format!("inode {inode}")))
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.cache.write_enabled() {
            Ok(())
        } else {
            Err(GatewayError::NoSpace)
        }
    }

    pub fn getattr(&self, inode: u64) -> Result<InodeRecord> {
        self.inode(inode)
    }

    pub fn lookup(&self, parent: u64, name: &str) -> Result<u64> {
        self.db
            .lookup(parent, name)?
            .ok_or_else(|| GatewayError::NotFound(name.to_string()))
    }

    pub fn readdir(&self, inode: u64) -> Result<Vec<(String, u64)>> {
        self.db.list_children(inode)
    }

    fn make_node(&self, parent: u64, name: &str, mode: u32) -> Result<u64> {
        if !self.inode(parent)?.is_dir() {
            return Err(GatewayError::Other(format!("inode {parent} is not a directory")));
        }
        if self.db.lookup(parent, name)?.is_some() {
            return Err(GatewayError::Other(format!("{name} already exists")));
        }
        let inode = self.db.create_inode(mode)?;
        self.db.add_entry(parent, name, inode)?;
        Ok(inode)
    }

    pub fn mkdir(&self, parent: u64, name: &str) -> Result<u64> {
        let inode = self.make_node(parent, name, MODE_DIR | 0o755)?;
        debug!(parent, name, inode, "mkdir");
        Ok(inode)
    }

    /// Create a regular file and open it. Returns `(inode, fh)`.
    pub fn create(&self, parent: u64, name: &str) -> Result<(u64, u64)> {
        self.ensure_writable()?;
        let inode = self.make_node(parent, name, MODE_FILE | 0o644)?;
        let fh = self.handles.lock().open(inode);
        debug!(parent, name, inode, fh, "create");
        Ok((inode, fh))
    }

    pub fn open(&self, inode: u64) -> Result<u64> {
        self.inode(inode)?;
        Ok(self.handles.lock().open(inode))
    }

    /// Drop a file handle.
    ///
    /// When the last handle of an inode goes away its cached blocks are
    /// scheduled for closing, and an unlinked inode is purged.
    pub fn release(&self, fh: u64) -> Result<()> {
        let Some(released) = self.handles.lock().release(fh) else {
            return Err(GatewayError::NotFound(format!("file handle {fh}")));
        };
        if released.last {
            self.cache.schedule_close(released.inode);
        }
        if released.purge {
            self.purge(released.inode)?;
        }
        Ok(())
    }

    /// Read up to `len` bytes at `offset`. Holes read as zeros.
    pub fn read(&self, inode: u64, offset: u64, len: usize) -> Result<Vec<u8>> {
        let size = self.inode(inode)?.size;
        if offset >= size {
            return Ok(Vec::new());
        }
        let end = size.min(offset.saturating_add(len as u64));
        let mut buf = Vec::with_capacity((end - offset) as usize);

        let mut pos = offset;
        while pos < end {
            let blockno = pos / self.block_size;
            let block_offset = pos % self.block_size;
            let want = (self.block_size - block_offset).min(end - pos) as usize;
            let mut data = self.cache.get(inode, blockno)?.read(block_offset, want)?;
            data.resize(want, 0);
            buf.extend_from_slice(&data);
            pos += want as u64;
        }
        Ok(buf)
    }

    /// Write `data` at `offset`, growing the file as needed.
    pub fn write(&self, inode: u64, offset: u64, data: &[u8]) -> Result<usize> {
        self.ensure_writable()?;
        let mut pos = offset;
        let mut written = 0;
        while written < data.len() {
            let blockno = pos / self.block_size;
            let block_offset = pos % self.block_size;
            let chunk = ((self.block_size - block_offset) as usize).min(data.len() - written);
            self.cache
                .get(inode, blockno)?
                .write(block_offset, &data[written..written + chunk])?;
            written += chunk;
            pos += chunk as u64;
        }
        self.db.extend_inode_size(inode, offset + written as u64)?;
        debug!(inode, offset, written, "write");
        Ok(written)
    }

    /// Set the file size, dropping blocks past the new end.
    pub fn truncate(&self, inode: u64, size: u64) -> Result<()> {
        self.ensure_writable()?;
        let old_size = self.inode(inode)?.size;
        if size < old_size {
            let last_block = size / self.block_size;
            let cutoff = size % self.block_size;
            let total_blocks = old_size.div_ceil(self.block_size);
            if cutoff == 0 {
                self.cache.remove(inode, last_block, total_blocks)?;
            } else {
                self.cache.remove(inode, last_block + 1, total_blocks)?;
                let mut handle = self.cache.get(inode, last_block)?;
                if handle.size() > cutoff {
                    handle.truncate(cutoff)?;
                }
            }
        }
        self.db.set_inode_size(inode, size)?;
        debug!(inode, old_size, size, "truncate");
        Ok(())
    }

    /// Remove the entry `name` from `parent`.
    ///
    /// The inode's blocks are released once no name and no handle refers to it.
    pub fn unlink(&self, parent: u64, name: &str) -> Result<()> {
        let inode = self.lookup(parent, name)?;
        if self.inode(inode)?.is_dir() && !self.db.list_children(inode)?.is_empty() {
            return Err(GatewayError::Other(format!("directory {name} is not empty")));
        }
        let (inode, refcount) = self.db.remove_entry(parent, name)?;
        debug!(parent, name, inode, refcount, "unlink");
        if refcount > 0 {
            return Ok(());
        }

        let mut handles = self.handles.lock();
        if handles.is_open(inode) {
            debug!(inode, "Inode still open, deferring purge");
            handles.defer_purge(inode);
            return Ok(());
        }
        drop(handles);
        self.purge(inode)
    }

    fn purge(&self, inode: u64) -> Result<()> {
        let size = self.inode(inode)?.size;
        self.cache.remove(inode, 0, size.div_ceil(self.block_size))?;
        self.db.delete_inode(inode)?;
        debug!(inode, size, "Purged inode");
        Ok(())
    }

    /// Start uploading the dirty blocks of `inode`.
    pub fn fsync(&self, inode: u64) -> Result<()> {
        self.cache.commit_inode(inode)
    }

    pub fn commit_all_dirty(&self) -> Result<()> {
        self.cache.commit()
    }

    /// Succeed only when no dirty block remains.
    ///
    /// Otherwise request background uploading and fail with `TryAgain`, so
    /// the caller retries once the uploads have drained.
    pub fn flush_and_lock_for_snapshot(&self) -> Result<()> {
        let stats = self.cache.stats();
        if stats.dirty_entries == 0 {
            return Ok(());
        }
        self.cache.request_snapshot_upload();
        warn!(dirty_entries = stats.dirty_entries, "Dirty data pending, snapshot must wait");
        Err(GatewayError::TryAgain(format!(
            "{} dirty blocks not uploaded yet",
            stats.dirty_entries
        )))
    }

    /// Copy the tree below directory `src` into the empty directory `target`.
    pub fn copy_tree(&self, src: u64, target: u64) -> Result<CopyStats> {
        self.flush_and_lock_for_snapshot()?;
        if !self.inode(target)?.is_dir() || !self.db.list_children(target)?.is_empty() {
            return Err(GatewayError::Other(format!("target {target} is not an empty directory")));
        }
        let stats = self.db.copy_tree(src, target)?;
        info!(src, target, files = stats.files, size = stats.size, "Copied tree");
        Ok(stats)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn fs_stats(&self) -> Result<FsStats> {
        self.db.stats()
    }

    /// Re-evaluate the write switch against the logical file system size.
    pub fn check_quota(&self) -> Result<bool> {
        let fs_size = self.db.total_inode_size()?;
        Ok(self.cache.check_quota(fs_size))
    }
}
