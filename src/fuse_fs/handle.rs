use std::collections::{HashMap, HashSet};

/// Tracks open file handles per inode.
///
/// Inodes unlinked while still open are remembered so their blocks can be
/// dropped when the last handle goes away.
pub struct HandleTable {
    handles: HashMap<u64, u64>,
    open_counts: HashMap<u64, usize>,
    unlinked: HashSet<u64>,
    next_fh: u64,
}

/// Outcome of releasing one handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Released {
    pub inode: u64,
    /// No handle on the inode remains.
    pub last: bool,
    /// The inode was unlinked while open and must now be purged.
    pub purge: bool,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            handles: HashMap::new(),
            open_counts: HashMap::new(),
            unlinked: HashSet::new(),
            next_fh: 1,
        }
    }

    /// Allocate a new file handle on `inode`.
    pub fn open(&mut self, inode: u64) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, inode);
        *self.open_counts.entry(inode).or_default() += 1;
        fh
    }

    pub fn inode_of(&self, fh: u64) -> Option<u64> {
        self.handles.get(&fh).copied()
    }

    pub fn is_open(&self, inode: u64) -> bool {
        self.open_counts.contains_key(&inode)
    }

    /// Purge `inode` once its last handle is released.
    pub fn defer_purge(&mut self, inode: u64) {
        self.unlinked.insert(inode);
    }

    /// Remove a handle.
    pub fn release(&mut self, fh: u64) -> Option<Released> {
        let inode = self.handles.remove(&fh)?;
        let count = self.open_counts.entry(inode).or_insert(1);
        *count -= 1;
        let last = *count == 0;
        let mut purge = false;
        if last {
            self.open_counts.remove(&inode);
            purge = self.unlinked.remove(&inode);
        }
        Some(Released { inode, last, purge })
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
