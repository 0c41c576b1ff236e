use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{BlobHash, BlockId, ObjectId};

/// Inode number of the file system root.
pub const ROOT_INODE: u64 = 1;

/// File type bits of `inodes.mode`.
pub const MODE_DIR: u32 = 0o040000;
pub const MODE_FILE: u32 = 0o100000;

/// Timestamp with second + nanosecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub secs: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        let dur = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self {
            secs: dur.as_secs() as i64,
            nanos: dur.subsec_nanos(),
        }
    }
}

/// A row of the `blocks` table: one per distinct content hash.
#[derive(Debug, Clone)]
pub struct BlockRecord {
    pub id: BlockId,
    pub hash: BlobHash,
    pub refcount: i64,
    pub obj_id: ObjectId,
    pub size: u64,
}

/// A row of the `objects` table: one per blob stored remotely.
#[derive(Debug, Clone)]
pub struct ObjectRecord {
    pub id: ObjectId,
    pub refcount: i64,
    /// Stored size; `None` until the upload has been confirmed.
    pub size: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct InodeRecord {
    pub id: u64,
    pub mode: u32,
    pub size: u64,
    pub refcount: i64,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    pub locked: bool,
}

impl InodeRecord {
    pub fn is_dir(&self) -> bool {
        self.mode & MODE_DIR != 0
    }
}

/// How `commit_block` linked a block's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    /// New content: a fresh object must be uploaded.
    New { block_id: BlockId, obj_id: ObjectId },
    /// The block already pointed at this content.
    Unchanged { block_id: BlockId },
    /// The content matched another existing block, which is now shared.
    Deduplicated { block_id: BlockId },
}

/// What happened to the block a logical block used to point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Still referenced elsewhere; only its refcount dropped.
    Decremented(BlockId),
    /// The block row was deleted but its object is still referenced.
    BlockDeleted(BlockId),
    /// Block and object rows were deleted; the remote blob must be removed.
    ObjectDeleted(BlockId, ObjectId),
}

impl Release {
    /// The object whose blob must be deleted remotely, if any.
    pub fn orphaned_object(&self) -> Option<ObjectId> {
        match self {
            Release::ObjectDeleted(_, obj_id) => Some(*obj_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitOutcome {
    pub linkage: Linkage,
    pub released: Option<Release>,
    /// Object of a reused block whose upload was never confirmed.
    pub unconfirmed: Option<ObjectId>,
}

/// File system wide statistics from SQL aggregates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsStats {
    /// Directory entries (`contents` rows).
    pub entries: u64,
    /// Objects stored remotely.
    pub objects: u64,
    pub inodes: u64,
    /// Sum of logical file sizes.
    pub fs_size: u64,
    /// Sum of distinct block sizes.
    pub dedup_size: u64,
    /// Sum of confirmed stored object sizes.
    pub stored_size: u64,
}

/// Result of a snapshot tree copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub files: u64,
    pub size: u64,
}
