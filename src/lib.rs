pub mod cache;
pub mod config;
pub mod fuse_fs;
pub mod metadata;
pub mod store;

use std::fmt;

use sha2::{Digest, Sha256};

use store::StoreError;

/// A SHA-256 hash identifying block content.
pub type BlobHash = [u8; 32];

/// Compute the SHA-256 hash of a byte slice.
pub fn sha256(data: &[u8]) -> BlobHash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Logical address of a cached block: the `blockno`-th block of `inode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    pub inode: u64,
    pub blockno: u64,
}

impl BlockKey {
    pub fn new(inode: u64, blockno: u64) -> Self {
        Self { inode, blockno }
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.inode, self.blockno)
    }
}

/// Row id in the `blocks` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub i64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Row id in the `objects` table, also naming the remote blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub i64);

impl ObjectId {
    /// Backend key of the blob holding this object.
    pub fn key(&self) -> String {
        format!("data_{}", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("Backend error: {0}")]
    Store(#[from] StoreError),

    /// Metadata references an object the backend does not have.
    #[error("object {obj_id} is corrupted or missing ({detail}), fsck required")]
    Corrupted { obj_id: ObjectId, detail: String },

    #[error("no cache buffers available: dirty data cannot be evicted")]
    NoBuffers,

    #[error("try again: {0}")]
    TryAgain(String),

    #[error("cache is shutting down")]
    ShuttingDown,

    #[error("file system is not writable (quota reached or writes disabled)")]
    NoSpace,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl GatewayError {
    /// Errno reported to the kernel for this error.
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            GatewayError::Io(_) => libc::EIO,
            GatewayError::Db(_) => libc::EIO,
            GatewayError::Store(e) if e.is_transient() => libc::EAGAIN,
            GatewayError::Store(_) => libc::EIO,
            GatewayError::Corrupted { .. } => libc::EIO,
            GatewayError::NoBuffers => libc::ENOBUFS,
            GatewayError::TryAgain(_) => libc::EAGAIN,
            GatewayError::ShuttingDown => libc::ESHUTDOWN,
            GatewayError::NoSpace => libc::ENOSPC,
            GatewayError::NotFound(_) => libc::ENOENT,
            GatewayError::Other(_) => libc::EIO,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
