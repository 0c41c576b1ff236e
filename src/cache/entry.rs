use std::fs::{self, File, OpenOptions, Permissions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::BlockKey;

/// Mode of a staging file whose content matches the backend.
const MODE_CLEAN: u32 = 0o400;
/// Mode of a staging file with local modifications.
const MODE_DIRTY: u32 = 0o600;
/// Mode of a staging file that is still being downloaded.
const MODE_PARTIAL: u32 = 0o640;

/// True if the permission bits mark the file as modified locally.
pub fn is_dirty_mode(mode: u32) -> bool {
    mode & 0o200 != 0
}

/// True if the permission bits mark an interrupted download.
pub fn is_partial_mode(mode: u32) -> bool {
    mode & 0o040 != 0
}

/// Path of the staging file for `key` below `cache_dir`.
pub fn staging_path(cache_dir: &Path, key: BlockKey, shard_count: u64) -> PathBuf {
    let shard = key.inode.wrapping_add(key.blockno) % shard_count.max(1);
    cache_dir
        .join(format!("subdir_{shard}"))
        .join(format!("{}-{}", key.inode, key.blockno))
}

/// Parse a staging file name of the form `<inode>-<blockno>`.
pub fn parse_staging_name(name: &str) -> Option<BlockKey> {
    let (inode, blockno) = name.split_once('-')?;
    if inode.is_empty() || blockno.is_empty() {
        return None;
    }
    if !inode.bytes().chain(blockno.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(BlockKey::new(inode.parse().ok()?, blockno.parse().ok()?))
}

/// One locally staged block.
///
/// The dirty state lives in the staging file's permission bits as well as in
/// memory, so it survives a restart. The descriptor may be closed to stay
/// within the open-file budget while the entry remains cached.
#[derive(Debug)]
pub struct CacheEntry {
    key: BlockKey,
    path: PathBuf,
    file: Option<File>,
    size: u64,
    dirty: bool,
    pub(crate) last_access: Instant,
    pub(crate) to_delete: bool,
}

impl CacheEntry {
    /// Create a new, empty and clean staging file, truncating any existing one.
    pub fn create(key: BlockKey, path: PathBuf) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(MODE_DIRTY)
            .open(&path)?;
        file.set_permissions(Permissions::from_mode(MODE_CLEAN))?;
        Ok(Self {
            key,
            path,
            file: Some(file),
            size: 0,
            dirty: false,
            last_access: Instant::now(),
            to_delete: false,
        })
    }

    /// Create an empty staging file for a download.
    ///
    /// The file carries the partial mode from the moment it exists, so an
    /// interrupted download is never mistaken for a clean block. It stays
    /// partial until [`mark_clean`](Self::mark_clean).
    pub fn create_partial(key: BlockKey, path: PathBuf) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(MODE_PARTIAL)
            .open(&path)?;
        // Covers a pre-existing file and the umask.
        file.set_permissions(Permissions::from_mode(MODE_PARTIAL))?;
        Ok(Self {
            key,
            path,
            file: Some(file),
            size: 0,
            dirty: true,
            last_access: Instant::now(),
            to_delete: false,
        })
    }

    /// Open an existing staging file, inferring the dirty state from its mode.
    pub fn open(key: BlockKey, path: PathBuf) -> io::Result<Self> {
        let mut entry = Self::load(key, path)?;
        entry.reopen()?;
        Ok(entry)
    }

    /// Adopt an existing staging file without opening a descriptor.
    pub fn load(key: BlockKey, path: PathBuf) -> io::Result<Self> {
        let meta = fs::metadata(&path)?;
        Ok(Self {
            key,
            path,
            file: None,
            size: meta.len(),
            dirty: is_dirty_mode(meta.permissions().mode()),
            last_access: Instant::now(),
            to_delete: false,
        })
    }

    pub fn key(&self) -> BlockKey {
        self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn touch(&mut self) {
        self.last_access = Instant::now();
    }

    /// Release the descriptor. Content and cache membership are kept.
    pub fn close(&mut self) {
        self.file = None;
    }

    /// Acquire a descriptor again, re-reading the dirty state from disk.
    pub fn reopen(&mut self) -> io::Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        let mode = fs::metadata(&self.path)?.permissions().mode();
        let file = match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                // Clean files are read-only for the owner too.
                fs::set_permissions(&self.path, Permissions::from_mode(MODE_DIRTY))?;
                let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
                file.set_permissions(Permissions::from_mode(mode & 0o777))?;
                file
            }
            Err(e) => return Err(e),
        };
        self.dirty = is_dirty_mode(mode);
        self.size = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    /// Open an independent read-only descriptor on the staging file.
    pub fn open_reader(&self) -> io::Result<File> {
        File::open(&self.path)
    }

    fn file_mut(&mut self) -> io::Result<&mut File> {
        let key = self.key;
        self.file.as_mut().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Other,
                format!("cache entry {key} is closed"),
            )
        })
    }

    fn set_mode(&mut self, mode: u32) -> io::Result<()> {
        match &self.file {
            Some(file) => file.set_permissions(Permissions::from_mode(mode)),
            None => fs::set_permissions(&self.path, Permissions::from_mode(mode)),
        }
    }

    fn mark_dirty(&mut self) -> io::Result<()> {
        if !self.dirty {
            self.set_mode(MODE_DIRTY)?;
            self.dirty = true;
        }
        Ok(())
    }

    /// Record that the content now matches the backend.
    pub fn mark_clean(&mut self) -> io::Result<()> {
        self.set_mode(MODE_CLEAN)?;
        self.dirty = false;
        Ok(())
    }

    pub fn seek(&mut self, offset: u64) -> io::Result<()> {
        self.file_mut()?.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    /// Read up to `len` bytes from the current position.
    pub fn read(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let file = self.file_mut()?;
        let mut buf = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Write at the current position, marking the entry dirty.
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.mark_dirty()?;
        let file = self.file_mut()?;
        file.write_all(data)?;
        let pos = file.stream_position()?;
        self.size = self.size.max(pos);
        Ok(())
    }

    /// Truncate (or extend) to `size` bytes, marking the entry dirty.
    pub fn truncate(&mut self, size: u64) -> io::Result<()> {
        self.mark_dirty()?;
        self.file_mut()?.set_len(size)?;
        self.size = size;
        Ok(())
    }

    /// Copy a downloaded object into the file without touching its mode.
    pub fn fill_from(&mut self, reader: &mut dyn Read) -> io::Result<u64> {
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(0))?;
        let copied = io::copy(reader, file)?;
        file.set_len(copied)?;
        self.size = copied;
        Ok(copied)
    }

    /// Delete the staging file. The entry must already be out of the cache.
    pub fn unlink(mut self) -> io::Result<()> {
        self.file = None;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> (PathBuf, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        (dir.path().join("5-2"), dir)
    }

    fn mode_of(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[test]
    fn test_staging_path_shards() {
        let base = Path::new("/cache");
        let path = staging_path(base, BlockKey::new(150, 7), 100);
        assert_eq!(path, Path::new("/cache/subdir_57/150-7"));
        assert_eq!(parse_staging_name("150-7"), Some(BlockKey::new(150, 7)));
        assert_eq!(parse_staging_name("150-"), None);
        assert_eq!(parse_staging_name("x-1"), None);
        assert_eq!(parse_staging_name("1-2-3"), None);
    }

    #[test]
    fn test_create_is_clean_and_empty() {
        let (path, _dir) = setup();
        let entry = CacheEntry::create(BlockKey::new(5, 2), path.clone()).unwrap();
        assert!(!entry.is_dirty());
        assert!(entry.is_open());
        assert_eq!(entry.size(), 0);
        assert_eq!(mode_of(&path), MODE_CLEAN);
    }

    #[test]
    fn test_write_marks_dirty_on_disk() {
        let (path, _dir) = setup();
        let mut entry = CacheEntry::create(BlockKey::new(5, 2), path.clone()).unwrap();
        entry.write(b"hello").unwrap();
        assert!(entry.is_dirty());
        assert_eq!(entry.size(), 5);
        assert!(is_dirty_mode(mode_of(&path)));

        entry.seek(2).unwrap();
        entry.write(b"LLO world").unwrap();
        assert_eq!(entry.size(), 11);
        entry.seek(0).unwrap();
        assert_eq!(entry.read(100).unwrap(), b"heLLO world");
    }

    #[test]
    fn test_truncate() {
        let (path, _dir) = setup();
        let mut entry = CacheEntry::create(BlockKey::new(5, 2), path).unwrap();
        entry.write(b"0123456789").unwrap();
        entry.mark_clean().unwrap();
        entry.truncate(4).unwrap();
        assert!(entry.is_dirty());
        assert_eq!(entry.size(), 4);
        entry.seek(0).unwrap();
        assert_eq!(entry.read(10).unwrap(), b"0123");
    }

    #[test]
    fn test_close_reopen_preserves_state() {
        let (path, _dir) = setup();
        let mut entry = CacheEntry::create(BlockKey::new(5, 2), path).unwrap();
        entry.write(b"dirty data").unwrap();
        for _ in 0..3 {
            entry.close();
            assert!(!entry.is_open());
            entry.reopen().unwrap();
            assert!(entry.is_dirty());
        }
        entry.mark_clean().unwrap();
        for _ in 0..3 {
            entry.close();
            entry.reopen().unwrap();
            assert!(!entry.is_dirty());
        }
        entry.seek(0).unwrap();
        assert_eq!(entry.read(100).unwrap(), b"dirty data");
        assert_eq!(entry.size(), 10);
    }

    #[test]
    fn test_read_on_closed_entry_fails() {
        let (path, _dir) = setup();
        let mut entry = CacheEntry::create(BlockKey::new(5, 2), path).unwrap();
        entry.close();
        assert!(entry.read(1).is_err());
    }

    #[test]
    fn test_load_infers_dirty_from_mode() {
        let (path, _dir) = setup();
        let mut entry = CacheEntry::create(BlockKey::new(5, 2), path.clone()).unwrap();
        entry.write(b"abc").unwrap();
        drop(entry);

        let loaded = CacheEntry::load(BlockKey::new(5, 2), path.clone()).unwrap();
        assert!(loaded.is_dirty());
        assert!(!loaded.is_open());
        assert_eq!(loaded.size(), 3);

        let opened = CacheEntry::open(BlockKey::new(5, 2), path).unwrap();
        assert!(opened.is_dirty());
        assert!(opened.is_open());
    }

    #[test]
    fn test_create_partial_marks_download() {
        let (path, _dir) = setup();
        let mut entry = CacheEntry::create_partial(BlockKey::new(5, 2), path.clone()).unwrap();
        assert!(entry.is_dirty());
        assert_eq!(mode_of(&path), MODE_PARTIAL);
        entry.fill_from(&mut &b"remote"[..]).unwrap();
        assert!(is_partial_mode(mode_of(&path)));
        assert_eq!(entry.size(), 6);
        entry.mark_clean().unwrap();
        assert!(!is_partial_mode(mode_of(&path)));
        assert!(!entry.is_dirty());
    }

    #[test]
    fn test_interrupted_download_is_never_clean() {
        let (path, _dir) = setup();
        // Nothing is written before the process dies.
        let entry = CacheEntry::create_partial(BlockKey::new(5, 2), path.clone()).unwrap();
        drop(entry);

        let mode = mode_of(&path);
        assert!(is_partial_mode(mode));
        let loaded = CacheEntry::load(BlockKey::new(5, 2), path).unwrap();
        assert_eq!(loaded.size(), 0);
        assert!(loaded.is_dirty());
    }

    #[test]
    fn test_unlink() {
        let (path, _dir) = setup();
        let entry = CacheEntry::create(BlockKey::new(5, 2), path.clone()).unwrap();
        entry.unlink().unwrap();
        assert!(!path.exists());
    }
}
