pub mod hasher;
pub mod memory;

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::PathBuf;

use hasher::StreamingHasher;

pub use memory::MemoryObjectStore;

/// Key written by connectivity probes. Never collides with `data_<id>` keys.
pub const PROBE_KEY: &str = "cloud_gw_test_connection";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend confirmed that the object does not exist.
    #[error("no such object: {key}")]
    NoSuchObject { key: String },

    #[error("backend unavailable: {0}")]
    Backend(String),

    #[error("backend I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    /// Transient errors are worth retrying; a missing object never is.
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::NoSuchObject { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Remote blob store holding one object per distinct block content.
///
/// Implementations handle their own connection-level timeouts; callers layer
/// their retry policy on top.
pub trait ObjectStore: Send + Sync {
    /// Store everything `data` yields under `key`, returning the stored size.
    fn put(&self, key: &str, data: &mut dyn Read) -> StoreResult<u64>;

    /// Open the object stored under `key` for reading.
    fn get(&self, key: &str) -> StoreResult<Box<dyn Read + Send>>;

    fn delete(&self, key: &str) -> StoreResult<()>;

    /// List keys starting with `prefix`.
    fn list(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Cheap no-op write used to check that the backend is reachable.
    fn probe(&self) -> StoreResult<()> {
        self.put(PROBE_KEY, &mut &b"nodata"[..]).map(|_| ())
    }
}

/// Directory-backed object store.
///
/// Objects are stored as `{base_dir}/{2-char-prefix}/{key}` where the prefix
/// is taken from the SHA-256 of the key, spreading keys over 256 directories.
pub struct LocalObjectStore {
    base_dir: PathBuf,
    temp_dir: PathBuf,
}

impl LocalObjectStore {
    pub fn new(base_dir: PathBuf) -> StoreResult<Self> {
        let temp_dir = base_dir.join("tmp");
        fs::create_dir_all(&temp_dir)?;
        Ok(Self { base_dir, temp_dir })
    }

    fn object_path(&self, key: &str) -> StoreResult<PathBuf> {
        if key.is_empty() || key.contains('/') || key == "tmp" {
            return Err(StoreError::Backend(format!("invalid object key {key:?}")));
        }
        let prefix = hex::encode(crate::sha256(key.as_bytes()));
        Ok(self.base_dir.join(&prefix[..2]).join(key))
    }
}

impl ObjectStore for LocalObjectStore {
    fn put(&self, key: &str, data: &mut dyn Read) -> StoreResult<u64> {
        let dest = self.object_path(key)?;
        let temp_path = self.temp_dir.join(uuid::Uuid::new_v4().to_string());
        let temp_file = File::create(&temp_path)?;
        let mut hasher = StreamingHasher::new(io::BufWriter::new(temp_file));

        let copied = io::copy(data, &mut hasher).and_then(|_| hasher.flush());
        if let Err(e) = copied {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }
        let (_, size, _writer) = hasher.finish();

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&temp_path, &dest)?;
        Ok(size)
    }

    fn get(&self, key: &str) -> StoreResult<Box<dyn Read + Send>> {
        let path = self.object_path(key)?;
        match File::open(&path) {
            Ok(file) => Ok(Box::new(io::BufReader::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NoSuchObject {
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        let path = self.object_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NoSuchObject {
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        for shard in fs::read_dir(&self.base_dir)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() || shard.path() == self.temp_dir {
                continue;
            }
            for object in fs::read_dir(shard.path())? {
                let name = object?.file_name().to_string_lossy().to_string();
                if name.starts_with(prefix) {
                    keys.push(name);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> (LocalObjectStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path().join("objects")).unwrap();
        (store, dir)
    }

    fn read_all(store: &LocalObjectStore, key: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        store.get(key).unwrap().read_to_end(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_put_and_get() {
        let (store, _dir) = setup();
        let size = store.put("data_1", &mut &b"hello world"[..]).unwrap();
        assert_eq!(size, 11);
        assert_eq!(read_all(&store, "data_1"), b"hello world");
    }

    #[test]
    fn test_put_overwrites() {
        let (store, _dir) = setup();
        store.put("data_1", &mut &b"first"[..]).unwrap();
        store.put("data_1", &mut &b"second"[..]).unwrap();
        assert_eq!(read_all(&store, "data_1"), b"second");
    }

    #[test]
    fn test_missing_object_is_permanent() {
        let (store, _dir) = setup();
        let err = store.get("data_404").err().unwrap();
        assert!(matches!(err, StoreError::NoSuchObject { .. }));
        assert!(!err.is_transient());
        assert!(matches!(
            store.delete("data_404"),
            Err(StoreError::NoSuchObject { .. })
        ));
    }

    #[test]
    fn test_delete() {
        let (store, _dir) = setup();
        store.put("data_2", &mut &b"removeme"[..]).unwrap();
        store.delete("data_2").unwrap();
        assert!(store.get("data_2").is_err());
    }

    #[test]
    fn test_list_and_probe() {
        let (store, _dir) = setup();
        store.put("data_1", &mut &b"a"[..]).unwrap();
        store.put("data_2", &mut &b"b"[..]).unwrap();
        store.probe().unwrap();
        assert_eq!(store.list("data_").unwrap(), vec!["data_1", "data_2"]);
        assert_eq!(store.list("").unwrap().len(), 3);
    }

    #[test]
    fn test_invalid_key_rejected() {
        let (store, _dir) = setup();
        assert!(store.put("../escape", &mut &b"x"[..]).is_err());
    }
}
