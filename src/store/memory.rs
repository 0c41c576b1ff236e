use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

use super::{ObjectStore, StoreError, StoreResult, PROBE_KEY};

/// In-memory object store with call counters and fault injection.
///
/// Used by tests and dry runs. Probe writes are not counted as puts.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    puts: AtomicU64,
    gets: AtomicU64,
    deleted: Mutex<Vec<String>>,
    fail_next: AtomicU32,
    panic_next_puts: AtomicU32,
    offline: AtomicBool,
    held: Mutex<Held>,
    released: Condvar,
}

#[derive(Default)]
struct Held {
    puts: bool,
    gets: bool,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful data puts.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    /// Number of successful gets.
    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::SeqCst)
    }

    /// Keys removed by successful deletes, in order.
    pub fn deleted_keys(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().contains_key(key)
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(key).cloned()
    }

    /// Make the next `n` calls fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` data puts panic, as a buggy backend would.
    pub fn panic_next_puts(&self, n: u32) {
        self.panic_next_puts.store(n, Ordering::SeqCst);
    }

    /// While offline every call fails with a transient error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Block data puts until [`release_puts`](Self::release_puts) is called.
    pub fn hold_puts(&self) {
        self.held.lock().puts = true;
    }

    pub fn release_puts(&self) {
        self.held.lock().puts = false;
        self.released.notify_all();
    }

    /// Block gets until [`release_gets`](Self::release_gets) is called.
    pub fn hold_gets(&self) {
        self.held.lock().gets = true;
    }

    pub fn release_gets(&self) {
        self.held.lock().gets = false;
        self.released.notify_all();
    }

    fn wait_released(&self, pick: impl Fn(&Held) -> bool) {
        let mut held = self.held.lock();
        while pick(&held) {
            self.released.wait(&mut held);
        }
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("backend offline".into()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(StoreError::Backend("injected failure".into()));
        }
        Ok(())
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put(&self, key: &str, data: &mut dyn Read) -> StoreResult<u64> {
        self.check_available()?;
        let mut buf = Vec::new();
        data.read_to_end(&mut buf)?;
        if key != PROBE_KEY {
            let panics = self
                .panic_next_puts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if panics.is_ok() {
                panic!("backend crashed storing {key}");
            }
            self.wait_released(|held| held.puts);
        }
        let size = buf.len() as u64;
        self.objects.lock().insert(key.to_string(), buf);
        if key != PROBE_KEY {
            self.puts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(size)
    }

    fn get(&self, key: &str) -> StoreResult<Box<dyn Read + Send>> {
        self.check_available()?;
        self.wait_released(|held| held.gets);
        let data = self
            .objects
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NoSuchObject {
                key: key.to_string(),
            })?;
        self.gets.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(io::Cursor::new(data)))
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.check_available()?;
        if self.objects.lock().remove(key).is_none() {
            return Err(StoreError::NoSuchObject {
                key: key.to_string(),
            });
        }
        self.deleted.lock().push(key.to_string());
        Ok(())
    }

    fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.check_available()?;
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_skip_probe() {
        let store = MemoryObjectStore::new();
        store.put("data_1", &mut &b"abc"[..]).unwrap();
        store.probe().unwrap();
        assert_eq!(store.put_count(), 1);
        assert_eq!(store.object("data_1").unwrap(), b"abc");
    }

    #[test]
    fn test_fail_next() {
        let store = MemoryObjectStore::new();
        store.fail_next(2);
        assert!(store.probe().is_err());
        assert!(store.probe().is_err());
        assert!(store.probe().is_ok());
    }

    #[test]
    fn test_offline() {
        let store = MemoryObjectStore::new();
        store.put("data_1", &mut &b"abc"[..]).unwrap();
        store.set_offline(true);
        let err = store.get("data_1").err().unwrap();
        assert!(err.is_transient());
        store.set_offline(false);
        assert!(store.get("data_1").is_ok());
    }

    #[test]
    #[should_panic(expected = "backend crashed")]
    fn test_panic_next_puts() {
        let store = MemoryObjectStore::new();
        store.panic_next_puts(1);
        store.probe().unwrap();
        let _ = store.put("data_1", &mut &b"abc"[..]);
    }

    #[test]
    fn test_delete_records_key() {
        let store = MemoryObjectStore::new();
        store.put("data_3", &mut &b"abc"[..]).unwrap();
        store.delete("data_3").unwrap();
        assert_eq!(store.deleted_keys(), vec!["data_3".to_string()]);
        assert!(!store.contains("data_3"));
    }
}
