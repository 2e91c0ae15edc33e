/*!
The narrow durable-store adapter.

The engine persists three kinds of records (bundles by id, links by name,
registrations by id) through this keyed byte-blob interface. Concrete
backends live outside the crate; [`MemStore`] backs tests and
store-optional deployments.

A [`Sentinel`] file distinguishes a clean shutdown from a crash at
startup, so recovery can decide whether unconfirmed records are trustworthy.
*/

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("key not found")]
    NotFound,

    #[error("key already exists")]
    Exists,

    #[error("store busy")]
    Busy,

    #[error("stored object has a different type code")]
    BadType,

    #[error(transparent)]
    Other(#[from] Box<dyn core::error::Error + Send + Sync>),
}

pub type Result<T> = core::result::Result<T, StoreError>;

/// Keys for the three record namespaces.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StoreKey {
    Bundle(u64),
    Link(String),
    Registration(u32),
}

/// Behavior of `put` when the key exists (or doesn't).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutFlags {
    /// Insert; fail with `Exists` if present.
    Create,
    /// Update; fail with `NotFound` if absent.
    Replace,
    /// Insert or update.
    Upsert,
}

pub trait DurableStore: Send + Sync {
    fn get(&self, key: &StoreKey) -> Result<Vec<u8>>;

    fn put(&self, key: StoreKey, type_code: u32, data: &[u8], flags: PutFlags) -> Result<()>;

    fn del(&self, key: &StoreKey) -> Result<()>;

    /// Snapshot of every key currently stored.
    fn keys(&self) -> Vec<StoreKey>;

    fn size(&self) -> usize;
}

/// In-memory store for tests and storeless deployments.
#[derive(Default)]
pub struct MemStore {
    map: Mutex<BTreeMap<StoreKey, (u32, Vec<u8>)>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableStore for MemStore {
    fn get(&self, key: &StoreKey) -> Result<Vec<u8>> {
        self.map
            .lock()
            .expect("lock poisoned")
            .get(key)
            .map(|(_, data)| data.clone())
            .ok_or(StoreError::NotFound)
    }

    fn put(&self, key: StoreKey, type_code: u32, data: &[u8], flags: PutFlags) -> Result<()> {
        let mut map = self.map.lock().expect("lock poisoned");
        match (map.contains_key(&key), flags) {
            (true, PutFlags::Create) => Err(StoreError::Exists),
            (false, PutFlags::Replace) => Err(StoreError::NotFound),
            (true, _) => {
                let existing = map.get(&key).map(|(t, _)| *t);
                if existing != Some(type_code) {
                    return Err(StoreError::BadType);
                }
                map.insert(key, (type_code, data.to_vec()));
                Ok(())
            }
            (false, _) => {
                map.insert(key, (type_code, data.to_vec()));
                Ok(())
            }
        }
    }

    fn del(&self, key: &StoreKey) -> Result<()> {
        self.map
            .lock()
            .expect("lock poisoned")
            .remove(key)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    fn keys(&self) -> Vec<StoreKey> {
        self.map.lock().expect("lock poisoned").keys().cloned().collect()
    }

    fn size(&self) -> usize {
        self.map.lock().expect("lock poisoned").len()
    }
}

/// How the previous process instance ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Startup {
    /// No sentinel: first run, or the store directory was cleaned.
    FirstRun,
    /// The sentinel was removed on shutdown.
    CleanShutdown,
    /// The sentinel was still present: the process died uncleanly.
    Crash,
}

/// Crash/clean-shutdown marker file.
pub struct Sentinel {
    path: PathBuf,
}

impl Sentinel {
    /// Inspects and (re)creates the sentinel, reporting how the previous
    /// instance ended.
    pub fn startup(dir: &Path) -> std::io::Result<(Self, Startup)> {
        let path = dir.join(".aloft-sentinel");
        let state = if path.exists() {
            Startup::Crash
        } else if dir.join(".aloft-clean").exists() {
            std::fs::remove_file(dir.join(".aloft-clean"))?;
            Startup::CleanShutdown
        } else {
            Startup::FirstRun
        };
        std::fs::write(&path, b"")?;
        Ok((Self { path }, state))
    }

    /// Marks a clean shutdown.
    pub fn shutdown(self) -> std::io::Result<()> {
        let clean = self
            .path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(".aloft-clean");
        std::fs::write(clean, b"")?;
        std::fs::remove_file(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_store_flags() {
        let store = MemStore::new();
        let key = StoreKey::Bundle(1);

        assert!(matches!(store.get(&key), Err(StoreError::NotFound)));
        store
            .put(key.clone(), 1, b"abc", PutFlags::Create)
            .unwrap();
        assert!(matches!(
            store.put(key.clone(), 1, b"abc", PutFlags::Create),
            Err(StoreError::Exists)
        ));
        assert!(matches!(
            store.put(key.clone(), 2, b"abc", PutFlags::Replace),
            Err(StoreError::BadType)
        ));
        store
            .put(key.clone(), 1, b"def", PutFlags::Replace)
            .unwrap();
        assert_eq!(store.get(&key).unwrap(), b"def");

        assert_eq!(store.size(), 1);
        store.del(&key).unwrap();
        assert!(matches!(store.del(&key), Err(StoreError::NotFound)));
    }

    #[test]
    fn sentinel_detects_crash() {
        let dir = std::env::temp_dir().join(format!(
            "aloft-sentinel-test-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let (sentinel, state) = Sentinel::startup(&dir).unwrap();
        assert_eq!(state, Startup::FirstRun);
        sentinel.shutdown().unwrap();

        let (sentinel, state) = Sentinel::startup(&dir).unwrap();
        assert_eq!(state, Startup::CleanShutdown);
        drop(sentinel); // no shutdown call

        let (_sentinel, state) = Sentinel::startup(&dir).unwrap();
        assert_eq!(state, Startup::Crash);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
