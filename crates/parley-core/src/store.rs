//! Snapshot persistence: key-value backends and the session store on top of them

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::Result;
use crate::protocol::keys;
use crate::types::{Credentials, SessionState};

/// String-keyed local storage. `set_many` must be all-or-nothing as seen by
/// later reads.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set_many(&self, entries: &[(&str, String)]) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-process store. Contents vanish with the process, like a browser tab's
/// session storage.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn set_many(&self, entries: &[(&str, String)]) -> Result<()> {
        let mut map = lock(&self.entries);
        for (key, value) in entries {
            map.insert((*key).to_string(), value.clone());
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        lock(&self.entries).clear();
        Ok(())
    }
}

/// A single JSON object on disk. Every write goes through a temp file in the
/// same directory, fsync, then rename over the target.
pub struct FileKeyValueStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileKeyValueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn write_all(&self, map: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string_pretty(map)?;
        let tmp_path = self.path.with_extension("json.tmp");
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(json.as_bytes())?;
        tmp.sync_all()?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path)?;
        debug!("Wrote {} keys to {:?}", map.len(), self.path);
        Ok(())
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_all()?.remove(key))
    }

    fn set_many(&self, entries: &[(&str, String)]) -> Result<()> {
        let _guard = lock(&self.write_lock);
        let mut map = self.read_all()?;
        for (key, value) in entries {
            map.insert((*key).to_string(), value.clone());
        }
        self.write_all(&map)
    }

    fn clear(&self) -> Result<()> {
        let _guard = lock(&self.write_lock);
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// Reads and writes the session snapshot and the credentials. Performs no
/// validation beyond structural defaults.
#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn KeyValueStore>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKeyValueStore::new()))
    }

    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FileKeyValueStore::new(path)))
    }

    fn read_key<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        match self.backend.get(key) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("Discarding unreadable snapshot key '{}': {}", key, e);
                T::default()
            }),
            Ok(None) => T::default(),
            Err(e) => {
                warn!("Failed to read snapshot key '{}': {}", key, e);
                T::default()
            }
        }
    }

    /// Best-effort snapshot; anything missing or unreadable comes back empty.
    pub fn load(&self) -> SessionState {
        SessionState {
            identity: self.read_key(keys::IDENTITY),
            peers: self.read_key(keys::PEERS),
            messages_by_peer: self.read_key(keys::MESSAGES),
            selected_peer: self.read_key(keys::SELECTED),
        }
    }

    /// Write the whole snapshot in one batch.
    pub fn save(&self, state: &SessionState) -> Result<()> {
        let entries = [
            (keys::IDENTITY, to_json(&state.identity)?),
            (keys::PEERS, to_json(&state.peers)?),
            (keys::MESSAGES, to_json(&state.messages_by_peer)?),
            (keys::SELECTED, to_json(&state.selected_peer)?),
        ];
        self.backend.set_many(&entries)
    }

    fn read_token(&self, key: &str) -> Option<String> {
        self.backend.get(key).unwrap_or_else(|e| {
            warn!("Failed to read credential '{}': {}", key, e);
            None
        })
    }

    /// Both tokens, or `None` when either is missing or unreadable.
    pub fn credentials(&self) -> Option<Credentials> {
        let access = self.read_token(keys::ACCESS_TOKEN);
        let refresh = self.read_token(keys::REFRESH_TOKEN);
        match (access, refresh) {
            (Some(access_token), Some(refresh_token)) => Some(Credentials {
                access_token,
                refresh_token,
            }),
            _ => None,
        }
    }

    pub fn store_credentials(&self, credentials: &Credentials) -> Result<()> {
        self.backend.set_many(&[
            (keys::ACCESS_TOKEN, credentials.access_token.clone()),
            (keys::REFRESH_TOKEN, credentials.refresh_token.clone()),
        ])
    }

    /// Drop the snapshot and the credentials.
    pub fn clear(&self) -> Result<()> {
        self.backend.clear()
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}
