//! Pin storage tiers.
//!
//! - `FilePinStore`    — durable JSON file in the user data directory
//! - `SessionPinStore` — process-lifetime map, shared by every client in
//!   the process (the "session-scoped" tier)

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{error::StoreError, paths};

pub trait PinStore: Send + Sync {
    /// Short name used in logs.
    fn tier(&self) -> &'static str;
    fn load(&self, namespace: &str) -> Result<Option<String>, StoreError>;
    fn save(&self, namespace: &str, key_b64: &str) -> Result<(), StoreError>;
    fn remove(&self, namespace: &str) -> Result<(), StoreError>;
}

// ── Durable tier ──────────────────────────────────────────────────────────────

const PIN_FILE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinRecord {
    pub key: String,
    pub pinned_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PinFile {
    version: u32,
    #[serde(default)]
    pins: BTreeMap<String, PinRecord>,
}

impl Default for PinFile {
    fn default() -> Self {
        Self {
            version: PIN_FILE_VERSION,
            pins: BTreeMap::new(),
        }
    }
}

pub struct FilePinStore {
    path: PathBuf,
    // Serialises read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl FilePinStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Store under the platform data directory.
    pub fn open_default() -> Result<Self, StoreError> {
        Ok(Self::new(paths::default_pin_file()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Full record, including when the key was pinned.
    pub fn record(&self, namespace: &str) -> Result<Option<PinRecord>, StoreError> {
        let _guard = self.lock.lock();
        Ok(self.read()?.pins.get(namespace).cloned())
    }

    fn read(&self) -> Result<PinFile, StoreError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(PinFile::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, file: &PinFile) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(file)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl PinStore for FilePinStore {
    fn tier(&self) -> &'static str {
        "durable"
    }

    fn load(&self, namespace: &str) -> Result<Option<String>, StoreError> {
        Ok(self.record(namespace)?.map(|r| r.key))
    }

    fn save(&self, namespace: &str, key_b64: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut file = self.read()?;
        file.pins.insert(
            namespace.to_string(),
            PinRecord {
                key: key_b64.to_string(),
                pinned_at: Utc::now(),
            },
        );
        self.write(&file)
    }

    fn remove(&self, namespace: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut file = self.read()?;
        if file.pins.remove(namespace).is_some() {
            self.write(&file)?;
        }
        Ok(())
    }
}

// ── Session tier ──────────────────────────────────────────────────────────────

/// In-memory pins. Clones share the same map.
#[derive(Clone, Default)]
pub struct SessionPinStore {
    pins: Arc<Mutex<HashMap<String, String>>>,
}

static PROCESS_PINS: OnceLock<SessionPinStore> = OnceLock::new();

impl SessionPinStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide instance.
    pub fn process() -> Self {
        PROCESS_PINS.get_or_init(SessionPinStore::new).clone()
    }
}

impl PinStore for SessionPinStore {
    fn tier(&self) -> &'static str {
        "session"
    }

    fn load(&self, namespace: &str) -> Result<Option<String>, StoreError> {
        Ok(self.pins.lock().get(namespace).cloned())
    }

    fn save(&self, namespace: &str, key_b64: &str) -> Result<(), StoreError> {
        self.pins.lock().insert(namespace.to_string(), key_b64.to_string());
        Ok(())
    }

    fn remove(&self, namespace: &str) -> Result<(), StoreError> {
        self.pins.lock().remove(namespace);
        Ok(())
    }
}
