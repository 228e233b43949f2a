use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::errors::RoomError;

/// Persistent string store supplied by the host platform.
pub trait KeyValueStorage: Send + Sync {
    fn get_string(&self, key: &str) -> Option<String>;
    fn set_string(&self, key: &str, value: &str) -> Result<(), RoomError>;
    fn delete(&self, key: &str) -> Result<(), RoomError>;
}

#[derive(Default)]
pub struct MemoryStorage {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get_string(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn set_string(&self, key: &str, value: &str) -> Result<(), RoomError> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), RoomError> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }
}

/// Key-value pairs kept in one JSON object on disk. A missing or corrupt
/// file starts out empty.
pub struct FileStorage {
    values: Mutex<BTreeMap<String, String>>,
    file_path: PathBuf,
}

impl FileStorage {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let file_path = data_dir.as_ref().join("storage.json");
        let values = Self::load(&file_path);
        Self {
            values: Mutex::new(values),
            file_path,
        }
    }

    fn load(path: &Path) -> BTreeMap<String, String> {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("ignoring unreadable storage file {}: {e}", path.display());
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        }
    }

    fn save(&self, values: &BTreeMap<String, String>) -> Result<(), RoomError> {
        if let Some(parent) = self.file_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RoomError::InvalidArgument(format!("storage dir: {e}")))?;
        }
        let json = serde_json::to_string_pretty(values)?;
        std::fs::write(&self.file_path, json)
            .map_err(|e| RoomError::InvalidArgument(format!("storage write: {e}")))
    }
}

impl KeyValueStorage for FileStorage {
    fn get_string(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn set_string(&self, key: &str, value: &str) -> Result<(), RoomError> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value.to_string());
        self.save(&values)
    }

    fn delete(&self, key: &str) -> Result<(), RoomError> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        if values.remove(key).is_some() {
            self.save(&values)?;
        }
        Ok(())
    }
}

static STORAGE: RwLock<Option<Arc<dyn KeyValueStorage>>> = RwLock::new(None);

/// Install the process-wide storage handle.
pub fn set_storage(storage: Arc<dyn KeyValueStorage>) {
    *STORAGE.write().unwrap_or_else(|e| e.into_inner()) = Some(storage);
}

pub fn storage() -> Option<Arc<dyn KeyValueStorage>> {
    STORAGE.read().unwrap_or_else(|e| e.into_inner()).clone()
}

/// Drop the process-wide storage handle on shutdown.
pub fn clear_storage() {
    STORAGE.write().unwrap_or_else(|e| e.into_inner()).take();
}
