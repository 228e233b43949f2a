use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::RoomError;
use crate::storage::KeyValueStorage;

/// Storage key holding the serialized [`EngineConfig`].
pub const CONFIG_KEY: &str = "engine_config";

/// Timeouts and retry policy for rooms.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EngineConfig {
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_negotiation_timeout_ms")]
    pub negotiation_timeout_ms: u64,
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
    #[serde(default = "default_viewport_debounce_ms")]
    pub viewport_debounce_ms: u64,
    #[serde(default = "default_reconnect_grace_ms")]
    pub reconnect_grace_ms: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    /// `tracing_subscriber::EnvFilter` directive used by `init_logging`.
    #[serde(default)]
    pub log_filter: Option<String>,
}

fn default_handshake_timeout_ms() -> u64 {
    5_000
}

fn default_negotiation_timeout_ms() -> u64 {
    3_000
}

fn default_http_timeout_ms() -> u64 {
    10_000
}

fn default_viewport_debounce_ms() -> u64 {
    250
}

fn default_reconnect_grace_ms() -> u64 {
    10_000
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_base_delay_ms() -> u64 {
    500
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout_ms(),
            negotiation_timeout_ms: default_negotiation_timeout_ms(),
            http_timeout_ms: default_http_timeout_ms(),
            viewport_debounce_ms: default_viewport_debounce_ms(),
            reconnect_grace_ms: default_reconnect_grace_ms(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            log_filter: None,
        }
    }
}

impl EngineConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn viewport_debounce(&self) -> Duration {
        Duration::from_millis(self.viewport_debounce_ms)
    }

    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_millis(self.reconnect_grace_ms)
    }

    /// Backoff before reconnect `attempt` (1-based), without jitter.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(10);
        Duration::from_millis(self.reconnect_base_delay_ms.saturating_mul(factor))
    }

    /// Read from storage, falling back to defaults when absent or unreadable.
    pub fn from_storage(storage: &dyn KeyValueStorage) -> Self {
        storage
            .get_string(CONFIG_KEY)
            .and_then(|json| {
                serde_json::from_str(&json)
                    .map_err(|e| tracing::warn!("ignoring stored engine config: {e}"))
                    .ok()
            })
            .unwrap_or_default()
    }

    pub fn save_to_storage(&self, storage: &dyn KeyValueStorage) -> Result<(), RoomError> {
        storage.set_string(CONFIG_KEY, &serde_json::to_string(self)?)
    }
}

/// [`EngineConfig`] persisted as `config.json` under a data directory.
pub struct ConfigStore {
    config: Mutex<EngineConfig>,
    file_path: PathBuf,
}

impl ConfigStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let file_path = data_dir.as_ref().join("config.json");
        let config = Self::load(&file_path);
        Self {
            config: Mutex::new(config),
            file_path,
        }
    }

    pub fn get(&self) -> EngineConfig {
        self.config.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut EngineConfig)) {
        f(&mut self.config.lock().unwrap_or_else(|e| e.into_inner()));
        self.save();
    }

    fn save(&self) {
        let config = self.get();
        if let Some(parent) = self.file_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&config) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.file_path, json) {
                    tracing::warn!("failed to write {}: {e}", self.file_path.display());
                }
            }
            Err(e) => tracing::warn!("failed to encode engine config: {e}"),
        }
    }

    fn load(path: &Path) -> EngineConfig {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => EngineConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::fs;

    fn temp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn test_new_creates_defaults_when_no_file() {
        let dir = temp_dir();
        let store = ConfigStore::new(dir.path());
        assert_eq!(store.get(), EngineConfig::default());
        assert_eq!(store.get().negotiation_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_update_persists() {
        let dir = temp_dir();
        {
            let store = ConfigStore::new(dir.path());
            store.update(|c| {
                c.viewport_debounce_ms = 0;
                c.log_filter = Some("huddle_core=trace".to_string());
            });
        }
        let store = ConfigStore::new(dir.path());
        let c = store.get();
        assert_eq!(c.viewport_debounce(), Duration::ZERO);
        assert_eq!(c.log_filter.as_deref(), Some("huddle_core=trace"));
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let dir = temp_dir();
        fs::write(dir.path().join("config.json"), "not json!!!").unwrap();
        let store = ConfigStore::new(dir.path());
        assert_eq!(store.get(), EngineConfig::default());
    }

    #[test]
    fn test_partial_json_uses_serde_defaults() {
        let dir = temp_dir();
        fs::write(
            dir.path().join("config.json"),
            r#"{"handshake_timeout_ms":100}"#,
        )
        .unwrap();
        let c = ConfigStore::new(dir.path()).get();
        assert_eq!(c.handshake_timeout(), Duration::from_millis(100));
        assert_eq!(c.reconnect_attempts, 5);
        assert_eq!(c.log_filter, None);
    }

    #[test]
    fn test_storage_round_trip() {
        let storage = MemoryStorage::new();
        assert_eq!(EngineConfig::from_storage(&storage), EngineConfig::default());
        let custom = EngineConfig {
            reconnect_attempts: 1,
            ..EngineConfig::default()
        };
        custom.save_to_storage(&storage).unwrap();
        assert_eq!(EngineConfig::from_storage(&storage), custom);
    }

    #[test]
    fn test_reconnect_delay_doubles() {
        let c = EngineConfig::default();
        assert_eq!(c.reconnect_delay(1), Duration::from_millis(500));
        assert_eq!(c.reconnect_delay(2), Duration::from_millis(1000));
        assert_eq!(c.reconnect_delay(4), Duration::from_millis(4000));
    }
}
