//! Persisted settings for model storage.
//!
//! The host app owns the actual key-value store (a JSON file on desktop,
//! shared preferences on Android); this module only needs the small
//! [`SettingsStore`] surface over it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{ModelError, Result};
use crate::models::storage::StorageBackendRef;

pub const KEY_MODEL_STORAGE_URI: &str = "model_storage_uri";
pub const KEY_GRANTED_STORAGE_URIS: &str = "granted_storage_uris";

pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value);
    fn delete(&self, key: &str) -> bool;
    fn save(&self) -> Result<()>;
}

/// In-memory store, for tests and hosts that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_string(), value);
        }
    }

    fn delete(&self, key: &str) -> bool {
        self.values
            .lock()
            .map(|mut values| values.remove(key).is_some())
            .unwrap_or(false)
    }

    fn save(&self) -> Result<()> {
        Ok(())
    }
}

/// JSON object on disk, rewritten atomically on [`SettingsStore::save`].
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl JsonFileStore {
    /// Open `path`, starting empty if the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => Map::new(),
            Ok(raw) => match serde_json::from_str::<Value>(&raw)? {
                Value::Object(map) => map,
                _ => {
                    return Err(ModelError::Settings(format!(
                        "{:?} does not contain a JSON object",
                        path
                    )))
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_string(), value);
        }
    }

    fn delete(&self, key: &str) -> bool {
        self.values
            .lock()
            .map(|mut values| values.remove(key).is_some())
            .unwrap_or(false)
    }

    fn save(&self) -> Result<()> {
        let json = {
            let values = self
                .values
                .lock()
                .map_err(|_| ModelError::Settings("settings lock poisoned".to_string()))?;
            serde_json::to_vec_pretty(&*values)?
        };

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| ModelError::Settings(format!("Failed to save {:?}: {}", self.path, e)))?;
        Ok(())
    }
}

/// Typed view over the storage-related keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Absent means the default backend.
    pub model_storage_uri: Option<String>,
    /// Location tokens the user has granted access to.
    pub granted_storage_uris: Vec<String>,
}

impl StorageSettings {
    pub fn load(store: &dyn SettingsStore) -> Self {
        let model_storage_uri = store
            .get(KEY_MODEL_STORAGE_URI)
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .filter(|s| !s.trim().is_empty());
        let granted_storage_uris = store
            .get(KEY_GRANTED_STORAGE_URIS)
            .and_then(|v| v.as_array().cloned())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            model_storage_uri,
            granted_storage_uris,
        }
    }

    pub fn save(&self, store: &dyn SettingsStore) -> Result<()> {
        match &self.model_storage_uri {
            Some(uri) => store.set(KEY_MODEL_STORAGE_URI, Value::String(uri.clone())),
            None => {
                store.delete(KEY_MODEL_STORAGE_URI);
            }
        }
        store.set(
            KEY_GRANTED_STORAGE_URIS,
            Value::Array(
                self.granted_storage_uris
                    .iter()
                    .cloned()
                    .map(Value::String)
                    .collect(),
            ),
        );
        store.save()
    }

    pub fn backend(&self) -> StorageBackendRef {
        StorageBackendRef::from_token(self.model_storage_uri.clone())
    }
}
