//! Persistence of the last viewed station.
//!
//! A tiny string key-value store. The reference is saved as JSON under a
//! fixed key; loading tolerates any failure by falling back to a default.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, warn};

use crate::station::Reference;

/// Key under which the last viewed station is stored.
pub const REFERENCE_KEY: &str = "reference";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// String key-value storage.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// Stores each key as one file in a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store in the platform data directory, e.g. `~/.local/share/water-temp`.
    pub fn in_data_dir() -> Option<Self> {
        dirs::data_dir().map(|p| Self::new(p.join("water-temp")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.path(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.path(key), value)?;
        Ok(())
    }
}

/// In-memory store, for tests and `--once` runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let values = self.values.lock().unwrap_or_else(|p| p.into_inner());
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut values = self.values.lock().unwrap_or_else(|p| p.into_inner());
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Load the last viewed station, or `fallback` if none can be read.
pub fn load_reference(store: &dyn KeyValueStore, fallback: Reference) -> Reference {
    let loaded = store.get(REFERENCE_KEY).and_then(|value| {
        value
            .map(|json| serde_json::from_str::<Reference>(&json))
            .transpose()
            .map_err(StoreError::from)
    });

    match loaded {
        Ok(Some(reference)) => {
            debug!("Loaded reference {}", reference.key());
            reference
        }
        Ok(None) => fallback,
        Err(e) => {
            warn!("Failed to load last station, using default: {}", e);
            fallback
        }
    }
}

pub fn save_reference(store: &dyn KeyValueStore, reference: &Reference) -> Result<(), StoreError> {
    let json = serde_json::to_string(reference)?;
    store.set(REFERENCE_KEY, &json)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fallback() -> Reference {
        Reference::new("Strobl", "Wolfgangsee")
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("nested"));
        let reference = Reference {
            source_name: Some("Simulation".to_string()),
            temperature: Some(16.5),
            ..Reference::new("Gmunden", "Traunsee")
        };

        save_reference(&store, &reference).unwrap();

        assert_eq!(load_reference(&store, fallback()), reference);
        let raw = fs::read_to_string(dir.path().join("nested/reference.json")).unwrap();
        assert!(raw.contains("\"stationName\":\"Gmunden\""));
    }

    #[test]
    fn test_missing_value_uses_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        assert_eq!(store.get(REFERENCE_KEY).unwrap(), None);
        assert_eq!(load_reference(&store, fallback()), fallback());
    }

    #[test]
    fn test_corrupt_value_uses_fallback() {
        let store = MemoryStore::new();
        store.set(REFERENCE_KEY, "{not json").unwrap();

        assert_eq!(load_reference(&store, fallback()), fallback());
    }

    #[test]
    fn test_partial_reference_is_accepted() {
        let store = MemoryStore::new();
        store.set(REFERENCE_KEY, r#"{"stationName":"Mondsee"}"#).unwrap();

        let reference = load_reference(&store, fallback());
        assert_eq!(reference.station_name.as_deref(), Some("Mondsee"));
        assert!(reference.station_site.is_none());
    }

    #[test]
    fn test_unwritable_dir_errors() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain-file");
        fs::write(&file, "x").unwrap();
        let store = FileStore::new(&file);

        let result = save_reference(&store, &fallback());
        assert!(matches!(result, Err(StoreError::Io(_))));
    }
}
