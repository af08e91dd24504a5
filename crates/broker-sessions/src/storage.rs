//! Session persistence. Mirrors the gateway's JSON-file session store: one
//! file per broker instance, written wholesale on flush rather than
//! incrementally, with an in-memory copy as the source of truth.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use broker_domain::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};

/// Persists a keyed map of serializable records to disk. Implemented for
/// sessions and for launcher (process-adapter relaunch dedup) state; both
/// need "load everything at startup, flush everything periodically".
pub trait Storage<T>: Send + Sync {
    fn load_all(&self) -> Result<HashMap<String, T>>;
    fn save_all(&self, records: &HashMap<String, T>) -> Result<()>;
}

/// A single JSON file under the broker's state directory.
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    pub fn new(state_dir: &Path, file_name: &str) -> Result<Self> {
        std::fs::create_dir_all(state_dir).map_err(Error::Io)?;
        Ok(Self {
            path: state_dir.join(file_name),
        })
    }
}

impl<T> Storage<T> for JsonFileStorage
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn load_all(&self) -> Result<HashMap<String, T>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let raw = std::fs::read_to_string(&self.path).map_err(Error::Io)?;
        if raw.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&raw).map_err(Error::Json)
    }

    fn save_all(&self, records: &HashMap<String, T>) -> Result<()> {
        let json = serde_json::to_string_pretty(records).map_err(Error::Json)?;
        std::fs::write(&self.path, json).map_err(Error::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonFileStorage::new(dir.path(), "sessions.json").unwrap();

        let mut records: HashMap<String, String> = HashMap::new();
        records.insert("s1".into(), "hello".into());
        storage.save_all(&records).unwrap();

        let loaded: HashMap<String, String> = storage.load_all().unwrap();
        assert_eq!(loaded.get("s1").unwrap(), "hello");
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonFileStorage::new(dir.path(), "missing.json").unwrap();
        let loaded: HashMap<String, String> = storage.load_all().unwrap();
        assert!(loaded.is_empty());
    }
}
