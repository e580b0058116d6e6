/// Capabilities the host runtime lends to the skill.
///
/// Only the key-value `state` capability is used here: the setup wizard
/// stores the confirmed phone number and the completion flag in it.
use anyhow::Result;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Keys written by the setup wizard.
pub const KEY_PHONE_NUMBER: &str = "phoneNumber";
pub const KEY_SETUP_COMPLETE: &str = "setupComplete";

pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;
    fn set(&self, key: &str, value: Value) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// Volatile store, for tests and hosts without persistence.
#[derive(Default)]
pub struct MemoryStateStore {
    values: Mutex<Map<String, Value>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.values.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.values.lock().remove(key);
        Ok(())
    }
}

/// Store backed by a single JSON object on disk. Every write rewrites
/// the file through a temporary sibling.
pub struct JsonFileStateStore {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl JsonFileStateStore {
    pub fn open(path: &Path) -> Result<Self> {
        let values = if path.exists() {
            let content = fs::read_to_string(path)?;
            if content.trim().is_empty() {
                Map::new()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            Map::new()
        };
        info!("State store opened at {} ({} keys)", path.display(), values.len());
        Ok(Self {
            path: path.to_path_buf(),
            values: Mutex::new(values),
        })
    }

    fn flush(&self, values: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(values)?)?;
        fs::rename(&tmp, &self.path)?;
        debug!("State store saved ({} keys)", values.len());
        Ok(())
    }
}

impl StateStore for JsonFileStateStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut values = self.values.lock();
        values.insert(key.to_string(), value);
        self.flush(&values)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut values = self.values.lock();
        if values.remove(key).is_some() {
            self.flush(&values)?;
        }
        Ok(())
    }
}
