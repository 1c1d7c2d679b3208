use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::AppError;

const CONFIG_FILENAME: &str = ".config/loungecast.json";

/// Flat persisted key/value store for durable identity: the device UUID,
/// the acquired screen id, and the last applied volume. The file is a single
/// JSON object of strings and is rewritten atomically on every mutation.
pub struct Store {
    data: Mutex<HashMap<String, String>>,
    path: PathBuf,
}

impl Store {
    /// Open the default store under the user's home directory, creating
    /// parent directories as needed.
    pub fn open_default() -> Result<Store, AppError> {
        let home = dirs::home_dir()
            .ok_or_else(|| AppError::ConfigError("could not determine home directory".into()))?;
        Store::open(home.join(CONFIG_FILENAME))
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Store, AppError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let data = match fs::read(&path) {
            Ok(buf) => serde_json::from_slice(&buf)
                .map_err(|e| AppError::ConfigError(format!("could not decode config file: {}", e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Store {
            data: Mutex::new(data),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.data.lock().unwrap().get(key).cloned()
    }

    /// Store a value and rewrite the file. Setting a key to its current
    /// value skips the disk write.
    pub fn set(&self, key: &str, value: &str) -> Result<(), AppError> {
        let snapshot = {
            let mut data = self.data.lock().unwrap();
            if data.get(key).map(String::as_str) == Some(value) {
                return Ok(());
            }
            data.insert(key.to_string(), value.to_string());
            data.clone()
        };
        self.save(&snapshot)
    }

    /// Return the stored value, or insert the provided fallback and return
    /// that. Used for identifiers generated once (uuid, screen id).
    pub fn get_or_insert(&self, key: &str, value: String) -> Result<String, AppError> {
        if let Some(existing) = self.get(key) {
            return Ok(existing);
        }
        self.set(key, &value)?;
        Ok(value)
    }

    // Replace-by-rename so a crash mid-write never truncates the config.
    fn save(&self, data: &HashMap<String, String>) -> Result<(), AppError> {
        let buf = serde_json::to_vec_pretty(data)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, buf)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
