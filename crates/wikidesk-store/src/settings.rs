use crate::StoreError;
use fs2::FileExt;
use serde_json::{Map, Value};
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Key-value settings collaborator the store persists through.
///
/// `set_setting` only has to make the value visible to later reads; durability is
/// reached on `flush`.
pub trait SettingsBackend: Send + Sync {
    fn get_setting(&self, key: &str) -> Result<Option<Value>, StoreError>;
    fn set_setting(&self, key: &str, value: Value) -> Result<(), StoreError>;
    fn flush(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct SettingsState {
    values: Map<String, Value>,
    dirty: bool,
}

/// Settings persisted as one pretty-printed JSON object.
///
/// Writes are deferred until `flush`, either called directly for immediate writes
/// or by the background task from `spawn_deferred_flush`.
#[derive(Debug)]
pub struct JsonSettingsFile {
    path: PathBuf,
    state: Mutex<SettingsState>,
}

impl JsonSettingsFile {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let values = match fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => Map::new(),
            Ok(raw) => match serde_json::from_str::<Value>(&raw)? {
                Value::Object(map) => map,
                other => {
                    warn!(
                        event = "settings_file_not_object",
                        path = %path.display(),
                        kind = %json_kind(&other)
                    );
                    Map::new()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => Map::new(),
            Err(err) => return Err(StoreError::io(&path, err)),
        };
        debug!(
            event = "settings_file_open",
            path = %path.display(),
            keys = values.len()
        );
        Ok(Self {
            path,
            state: Mutex::new(SettingsState {
                values,
                dirty: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().map(|state| state.dirty).unwrap_or(false)
    }

    /// Periodically writes pending changes, and once more when shutdown fires.
    pub fn spawn_deferred_flush(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = self.flush() {
                            warn!(event = "settings_deferred_flush_failed", error = %err);
                        }
                    }
                }
            }
            if let Err(err) = self.flush() {
                warn!(event = "settings_final_flush_failed", error = %err);
            }
        })
    }

    fn write_atomic(&self, values: &Map<String, Value>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| StoreError::io(parent, err))?;
            }
        }
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "settings.json".to_string());
        let lock_path = self.path.with_file_name(format!("{file_name}.lock"));
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|err| StoreError::io(&lock_path, err))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked {
                path: self.path.clone(),
            });
        }

        let payload = serde_json::to_string_pretty(values)?;
        let temp_path = self.path.with_file_name(format!("{file_name}.tmp"));
        let written = fs::write(&temp_path, payload)
            .map_err(|err| StoreError::io(&temp_path, err))
            .and_then(|_| {
                fs::rename(&temp_path, &self.path).map_err(|err| StoreError::io(&self.path, err))
            });
        let _ = lock_file.unlock();
        written
    }
}

impl SettingsBackend for JsonSettingsFile {
    fn get_setting(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let state = self.state.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(state.values.get(key).cloned())
    }

    fn set_setting(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut state = self.state.lock().map_err(|_| StoreError::Poisoned)?;
        state.values.insert(key.to_string(), value);
        state.dirty = true;
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().map_err(|_| StoreError::Poisoned)?;
        if !state.dirty {
            return Ok(());
        }
        self.write_atomic(&state.values)?;
        state.dirty = false;
        debug!(event = "settings_flushed", path = %self.path.display());
        Ok(())
    }
}

/// Settings that live only as long as the process.
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: Mutex<Map<String, Value>>,
    flushes: Mutex<usize>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(key: &str, value: Value) -> Self {
        let settings = Self::default();
        if let Ok(mut values) = settings.values.lock() {
            values.insert(key.to_string(), value);
        }
        settings
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.lock().map(|count| *count).unwrap_or(0)
    }
}

impl SettingsBackend for MemorySettings {
    fn get_setting(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(values.get(key).cloned())
    }

    fn set_setting(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
        values.insert(key.to_string(), value);
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        let mut flushes = self.flushes.lock().map_err(|_| StoreError::Poisoned)?;
        *flushes += 1;
        Ok(())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deferred_writes_reach_disk_on_flush() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("settings.json");
        let settings = JsonSettingsFile::open(&path).expect("open");
        settings
            .set_setting("workspaces", json!({"a": {"id": "a"}}))
            .expect("set");
        assert!(settings.is_dirty());
        assert!(!path.exists());

        settings.flush().expect("flush");
        assert!(!settings.is_dirty());
        let reopened = JsonSettingsFile::open(&path).expect("reopen");
        assert_eq!(
            reopened.get_setting("workspaces").expect("get"),
            Some(json!({"a": {"id": "a"}}))
        );
        assert!(!dir.path().join("nested").join("settings.json.tmp").exists());
    }

    #[test]
    fn non_object_file_loads_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        fs::write(&path, "[1, 2]").expect("write");
        let settings = JsonSettingsFile::open(&path).expect("open");
        assert_eq!(settings.get_setting("workspaces").expect("get"), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn deferred_flush_task_writes_on_shutdown() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        let settings = Arc::new(JsonSettingsFile::open(&path).expect("open"));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = settings
            .clone()
            .spawn_deferred_flush(Duration::from_secs(3600), shutdown_rx);
        settings.set_setting("language", json!("zh-Hans")).expect("set");
        let _ = shutdown_tx.send(true);
        handle.await.expect("join");
        let raw = fs::read_to_string(&path).expect("read");
        assert!(raw.contains("zh-Hans"));
    }
}
