//! Key-value state store with change notification.
//!
//! Two scopes mirror the persisted layout: a small synced-settings
//! scope and a larger local-records scope. Writes are last-writer-wins
//! whole-value replacements; listeners are notified synchronously with
//! only the keys whose values actually changed.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::error::{Result, SyncError};

/// Convenience alias for a JSON object.
pub type JsonMap = serde_json::Map<String, Value>;

/// Which half of the persisted layout a key lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreScope {
    /// Small synced settings (global switch, server base, ...).
    Sync,
    /// Local records (plugin list, subscription list).
    Local,
}

impl StoreScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreScope::Sync => "sync",
            StoreScope::Local => "local",
        }
    }
}

/// A change event delivered to store listeners.
#[derive(Debug, Clone)]
pub struct StoreChange {
    pub scope: StoreScope,
    pub changed_keys: Vec<String>,
}

/// Listener invoked synchronously after a write commits.
pub type ChangeListener = Arc<dyn Fn(&StoreChange) + Send + Sync>;

/// Abstract persistent key-value store.
pub trait StateStore: Send + Sync {
    /// Fetch the requested keys; absent keys are simply missing from
    /// the returned object (callers apply their own defaults).
    fn get(&self, scope: StoreScope, keys: &[&str]) -> Result<JsonMap>;

    /// Apply a patch of whole-value replacements. Listeners observe
    /// only keys whose stored value actually changed.
    fn set(&self, scope: StoreScope, patch: JsonMap) -> Result<()>;

    /// Subscribe to change events.
    fn add_listener(&self, listener: ChangeListener);
}

fn diff_keys(target: &JsonMap, patch: &JsonMap) -> Vec<String> {
    let mut changed = Vec::new();
    for (key, value) in patch {
        if target.get(key) != Some(value) {
            changed.push(key.clone());
        }
    }
    changed
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Volatile store used by tests and as a building block.
#[derive(Default)]
pub struct MemoryStateStore {
    sync: Mutex<JsonMap>,
    local: Mutex<JsonMap>,
    listeners: Mutex<Vec<ChangeListener>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn scope_lock(&self, scope: StoreScope) -> &Mutex<JsonMap> {
        match scope {
            StoreScope::Sync => &self.sync,
            StoreScope::Local => &self.local,
        }
    }

    fn notify(&self, change: &StoreChange) {
        // Snapshot so a listener can write back without deadlocking.
        let listeners: Vec<ChangeListener> = self.listeners.lock().clone();
        for listener in listeners {
            listener(change);
        }
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, scope: StoreScope, keys: &[&str]) -> Result<JsonMap> {
        let data = self.scope_lock(scope).lock();
        let mut out = JsonMap::new();
        for key in keys {
            if let Some(value) = data.get(*key) {
                out.insert((*key).to_string(), value.clone());
            }
        }
        Ok(out)
    }

    fn set(&self, scope: StoreScope, patch: JsonMap) -> Result<()> {
        let changed_keys = {
            let mut data = self.scope_lock(scope).lock();
            let changed = diff_keys(&data, &patch);
            for (key, value) in patch {
                data.insert(key, value);
            }
            changed
        };
        if !changed_keys.is_empty() {
            self.notify(&StoreChange {
                scope,
                changed_keys,
            });
        }
        Ok(())
    }

    fn add_listener(&self, listener: ChangeListener) {
        self.listeners.lock().push(listener);
    }
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Default)]
struct PersistedState {
    #[serde(default)]
    sync: JsonMap,
    #[serde(default)]
    local: JsonMap,
}

#[derive(Serialize)]
struct PersistedStateRef<'a> {
    sync: &'a JsonMap,
    local: &'a JsonMap,
}

struct FileStoreInner {
    sync: JsonMap,
    local: JsonMap,
    revision: u64,
}

/// Durable store backed by a single JSON file, written atomically
/// (temp file + rename) on every committed change.
pub struct FileStateStore {
    inner: Mutex<FileStoreInner>,
    path: PathBuf,
    listeners: Mutex<Vec<ChangeListener>>,
}

impl FileStateStore {
    /// Load from `path`, starting fresh when the file is missing or
    /// unreadable. A corrupt file is logged and treated as empty
    /// rather than blocking startup.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<PersistedState>(&raw) {
                Ok(state) => {
                    info!(
                        path = %path.display(),
                        sync_keys = state.sync.len(),
                        local_keys = state.local.len(),
                        "Loaded state store"
                    );
                    state
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "State file corrupt, starting fresh");
                    PersistedState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No state file found, starting fresh");
                PersistedState::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read state file, starting fresh");
                PersistedState::default()
            }
        };
        FileStateStore {
            inner: Mutex::new(FileStoreInner {
                sync: state.sync,
                local: state.local,
                revision: 0,
            }),
            path,
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[instrument(name = "state_save", skip(self, inner))]
    fn persist(&self, inner: &FileStoreInner) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_string_pretty(&PersistedStateRef {
            sync: &inner.sync,
            local: &inner.local,
        })?;
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &serialized)?;
        fs::rename(&temp_path, &self.path).map_err(|e| {
            SyncError::Store(format!(
                "failed to move {} into place: {e}",
                temp_path.display()
            ))
        })?;
        info!(
            path = %self.path.display(),
            revision = inner.revision,
            bytes = serialized.len(),
            "Saved state store (atomic)"
        );
        Ok(())
    }

    fn notify(&self, change: &StoreChange) {
        let listeners: Vec<ChangeListener> = self.listeners.lock().clone();
        for listener in listeners {
            listener(change);
        }
    }
}

impl StateStore for FileStateStore {
    fn get(&self, scope: StoreScope, keys: &[&str]) -> Result<JsonMap> {
        let inner = self.inner.lock();
        let data = match scope {
            StoreScope::Sync => &inner.sync,
            StoreScope::Local => &inner.local,
        };
        let mut out = JsonMap::new();
        for key in keys {
            if let Some(value) = data.get(*key) {
                out.insert((*key).to_string(), value.clone());
            }
        }
        Ok(out)
    }

    fn set(&self, scope: StoreScope, patch: JsonMap) -> Result<()> {
        let changed_keys = {
            let mut inner = self.inner.lock();
            let data = match scope {
                StoreScope::Sync => &mut inner.sync,
                StoreScope::Local => &mut inner.local,
            };
            let changed = diff_keys(data, &patch);
            if changed.is_empty() {
                return Ok(());
            }
            for (key, value) in patch {
                data.insert(key, value);
            }
            inner.revision += 1;
            self.persist(&inner)?;
            changed
        };
        self.notify(&StoreChange {
            scope,
            changed_keys,
        });
        Ok(())
    }

    fn add_listener(&self, listener: ChangeListener) {
        self.listeners.lock().push(listener);
    }
}
