//! Synced settings: the small global switches that live in the sync
//! scope of the state store. Reads are defensive: a failed store read
//! logs a warning and falls back to defaults instead of propagating.

use serde_json::Value;
use tracing::warn;

use crate::error::Result;
use crate::store::{JsonMap, StateStore, StoreScope};

pub const ENABLED_KEY: &str = "auts_enabled";
pub const SERVER_KEY: &str = "auts_server";
pub const VISUAL_INDICATOR_KEY: &str = "auts_visual_indicator";
pub const AUTO_UPDATE_KEY: &str = "auts_auto_update";

/// Every key in the sync scope, in one place for change-listener
/// filtering.
pub const SYNC_KEYS: [&str; 4] = [
    ENABLED_KEY,
    SERVER_KEY,
    VISUAL_INDICATOR_KEY,
    AUTO_UPDATE_KEY,
];

const DEFAULT_ENABLED: bool = true;
const DEFAULT_VISUAL_INDICATOR: bool = false;
const DEFAULT_AUTO_UPDATE: bool = true;

/// Snapshot of the synced settings with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Global kill switch: when off, nothing is registered at all.
    pub enabled: bool,
    /// Base URL of the licensed script server, when configured.
    pub server_base: Option<String>,
    /// Whether the visual indicator overlay is injected alongside
    /// registered scripts.
    pub visual_indicator: bool,
    /// Whether navigation-driven auto refresh sweeps run.
    pub auto_update: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            enabled: DEFAULT_ENABLED,
            server_base: None,
            visual_indicator: DEFAULT_VISUAL_INDICATOR,
            auto_update: DEFAULT_AUTO_UPDATE,
        }
    }
}

/// Read the full settings snapshot. Missing keys take their defaults;
/// a failed read logs and returns all defaults.
pub fn load_settings(store: &dyn StateStore) -> SyncSettings {
    let map = match store.get(StoreScope::Sync, &SYNC_KEYS) {
        Ok(map) => map,
        Err(e) => {
            warn!(error = %e, "Failed to read sync settings, using defaults");
            return SyncSettings::default();
        }
    };
    SyncSettings {
        enabled: map
            .get(ENABLED_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(DEFAULT_ENABLED),
        server_base: map
            .get(SERVER_KEY)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        visual_indicator: map
            .get(VISUAL_INDICATOR_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(DEFAULT_VISUAL_INDICATOR),
        auto_update: map
            .get(AUTO_UPDATE_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(DEFAULT_AUTO_UPDATE),
    }
}

/// Whether the global switch is on.
pub fn is_enabled(store: &dyn StateStore) -> bool {
    load_settings(store).enabled
}

/// Write the global switch.
pub fn set_enabled(store: &dyn StateStore, enabled: bool) -> Result<()> {
    let mut patch = JsonMap::new();
    patch.insert(ENABLED_KEY.to_string(), Value::Bool(enabled));
    store.set(StoreScope::Sync, patch)
}

/// Whether navigation-driven refresh sweeps may run.
pub fn is_auto_update_enabled(store: &dyn StateStore) -> bool {
    load_settings(store).auto_update
}

/// Whether the indicator overlay should be registered.
pub fn is_visual_indicator_enabled(store: &dyn StateStore) -> bool {
    load_settings(store).visual_indicator
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, SyncError};
    use crate::store::{ChangeListener, JsonMap, MemoryStateStore};

    struct FailingStore;

    impl StateStore for FailingStore {
        fn get(&self, _scope: StoreScope, _keys: &[&str]) -> Result<JsonMap> {
            Err(SyncError::Store("backend offline".to_string()))
        }
        fn set(&self, _scope: StoreScope, _patch: JsonMap) -> Result<()> {
            Err(SyncError::Store("backend offline".to_string()))
        }
        fn add_listener(&self, _listener: ChangeListener) {}
    }

    #[test]
    fn empty_store_yields_defaults() {
        let store = MemoryStateStore::new();
        let settings = load_settings(&store);
        assert!(settings.enabled);
        assert_eq!(settings.server_base, None);
        assert!(!settings.visual_indicator);
        assert!(settings.auto_update);
    }

    #[test]
    fn explicit_values_override_defaults() {
        let store = MemoryStateStore::new();
        let mut patch = JsonMap::new();
        patch.insert(ENABLED_KEY.to_string(), Value::Bool(false));
        patch.insert(
            SERVER_KEY.to_string(),
            Value::from("https://server.example"),
        );
        patch.insert(VISUAL_INDICATOR_KEY.to_string(), Value::Bool(true));
        patch.insert(AUTO_UPDATE_KEY.to_string(), Value::Bool(false));
        store.set(StoreScope::Sync, patch).unwrap();

        let settings = load_settings(&store);
        assert!(!settings.enabled);
        assert_eq!(settings.server_base.as_deref(), Some("https://server.example"));
        assert!(settings.visual_indicator);
        assert!(!settings.auto_update);
    }

    #[test]
    fn empty_server_base_reads_as_none() {
        let store = MemoryStateStore::new();
        let mut patch = JsonMap::new();
        patch.insert(SERVER_KEY.to_string(), Value::from(""));
        store.set(StoreScope::Sync, patch).unwrap();
        assert_eq!(load_settings(&store).server_base, None);
    }

    #[test]
    fn store_failure_falls_back_to_defaults() {
        let settings = load_settings(&FailingStore);
        assert_eq!(settings, SyncSettings::default());
        assert!(is_enabled(&FailingStore));
        assert!(!is_visual_indicator_enabled(&FailingStore));
    }

    #[test]
    fn set_enabled_round_trips() {
        let store = MemoryStateStore::new();
        assert!(is_enabled(&store));
        set_enabled(&store, false).unwrap();
        assert!(!is_enabled(&store));
        set_enabled(&store, true).unwrap();
        assert!(is_enabled(&store));
        assert!(set_enabled(&FailingStore, false).is_err());
    }
}
