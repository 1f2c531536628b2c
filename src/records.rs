//! Persisted record types and the derived executable-script model.
//!
//! [`PluginRecord`] and [`SubscriptionRecord`] are the JSON shapes held
//! in the local records scope of the state store. [`ExecutableScript`]
//! is derived from them on every mapping pass and never persisted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::metadata::ScriptMetadata;
use crate::store::{StateStore, StoreScope};

/// Where a plugin's code comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Inline,
    Url,
    Server,
    Local,
}

impl Default for SourceType {
    fn default() -> Self {
        SourceType::Inline
    }
}

/// Inline source payload: the code itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InlineSource {
    pub content: String,
}

/// URL source payload. Accepts both the bare-string legacy form and
/// the object form carrying a cache-validation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UrlSource {
    Href(String),
    Detailed {
        href: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        etag: Option<String>,
    },
}

impl UrlSource {
    pub fn href(&self) -> &str {
        match self {
            UrlSource::Href(href) => href,
            UrlSource::Detailed { href, .. } => href,
        }
    }

    pub fn etag(&self) -> Option<&str> {
        match self {
            UrlSource::Href(_) => None,
            UrlSource::Detailed { etag, .. } => etag.as_deref(),
        }
    }
}

/// Server source payload: which script to ask a licensed server for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSource {
    pub script_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_key: Option<String>,
}

/// Local source payload: a file set plus the entry file to execute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalSource {
    pub entry_file: String,
    pub files: BTreeMap<String, String>,
}

/// Last known-good fetched code and its provenance. Used as offline
/// fallback for url/server sources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginCache {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Migrated records may carry this as a numeric string; reads
    /// accept both forms.
    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_epoch_millis"
    )]
    pub expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_fetched_at: Option<i64>,
}

/// Epoch milliseconds from a JSON number or numeric string. A zero or
/// non-numeric string reads as absent.
pub(crate) fn coerce_epoch_millis(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.parse::<i64>().ok().filter(|n| *n != 0),
        _ => None,
    }
}

fn de_epoch_millis<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(coerce_epoch_millis))
}

/// A persisted plugin source descriptor.
///
/// Exactly one source payload should be populated according to
/// `source_type`; `matches`/`excludes` are author-specified pattern
/// overrides that get unioned with patterns parsed from the code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginRecord {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub enabled: bool,
    pub source_type: SourceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline: Option<InlineSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<UrlSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalSource>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub excludes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<PluginCache>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

impl Default for PluginRecord {
    fn default() -> Self {
        PluginRecord {
            id: String::new(),
            name: None,
            version: None,
            description: None,
            author: None,
            enabled: true,
            source_type: SourceType::Inline,
            inline: None,
            url: None,
            server: None,
            local: None,
            matches: Vec::new(),
            excludes: Vec::new(),
            cache: None,
            created_at: None,
            updated_at: None,
        }
    }
}

impl PluginRecord {
    /// Resolve the code this record would execute, per source type.
    ///
    /// url/server records read from `cache.code` only; an unfetched
    /// remote record resolves to nothing until a refresh succeeds.
    pub fn resolved_code(&self) -> Option<&str> {
        match self.source_type {
            SourceType::Inline => self.inline.as_ref().map(|i| i.content.as_str()),
            SourceType::Local => self
                .local
                .as_ref()
                .and_then(|l| l.files.get(&l.entry_file))
                .map(String::as_str),
            SourceType::Url | SourceType::Server => {
                self.cache.as_ref().and_then(|c| c.code.as_deref())
            }
        }
    }

    /// The remote location of a url-sourced record, if any.
    pub fn url_href(&self) -> Option<&str> {
        self.url.as_ref().map(UrlSource::href)
    }

    /// Cache-validation token to send on the next conditional fetch:
    /// the url payload's token, falling back to the cached one.
    pub fn refresh_etag(&self) -> Option<&str> {
        self.url
            .as_ref()
            .and_then(UrlSource::etag)
            .or_else(|| self.cache.as_ref().and_then(|c| c.etag.as_deref()))
    }
}

/// One script inside a subscription bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscriptionScript {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub code: String,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_key: Option<String>,
}

impl Default for SubscriptionScript {
    fn default() -> Self {
        SubscriptionScript {
            id: String::new(),
            version: None,
            code: String::new(),
            enabled: true,
            license_key: None,
        }
    }
}

/// A licensed script bundle fetched from one server.
///
/// Disabling a subscription clears `scripts` entirely; enabling
/// re-fetches the bundle from the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscriptionRecord {
    pub id: String,
    pub name: String,
    /// Scheme + host of the serving endpoint.
    pub server_base: String,
    pub license_key: String,
    pub enabled: bool,
    pub scripts: Vec<SubscriptionScript>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<i64>,
}

impl Default for SubscriptionRecord {
    fn default() -> Self {
        SubscriptionRecord {
            id: String::new(),
            name: String::new(),
            server_base: String::new(),
            license_key: String::new(),
            enabled: true,
            scripts: Vec::new(),
            last_updated: None,
        }
    }
}

/// Where a derived script came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ScriptOrigin {
    #[serde(rename_all = "camelCase")]
    Plugin { plugin_id: String },
    #[serde(rename_all = "camelCase")]
    Subscription {
        subscription_id: String,
        server_script_id: String,
    },
}

/// The normalized unit the registration coordinator consumes. Derived
/// from records on every pass, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutableScript {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub source_type: SourceType,
    pub code: String,
    pub metadata: ScriptMetadata,
    pub origin: ScriptOrigin,
}

// ---------------------------------------------------------------------------
// Record list persistence
// ---------------------------------------------------------------------------

/// Local-scope key holding the plugin record list.
pub const SCRIPTS_KEY: &str = "auts_scripts";
/// Local-scope key holding the subscription record list.
pub const SUBSCRIPTIONS_KEY: &str = "auts_subscriptions";

fn load_list<T: serde::de::DeserializeOwned>(store: &dyn StateStore, key: &str) -> Vec<T> {
    let map = match store.get(StoreScope::Local, &[key]) {
        Ok(map) => map,
        Err(e) => {
            warn!(key, error = %e, "Failed to read record list, treating as empty");
            return Vec::new();
        }
    };
    let Some(value) = map.get(key) else {
        return Vec::new();
    };
    match serde_json::from_value(value.clone()) {
        Ok(list) => list,
        Err(e) => {
            warn!(key, error = %e, "Malformed record list, treating as empty");
            Vec::new()
        }
    }
}

fn save_list<T: Serialize>(store: &dyn StateStore, key: &str, list: &[T]) -> Result<()> {
    let mut patch = crate::store::JsonMap::new();
    patch.insert(key.to_string(), serde_json::to_value(list)?);
    store.set(StoreScope::Local, patch)
}

/// Load all plugin records; any read or shape failure yields an empty
/// list rather than an error.
pub fn load_plugins(store: &dyn StateStore) -> Vec<PluginRecord> {
    load_list(store, SCRIPTS_KEY)
}

/// Persist the whole plugin record list (last-writer-wins).
pub fn save_plugins(store: &dyn StateStore, plugins: &[PluginRecord]) -> Result<()> {
    save_list(store, SCRIPTS_KEY, plugins)
}

/// Replace the record with a matching id, or append when absent, then
/// persist.
pub fn upsert_plugin(store: &dyn StateStore, updated: PluginRecord) -> Result<()> {
    let mut plugins = load_plugins(store);
    match plugins.iter_mut().find(|p| p.id == updated.id) {
        Some(slot) => *slot = updated,
        None => plugins.push(updated),
    }
    save_plugins(store, &plugins)
}

/// Load all subscription records; failures yield an empty list.
pub fn load_subscriptions(store: &dyn StateStore) -> Vec<SubscriptionRecord> {
    load_list(store, SUBSCRIPTIONS_KEY)
}

/// Persist the whole subscription record list.
pub fn save_subscriptions(store: &dyn StateStore, subs: &[SubscriptionRecord]) -> Result<()> {
    save_list(store, SUBSCRIPTIONS_KEY, subs)
}

/// Current time as epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn random_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..9].to_string()
}

/// Fresh opaque plugin record id.
pub fn generate_plugin_id() -> String {
    format!("script_{}_{}", now_millis(), random_suffix())
}

/// Fresh opaque subscription record id.
pub fn generate_subscription_id() -> String {
    format!("subscription_{}_{}", now_millis(), random_suffix())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_record_wire_names_are_camel_case() {
        let record = PluginRecord {
            id: "script_1".to_string(),
            source_type: SourceType::Url,
            url: Some(UrlSource::Detailed {
                href: "https://example.com/a.user.js".to_string(),
                etag: Some("\"v1\"".to_string()),
            }),
            cache: Some(PluginCache {
                code: Some("x".to_string()),
                last_fetched_at: Some(1_700_000_000_000),
                ..Default::default()
            }),
            ..Default::default()
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["sourceType"], "url");
        assert_eq!(json["url"]["href"], "https://example.com/a.user.js");
        assert_eq!(json["cache"]["lastFetchedAt"], 1_700_000_000_000_i64);
        // enabled is always serialized, even when default
        assert_eq!(json["enabled"], true);
    }

    #[test]
    fn url_source_accepts_bare_string() {
        let record: PluginRecord = serde_json::from_value(serde_json::json!({
            "id": "script_2",
            "sourceType": "url",
            "url": "https://example.com/b.user.js"
        }))
        .unwrap();
        assert_eq!(record.url_href(), Some("https://example.com/b.user.js"));
        assert_eq!(record.refresh_etag(), None);
    }

    #[test]
    fn refresh_etag_prefers_url_payload_over_cache() {
        let mut record = PluginRecord {
            id: "script_3".to_string(),
            source_type: SourceType::Url,
            url: Some(UrlSource::Detailed {
                href: "https://example.com/c.user.js".to_string(),
                etag: Some("\"from-url\"".to_string()),
            }),
            cache: Some(PluginCache {
                etag: Some("\"from-cache\"".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(record.refresh_etag(), Some("\"from-url\""));

        record.url = Some(UrlSource::Href(
            "https://example.com/c.user.js".to_string(),
        ));
        assert_eq!(record.refresh_etag(), Some("\"from-cache\""));
    }

    #[test]
    fn missing_enabled_defaults_to_true() {
        let record: PluginRecord = serde_json::from_value(serde_json::json!({
            "id": "script_4",
            "sourceType": "inline",
            "inline": {"content": "code"}
        }))
        .unwrap();
        assert!(record.enabled);
    }

    #[test]
    fn resolved_code_per_source_type() {
        let inline = PluginRecord {
            id: "a".to_string(),
            source_type: SourceType::Inline,
            inline: Some(InlineSource {
                content: "inline-code".to_string(),
            }),
            ..Default::default()
        };
        assert_eq!(inline.resolved_code(), Some("inline-code"));

        let mut files = BTreeMap::new();
        files.insert("main.js".to_string(), "local-code".to_string());
        files.insert("lib.js".to_string(), "lib".to_string());
        let local = PluginRecord {
            id: "b".to_string(),
            source_type: SourceType::Local,
            local: Some(LocalSource {
                entry_file: "main.js".to_string(),
                files,
            }),
            ..Default::default()
        };
        assert_eq!(local.resolved_code(), Some("local-code"));

        let url_no_cache = PluginRecord {
            id: "c".to_string(),
            source_type: SourceType::Url,
            url: Some(UrlSource::Href("https://example.com/x".to_string())),
            ..Default::default()
        };
        assert_eq!(url_no_cache.resolved_code(), None);

        let server_cached = PluginRecord {
            id: "d".to_string(),
            source_type: SourceType::Server,
            cache: Some(PluginCache {
                code: Some("fetched".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(server_cached.resolved_code(), Some("fetched"));
    }

    #[test]
    fn origin_serializes_with_type_tag() {
        let plugin = ScriptOrigin::Plugin {
            plugin_id: "script_9".to_string(),
        };
        let json = serde_json::to_value(&plugin).unwrap();
        assert_eq!(json["type"], "plugin");
        assert_eq!(json["pluginId"], "script_9");

        let sub = ScriptOrigin::Subscription {
            subscription_id: "subscription_1".to_string(),
            server_script_id: "remote-42".to_string(),
        };
        let json = serde_json::to_value(&sub).unwrap();
        assert_eq!(json["type"], "subscription");
        assert_eq!(json["subscriptionId"], "subscription_1");
        assert_eq!(json["serverScriptId"], "remote-42");
    }

    #[test]
    fn generated_ids_carry_prefix_and_suffix() {
        let id = generate_plugin_id();
        assert!(id.starts_with("script_"));
        let parts: Vec<&str> = id.splitn(3, '_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].len(), 9);

        let sub_id = generate_subscription_id();
        assert!(sub_id.starts_with("subscription_"));
    }

    #[test]
    fn subscription_defaults_enable_and_empty_scripts() {
        let record: SubscriptionRecord = serde_json::from_value(serde_json::json!({
            "id": "subscription_1",
            "name": "Bundle",
            "serverBase": "https://server.example",
            "licenseKey": "KEY"
        }))
        .unwrap();
        assert!(record.enabled);
        assert!(record.scripts.is_empty());
    }

    #[test]
    fn plugin_list_round_trips_through_store() {
        let store = crate::store::MemoryStateStore::new();
        let record = PluginRecord {
            id: "script_1".to_string(),
            inline: Some(InlineSource {
                content: "code".to_string(),
            }),
            ..Default::default()
        };
        save_plugins(&store, &[record.clone()]).unwrap();
        let loaded = load_plugins(&store);
        assert_eq!(loaded, vec![record]);
    }

    #[test]
    fn malformed_plugin_list_reads_as_empty() {
        let store = crate::store::MemoryStateStore::new();
        let mut patch = crate::store::JsonMap::new();
        patch.insert(
            SCRIPTS_KEY.to_string(),
            serde_json::Value::from("not a list"),
        );
        store.set(StoreScope::Local, patch).unwrap();
        assert!(load_plugins(&store).is_empty());
    }

    #[test]
    fn string_expires_at_loads_the_whole_list() {
        let store = crate::store::MemoryStateStore::new();
        let mut patch = crate::store::JsonMap::new();
        patch.insert(
            SCRIPTS_KEY.to_string(),
            serde_json::json!([
                {"id": "script_1", "sourceType": "inline", "inline": {"content": "a"}},
                {"id": "script_2", "sourceType": "server",
                 "cache": {"code": "b", "expiresAt": "1700000000000"}}
            ]),
        );
        store.set(StoreScope::Local, patch).unwrap();

        let loaded = load_plugins(&store);
        assert_eq!(loaded.len(), 2);
        assert_eq!(
            loaded[1].cache.as_ref().unwrap().expires_at,
            Some(1_700_000_000_000)
        );
    }

    #[test]
    fn expires_at_coercion_forms() {
        let cache: PluginCache =
            serde_json::from_value(serde_json::json!({"expiresAt": 42})).unwrap();
        assert_eq!(cache.expires_at, Some(42));

        let cache: PluginCache =
            serde_json::from_value(serde_json::json!({"expiresAt": "0"})).unwrap();
        assert_eq!(cache.expires_at, None);

        let cache: PluginCache =
            serde_json::from_value(serde_json::json!({"expiresAt": "soon"})).unwrap();
        assert_eq!(cache.expires_at, None);

        let cache: PluginCache =
            serde_json::from_value(serde_json::json!({"expiresAt": null})).unwrap();
        assert_eq!(cache.expires_at, None);
    }

    #[test]
    fn upsert_replaces_matching_id_and_appends_new() {
        let store = crate::store::MemoryStateStore::new();
        let first = PluginRecord {
            id: "script_1".to_string(),
            name: Some("old".to_string()),
            ..Default::default()
        };
        save_plugins(&store, &[first]).unwrap();

        let replacement = PluginRecord {
            id: "script_1".to_string(),
            name: Some("new".to_string()),
            ..Default::default()
        };
        upsert_plugin(&store, replacement).unwrap();

        let fresh = PluginRecord {
            id: "script_2".to_string(),
            ..Default::default()
        };
        upsert_plugin(&store, fresh).unwrap();

        let loaded = load_plugins(&store);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].name.as_deref(), Some("new"));
        assert_eq!(loaded[1].id, "script_2");
    }
}
