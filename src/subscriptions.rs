//! Subscription lifecycle: licensed script bundles served by a remote
//! endpoint.
//!
//! A subscription is added from a full URL (`{base}/subscription?license=KEY`);
//! later fetches are rebuilt from the stored server base and license
//! key. Disabling a subscription drops its scripts entirely, and
//! enabling re-fetches them, so a disabled subscription can never leak
//! stale registrations.

use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Result, ResultExt, SyncError};
use crate::http::{FetchOptions, HttpFetcher};
use crate::records::{
    generate_subscription_id, load_subscriptions, now_millis, save_subscriptions,
    SubscriptionRecord, SubscriptionScript,
};
use crate::store::StateStore;

/// License block of a subscription response. Only `note` participates
/// in behavior (default naming); the rest is tolerated for shape.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WireLicense {
    pub key: Option<String>,
    pub status: Option<String>,
    pub expires_at: Option<serde_json::Value>,
    pub note: Option<String>,
}

/// One script entry as the server sends it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WireScript {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Version")]
    pub version: Option<String>,
    #[serde(rename = "Code")]
    pub code: String,
    #[serde(rename = "Removed")]
    pub removed: bool,
    #[serde(rename = "LicenseKey")]
    pub license_key: Option<String>,
}

/// Subscription endpoint response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SubscriptionResponse {
    pub license: WireLicense,
    pub scripts: Vec<WireScript>,
}

fn subscription_endpoint(server_base: &str, license_key: &str) -> Result<String> {
    let mut url = Url::parse(server_base)
        .map_err(|e| SyncError::Transport(format!("invalid server base {server_base}: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| SyncError::Transport(format!("invalid server base {server_base}")))?
        .pop_if_empty()
        .push("subscription");
    url.query_pairs_mut().append_pair("license", license_key);
    Ok(url.into())
}

fn fetch_bundle(fetcher: &dyn HttpFetcher, url: &str) -> Result<SubscriptionResponse> {
    let response = fetcher.fetch(url, &FetchOptions::default())?;
    if !response.is_success() {
        return Err(SyncError::Http {
            status: response.status,
            url: url.to_string(),
        });
    }
    response.json()
}

/// Convert wire scripts to stored scripts, dropping removed entries
/// and preserving the enabled flag of scripts already present.
fn map_wire_scripts(wire: &[WireScript], existing: &[SubscriptionScript]) -> Vec<SubscriptionScript> {
    wire.iter()
        .filter(|script| !script.removed)
        .map(|script| SubscriptionScript {
            id: script.id.clone(),
            version: script.version.clone(),
            code: script.code.clone(),
            enabled: existing
                .iter()
                .find(|e| e.id == script.id)
                .map(|e| e.enabled)
                .unwrap_or(true),
            license_key: script.license_key.clone(),
        })
        .collect()
}

/// Fetch a bundle from its full URL and persist it as a new enabled
/// subscription. Server base and license key are derived from the URL.
pub fn add_subscription(
    store: &dyn StateStore,
    fetcher: &dyn HttpFetcher,
    subscription_url: &str,
    name: Option<&str>,
) -> Result<SubscriptionRecord> {
    let parsed = Url::parse(subscription_url).map_err(|e| {
        SyncError::Transport(format!("invalid subscription URL {subscription_url}: {e}"))
    })?;
    if !parsed.has_host() {
        return Err(SyncError::Transport(format!(
            "subscription URL has no host: {subscription_url}"
        )));
    }
    let server_base = parsed.origin().ascii_serialization();
    let license_key = parsed
        .query_pairs()
        .find(|(key, _)| key == "license")
        .map(|(_, value)| value.into_owned())
        .unwrap_or_default();

    let bundle = fetch_bundle(fetcher, subscription_url)?;
    let scripts = map_wire_scripts(&bundle.scripts, &[]);

    let record = SubscriptionRecord {
        id: generate_subscription_id(),
        name: name
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .or_else(|| bundle.license.note.clone().filter(|n| !n.is_empty()))
            .unwrap_or_else(|| format!("Subscription {license_key}")),
        server_base,
        license_key,
        enabled: true,
        scripts,
        last_updated: Some(now_millis()),
    };

    let mut subs = load_subscriptions(store);
    subs.push(record.clone());
    save_subscriptions(store, &subs)?;
    info!(
        subscription_id = %record.id,
        scripts = record.scripts.len(),
        "Added subscription"
    );
    Ok(record)
}

/// Re-fetch one subscription from its server, preserving per-script
/// enabled flags. Returns `None` for an unknown id; fetch errors
/// propagate to the caller.
pub fn update_subscription(
    store: &dyn StateStore,
    fetcher: &dyn HttpFetcher,
    subscription_id: &str,
) -> Result<Option<SubscriptionRecord>> {
    let mut subs = load_subscriptions(store);
    let Some(index) = subs.iter().position(|s| s.id == subscription_id) else {
        return Ok(None);
    };

    let endpoint = subscription_endpoint(&subs[index].server_base, &subs[index].license_key)?;
    let bundle = fetch_bundle(fetcher, &endpoint)?;

    subs[index].scripts = map_wire_scripts(&bundle.scripts, &subs[index].scripts);
    subs[index].last_updated = Some(now_millis());
    let updated = subs[index].clone();
    save_subscriptions(store, &subs)?;
    Ok(Some(updated))
}

/// Remove a subscription record. Unregistration of its scripts is the
/// caller's concern.
pub fn delete_subscription(store: &dyn StateStore, subscription_id: &str) -> Result<()> {
    let mut subs = load_subscriptions(store);
    subs.retain(|s| s.id != subscription_id);
    save_subscriptions(store, &subs)
}

/// Flip a subscription's enabled flag.
///
/// Disabling clears the script list entirely. Enabling persists the
/// flag first and then re-fetches; when the fetch fails the
/// subscription stays enabled with an empty script list.
pub fn toggle_subscription(
    store: &dyn StateStore,
    fetcher: &dyn HttpFetcher,
    subscription_id: &str,
) -> Result<Option<SubscriptionRecord>> {
    let mut subs = load_subscriptions(store);
    let Some(index) = subs.iter().position(|s| s.id == subscription_id) else {
        return Ok(None);
    };

    if subs[index].enabled {
        subs[index].enabled = false;
        subs[index].scripts = Vec::new();
        subs[index].last_updated = Some(now_millis());
        let snapshot = subs[index].clone();
        save_subscriptions(store, &subs)?;
        info!(subscription_id, enabled = false, "Toggled subscription");
        return Ok(Some(snapshot));
    }

    subs[index].enabled = true;
    subs[index].last_updated = Some(now_millis());
    let snapshot = subs[index].clone();
    save_subscriptions(store, &subs)?;
    info!(subscription_id, enabled = true, "Toggled subscription");

    match update_subscription(store, fetcher, subscription_id) {
        Ok(Some(updated)) => Ok(Some(updated)),
        Ok(None) => Ok(Some(snapshot)),
        Err(e) => {
            warn!(
                subscription_id,
                error = %e,
                "Re-fetch after enable failed, keeping empty script set"
            );
            Ok(Some(snapshot))
        }
    }
}

/// Flip one script inside a subscription. Returns the subscription
/// (unchanged when the script id is unknown), or `None` when the
/// subscription itself is unknown.
pub fn toggle_subscription_script(
    store: &dyn StateStore,
    subscription_id: &str,
    script_id: &str,
) -> Result<Option<SubscriptionRecord>> {
    let mut subs = load_subscriptions(store);
    let Some(index) = subs.iter().position(|s| s.id == subscription_id) else {
        return Ok(None);
    };

    let mut flipped = false;
    if let Some(script) = subs[index].scripts.iter_mut().find(|s| s.id == script_id) {
        script.enabled = !script.enabled;
        flipped = true;
    }
    let snapshot = subs[index].clone();
    if flipped {
        save_subscriptions(store, &subs)?;
    }
    Ok(Some(snapshot))
}

/// Best-effort refresh of every enabled subscription. Failures on one
/// entry never abort the sweep; the list is persisted once at the end
/// if and only if at least one bundle materially changed. Returns the
/// number of changed subscriptions.
pub fn refresh_subscriptions_auto(store: &dyn StateStore, fetcher: &dyn HttpFetcher) -> usize {
    let mut subs = load_subscriptions(store);
    let mut changed = 0;

    for sub in subs.iter_mut() {
        if !sub.enabled {
            continue;
        }
        let endpoint = match subscription_endpoint(&sub.server_base, &sub.license_key) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                debug!(subscription_id = %sub.id, error = %e, "Skipping subscription refresh");
                continue;
            }
        };
        match fetch_bundle(fetcher, &endpoint) {
            Ok(bundle) => {
                let next = map_wire_scripts(&bundle.scripts, &sub.scripts);
                if next != sub.scripts {
                    sub.scripts = next;
                    sub.last_updated = Some(now_millis());
                    changed += 1;
                }
            }
            Err(e) => {
                debug!(subscription_id = %sub.id, error = %e, "Subscription refresh failed");
            }
        }
    }

    if changed > 0 {
        save_subscriptions(store, &subs).log_err();
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::FetchResponse;
    use crate::store::{MemoryStateStore, StoreScope};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct MockFetcher {
        responses: Mutex<HashMap<String, FetchResponse>>,
    }

    impl MockFetcher {
        fn new() -> Self {
            MockFetcher {
                responses: Mutex::new(HashMap::new()),
            }
        }

        fn on_json(&self, url: &str, status: u16, body: serde_json::Value) {
            self.responses.lock().insert(
                url.to_string(),
                FetchResponse {
                    status,
                    headers: Vec::new(),
                    body: body.to_string().into_bytes(),
                },
            );
        }
    }

    impl HttpFetcher for MockFetcher {
        fn fetch(&self, url: &str, _options: &FetchOptions) -> Result<FetchResponse> {
            self.responses
                .lock()
                .get(url)
                .cloned()
                .ok_or_else(|| SyncError::Transport(format!("no canned response for {url}")))
        }
    }

    const CODE: &str =
        "// ==UserScript==\n// @match https://example.com/*\n// ==/UserScript==\ngo()";

    fn bundle_json(ids: &[&str]) -> serde_json::Value {
        let scripts: Vec<serde_json::Value> = ids
            .iter()
            .map(|id| {
                serde_json::json!({
                    "ID": id, "Version": "1.0", "Code": CODE, "Removed": false
                })
            })
            .collect();
        serde_json::json!({
            "license": {"key": "KEY", "status": "active", "note": "Team Bundle"},
            "scripts": scripts
        })
    }

    #[test]
    fn add_subscription_derives_base_license_and_name() {
        let store = MemoryStateStore::new();
        let fetcher = MockFetcher::new();
        let url = "https://server.example:8443/subscription?license=KEY";
        let mut body = bundle_json(&["s1", "s2"]);
        body["scripts"]
            .as_array_mut()
            .unwrap()
            .push(serde_json::json!({
                "ID": "dead", "Version": "1.0", "Code": CODE, "Removed": true
            }));
        fetcher.on_json(url, 200, body);

        let record = add_subscription(&store, &fetcher, url, None).unwrap();
        assert_eq!(record.server_base, "https://server.example:8443");
        assert_eq!(record.license_key, "KEY");
        assert_eq!(record.name, "Team Bundle");
        assert!(record.enabled);
        let ids: Vec<&str> = record.scripts.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2"]);
        assert!(record.scripts.iter().all(|s| s.enabled));

        // persisted
        assert_eq!(load_subscriptions(&store).len(), 1);
    }

    #[test]
    fn add_subscription_name_precedence() {
        let store = MemoryStateStore::new();
        let fetcher = MockFetcher::new();
        let url = "https://server.example/subscription?license=KEY";
        fetcher.on_json(url, 200, bundle_json(&["s1"]));

        let named = add_subscription(&store, &fetcher, url, Some("Explicit")).unwrap();
        assert_eq!(named.name, "Explicit");

        let mut no_note = bundle_json(&["s1"]);
        no_note["license"]["note"] = serde_json::Value::Null;
        fetcher.on_json(url, 200, no_note);
        let fallback = add_subscription(&store, &fetcher, url, None).unwrap();
        assert_eq!(fallback.name, "Subscription KEY");
    }

    #[test]
    fn add_subscription_rejects_bad_url_and_http_error() {
        let store = MemoryStateStore::new();
        let fetcher = MockFetcher::new();
        assert!(add_subscription(&store, &fetcher, "not a url", None).is_err());

        let url = "https://server.example/subscription?license=KEY";
        fetcher.on_json(url, 403, serde_json::json!({"error": "bad license"}));
        let err = add_subscription(&store, &fetcher, url, None).unwrap_err();
        assert!(matches!(err, SyncError::Http { status: 403, .. }));
        assert!(load_subscriptions(&store).is_empty());
    }

    fn seeded_subscription(store: &MemoryStateStore, scripts: Vec<SubscriptionScript>) -> String {
        let record = SubscriptionRecord {
            id: "subscription_1".to_string(),
            name: "Bundle".to_string(),
            server_base: "https://server.example".to_string(),
            license_key: "KEY".to_string(),
            scripts,
            ..Default::default()
        };
        save_subscriptions(store, &[record]).unwrap();
        "subscription_1".to_string()
    }

    #[test]
    fn update_preserves_per_script_enabled() {
        let store = MemoryStateStore::new();
        let id = seeded_subscription(
            &store,
            vec![
                SubscriptionScript {
                    id: "s1".to_string(),
                    code: "old".to_string(),
                    enabled: false,
                    ..Default::default()
                },
                SubscriptionScript {
                    id: "s2".to_string(),
                    code: "old".to_string(),
                    ..Default::default()
                },
            ],
        );

        let fetcher = MockFetcher::new();
        fetcher.on_json(
            "https://server.example/subscription?license=KEY",
            200,
            bundle_json(&["s1", "s2", "s3"]),
        );

        let updated = update_subscription(&store, &fetcher, &id).unwrap().unwrap();
        assert_eq!(updated.scripts.len(), 3);
        assert!(!updated.scripts[0].enabled); // preserved
        assert!(updated.scripts[1].enabled);
        assert!(updated.scripts[2].enabled); // new default
        assert!(updated.last_updated.is_some());
    }

    #[test]
    fn update_unknown_id_is_none_and_errors_propagate() {
        let store = MemoryStateStore::new();
        let fetcher = MockFetcher::new();
        assert!(update_subscription(&store, &fetcher, "missing")
            .unwrap()
            .is_none());

        let id = seeded_subscription(&store, Vec::new());
        // No canned response: transport error must propagate
        assert!(update_subscription(&store, &fetcher, &id).is_err());
    }

    #[test]
    fn toggle_disable_clears_scripts() {
        let store = MemoryStateStore::new();
        let id = seeded_subscription(
            &store,
            vec![SubscriptionScript {
                id: "s1".to_string(),
                code: CODE.to_string(),
                ..Default::default()
            }],
        );
        let fetcher = MockFetcher::new();

        let toggled = toggle_subscription(&store, &fetcher, &id).unwrap().unwrap();
        assert!(!toggled.enabled);
        assert!(toggled.scripts.is_empty());
        assert!(load_subscriptions(&store)[0].scripts.is_empty());
    }

    #[test]
    fn toggle_enable_refetches_scripts() {
        let store = MemoryStateStore::new();
        let id = seeded_subscription(&store, Vec::new());
        let fetcher = MockFetcher::new();
        fetcher.on_json(
            "https://server.example/subscription?license=KEY",
            200,
            bundle_json(&["s1"]),
        );

        // First toggle disables, second re-enables and fetches
        toggle_subscription(&store, &fetcher, &id).unwrap();
        let enabled = toggle_subscription(&store, &fetcher, &id).unwrap().unwrap();
        assert!(enabled.enabled);
        assert_eq!(enabled.scripts.len(), 1);
    }

    #[test]
    fn toggle_enable_with_failing_fetch_keeps_enabled_and_empty() {
        let store = MemoryStateStore::new();
        let id = seeded_subscription(&store, Vec::new());
        let fetcher = MockFetcher::new();

        toggle_subscription(&store, &fetcher, &id).unwrap(); // disable
        let enabled = toggle_subscription(&store, &fetcher, &id).unwrap().unwrap();
        assert!(enabled.enabled);
        assert!(enabled.scripts.is_empty());

        let stored = &load_subscriptions(&store)[0];
        assert!(stored.enabled);
        assert!(stored.scripts.is_empty());
    }

    #[test]
    fn toggle_script_flips_only_the_target() {
        let store = MemoryStateStore::new();
        let id = seeded_subscription(
            &store,
            vec![
                SubscriptionScript {
                    id: "s1".to_string(),
                    code: CODE.to_string(),
                    ..Default::default()
                },
                SubscriptionScript {
                    id: "s2".to_string(),
                    code: CODE.to_string(),
                    ..Default::default()
                },
            ],
        );

        let record = toggle_subscription_script(&store, &id, "s1").unwrap().unwrap();
        assert!(!record.scripts[0].enabled);
        assert!(record.scripts[1].enabled);

        // Unknown script id: subscription returned, nothing flipped
        let record = toggle_subscription_script(&store, &id, "nope").unwrap().unwrap();
        assert!(!record.scripts[0].enabled);
        assert!(record.scripts[1].enabled);

        assert!(toggle_subscription_script(&store, "missing", "s1")
            .unwrap()
            .is_none());
    }

    #[test]
    fn sweep_persists_once_only_when_changed() {
        let store = MemoryStateStore::new();
        seeded_subscription(
            &store,
            vec![SubscriptionScript {
                id: "s1".to_string(),
                version: Some("1.0".to_string()),
                code: CODE.to_string(),
                ..Default::default()
            }],
        );

        let writes = Arc::new(AtomicUsize::new(0));
        let writes_clone = writes.clone();
        store.add_listener(Arc::new(move |change: &crate::store::StoreChange| {
            if change.scope == StoreScope::Local {
                writes_clone.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let fetcher = MockFetcher::new();
        // Identical bundle: no change, no write
        fetcher.on_json(
            "https://server.example/subscription?license=KEY",
            200,
            bundle_json(&["s1"]),
        );
        assert_eq!(refresh_subscriptions_auto(&store, &fetcher), 0);
        assert_eq!(writes.load(Ordering::SeqCst), 0);

        // New script appears: one change, one write
        fetcher.on_json(
            "https://server.example/subscription?license=KEY",
            200,
            bundle_json(&["s1", "s2"]),
        );
        assert_eq!(refresh_subscriptions_auto(&store, &fetcher), 1);
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sweep_skips_disabled_subscriptions() {
        let store = MemoryStateStore::new();
        let record = SubscriptionRecord {
            id: "subscription_off".to_string(),
            name: "Off".to_string(),
            server_base: "https://server.example".to_string(),
            license_key: "KEY".to_string(),
            enabled: false,
            ..Default::default()
        };
        save_subscriptions(&store, &[record]).unwrap();

        // No canned responses at all: a fetch attempt would error, a
        // skipped subscription reports zero changes.
        let fetcher = MockFetcher::new();
        assert_eq!(refresh_subscriptions_auto(&store, &fetcher), 0);
    }

    #[test]
    fn delete_subscription_removes_record() {
        let store = MemoryStateStore::new();
        let id = seeded_subscription(&store, Vec::new());
        delete_subscription(&store, &id).unwrap();
        assert!(load_subscriptions(&store).is_empty());
    }
}
