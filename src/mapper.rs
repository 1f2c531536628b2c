//! Script Mapper: converts persisted records into [`ExecutableScript`]s.
//!
//! Mapping is pure and transient (no caching, no network): url/server
//! records resolve strictly from `cache.code`, so an unfetched remote
//! record maps to nothing until a refresh succeeds. Explicit pattern
//! overrides are unioned with patterns parsed from the code header,
//! and both lists are normalized before they reach the host.

use crate::metadata::{parse_metadata, ScriptMetadata};
use crate::patterns::normalize_patterns;
use crate::records::{
    load_plugins, load_subscriptions, ExecutableScript, PluginRecord, ScriptOrigin, SourceType,
    SubscriptionRecord, SubscriptionScript,
};
use crate::store::StateStore;

pub(crate) fn union_patterns(explicit: &[String], parsed: &[String]) -> Vec<String> {
    let mut out = explicit.to_vec();
    for pattern in parsed {
        if !out.contains(pattern) {
            out.push(pattern.clone());
        }
    }
    out
}

/// Map one plugin record. Returns `None` when the record resolves to
/// no code or to zero match patterns.
pub fn map_plugin(record: &PluginRecord) -> Option<ExecutableScript> {
    let code = record.resolved_code().unwrap_or("");
    if code.is_empty() {
        return None;
    }

    let parsed = parse_metadata(code);
    let matches = normalize_patterns(&union_patterns(&record.matches, &parsed.matches));
    if matches.is_empty() {
        return None;
    }
    let excludes = normalize_patterns(&union_patterns(&record.excludes, &parsed.excludes));

    let name = record
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| record.id.clone());

    Some(ExecutableScript {
        id: record.id.clone(),
        name,
        enabled: record.enabled,
        source_type: record.source_type,
        code: code.to_string(),
        metadata: ScriptMetadata {
            matches,
            excludes,
            ..parsed
        },
        origin: ScriptOrigin::Plugin {
            plugin_id: record.id.clone(),
        },
    })
}

/// Map one script out of a subscription bundle. The derived id is
/// `{subscriptionId}_{serverScriptId}` so different subscriptions can
/// carry the same server script without colliding.
pub fn map_subscription_script(
    script: &SubscriptionScript,
    subscription: &SubscriptionRecord,
) -> Option<ExecutableScript> {
    if script.code.is_empty() {
        return None;
    }

    let parsed = parse_metadata(&script.code);
    let matches = normalize_patterns(&parsed.matches);
    if matches.is_empty() {
        return None;
    }
    let excludes = normalize_patterns(&parsed.excludes);

    let name = parsed
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| script.id.clone());

    Some(ExecutableScript {
        id: format!("{}_{}", subscription.id, script.id),
        name,
        enabled: script.enabled,
        source_type: SourceType::Server,
        code: script.code.clone(),
        metadata: ScriptMetadata {
            matches,
            excludes,
            ..parsed
        },
        origin: ScriptOrigin::Subscription {
            subscription_id: subscription.id.clone(),
            server_script_id: script.id.clone(),
        },
    })
}

/// Enabled, matchable scripts only: the set the coordinator registers.
/// Subscription scripts require both the subscription and the script
/// itself to be enabled.
pub fn collect_enabled(
    plugins: &[PluginRecord],
    subscriptions: &[SubscriptionRecord],
) -> Vec<ExecutableScript> {
    let mut out = Vec::new();
    for plugin in plugins {
        if !plugin.enabled {
            continue;
        }
        if let Some(script) = map_plugin(plugin) {
            out.push(script);
        }
    }
    for subscription in subscriptions {
        if !subscription.enabled {
            continue;
        }
        for script in &subscription.scripts {
            if !script.enabled {
                continue;
            }
            if let Some(mapped) = map_subscription_script(script, subscription) {
                out.push(mapped);
            }
        }
    }
    out
}

/// Every mappable script regardless of enabled state, for UI listings.
pub fn collect_all(
    plugins: &[PluginRecord],
    subscriptions: &[SubscriptionRecord],
) -> Vec<ExecutableScript> {
    let mut out = Vec::new();
    for plugin in plugins {
        if let Some(script) = map_plugin(plugin) {
            out.push(script);
        }
    }
    for subscription in subscriptions {
        for script in &subscription.scripts {
            if let Some(mapped) = map_subscription_script(script, subscription) {
                out.push(mapped);
            }
        }
    }
    out
}

/// Load records and map the enabled set in one step.
pub fn enabled_scripts(store: &dyn StateStore) -> Vec<ExecutableScript> {
    collect_enabled(&load_plugins(store), &load_subscriptions(store))
}

/// Load records and map everything in one step.
pub fn all_scripts(store: &dyn StateStore) -> Vec<ExecutableScript> {
    collect_all(&load_plugins(store), &load_subscriptions(store))
}
