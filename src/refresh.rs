//! Remote refresh for url- and server-sourced plugins.
//!
//! Fetches are conditional: the stored cache-validation token rides
//! along as `If-None-Match`, and a 304 leaves the record completely
//! untouched. Successful fetches merge scalar metadata and union
//! pattern lists rather than replacing them, so manually-added
//! patterns survive a remote update. Nothing is persisted unless a
//! comparison key over the decisive fields actually changed.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};
use url::Url;

use crate::error::{Result, ResultExt, SyncError};
use crate::http::{FetchOptions, HttpFetcher};
use crate::mapper::union_patterns;
use crate::metadata::parse_metadata;
use crate::records::{
    load_plugins, now_millis, save_plugins, upsert_plugin, PluginRecord, SourceType, UrlSource,
};
use crate::store::StateStore;
use crate::subscriptions;

/// Comparison key over the fields that decide whether a refresh
/// materially changed a record. Fetch bookkeeping (timestamps, etags,
/// hashes) is excluded so a content-identical 200 causes no write.
fn refresh_key(record: &PluginRecord) -> String {
    let code = record
        .cache
        .as_ref()
        .and_then(|c| c.code.as_deref())
        .unwrap_or("");
    let parsed = parse_metadata(code);
    let mut matches = union_patterns(&record.matches, &parsed.matches);
    matches.sort();
    let mut excludes = union_patterns(&record.excludes, &parsed.excludes);
    excludes.sort();
    [
        record.name.clone().unwrap_or_default(),
        record.version.clone().unwrap_or_default(),
        record.description.clone().unwrap_or_default(),
        format!("m:{}", matches.join(",")),
        format!("x:{}", excludes.join(",")),
        code.trim().to_string(),
    ]
    .join("|")
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

fn union_into(target: &mut Vec<String>, parsed: &[String]) {
    for pattern in parsed {
        if !target.contains(pattern) {
            target.push(pattern.clone());
        }
    }
}

/// Merge freshly fetched code into a url-sourced record.
fn apply_url_refresh(record: &mut PluginRecord, code: String, etag: Option<String>) {
    let parsed = parse_metadata(&code);
    let now = now_millis();

    let name = non_empty(parsed.name.clone())
        .or_else(|| non_empty(record.name.take()))
        .unwrap_or_else(|| record.id.clone());
    record.name = Some(name);
    record.version = non_empty(parsed.version.clone()).or_else(|| record.version.take());
    record.description = parsed.description.clone().or_else(|| record.description.take());
    record.author = parsed.author.clone().or_else(|| record.author.take());

    union_into(&mut record.matches, &parsed.matches);
    union_into(&mut record.excludes, &parsed.excludes);

    if let Some(href) = record.url_href().map(str::to_string) {
        record.url = Some(UrlSource::Detailed {
            href,
            etag: etag.clone(),
        });
    }

    let mut cache = record.cache.take().unwrap_or_default();
    cache.sha256 = Some(hex::encode(Sha256::digest(code.as_bytes())));
    cache.code = Some(code);
    cache.etag = etag;
    cache.last_fetched_at = Some(now);
    record.cache = Some(cache);
    record.updated_at = Some(now);
}

fn conditional_fetch(
    fetcher: &dyn HttpFetcher,
    href: &str,
    etag: Option<&str>,
) -> Result<Option<(String, Option<String>)>> {
    let mut options = FetchOptions::no_store();
    if let Some(etag) = etag {
        options = options.with_header("If-None-Match", etag);
    }
    let response = fetcher.fetch(href, &options)?;
    if response.is_not_modified() {
        return Ok(None);
    }
    if !response.is_success() {
        return Err(SyncError::Http {
            status: response.status,
            url: href.to_string(),
        });
    }
    let etag = response.etag();
    Ok(Some((response.text(), etag)))
}

/// Conditionally refresh one url-sourced plugin.
///
/// Returns the persisted record when it materially changed, `None`
/// for 304 / unchanged content / records without a location. Non-2xx
/// statuses are errors; the existing cache stays untouched either way.
pub fn refresh_url_plugin(
    store: &dyn StateStore,
    fetcher: &dyn HttpFetcher,
    plugin: &PluginRecord,
) -> Result<Option<PluginRecord>> {
    let Some(href) = plugin.url_href().map(str::to_string) else {
        return Ok(None);
    };
    let Some((code, etag)) = conditional_fetch(fetcher, &href, plugin.refresh_etag())? else {
        debug!(plugin_id = %plugin.id, "Remote not modified");
        return Ok(None);
    };

    let mut candidate = plugin.clone();
    apply_url_refresh(&mut candidate, code, etag);
    if refresh_key(&candidate) == refresh_key(plugin) {
        debug!(plugin_id = %plugin.id, "Remote content unchanged");
        return Ok(None);
    }

    upsert_plugin(store, candidate.clone())?;
    info!(
        plugin_id = %plugin.id,
        version = ?candidate.version,
        "Refreshed url plugin"
    );
    Ok(Some(candidate))
}

/// Response body of the per-script server endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ServerScriptPayload {
    name: Option<String>,
    version: Option<String>,
    code: Option<String>,
    code_base64: Option<String>,
    sha256: Option<String>,
    signature: Option<String>,
    expires_at: Option<serde_json::Value>,
}

fn payload_code(payload: &ServerScriptPayload) -> Result<String> {
    if let Some(encoded) = &payload.code_base64 {
        let bytes = BASE64.decode(encoded)?;
        return Ok(String::from_utf8_lossy(&bytes).into_owned());
    }
    Ok(payload.code.clone().unwrap_or_default())
}

fn coerce_expires_at(value: &serde_json::Value, prior: Option<i64>) -> Option<i64> {
    crate::records::coerce_epoch_millis(value).or(prior)
}

/// Merge a server payload into a server-sourced record. Signed
/// provenance (`sha256`, `signature`, `expiresAt`) is preserved in the
/// cache even though verification happens elsewhere.
fn apply_server_refresh(
    record: &mut PluginRecord,
    payload: &ServerScriptPayload,
    code: String,
    etag: Option<String>,
) {
    let parsed = parse_metadata(&code);
    let now = now_millis();

    let server_script_id = record
        .server
        .as_ref()
        .map(|s| s.script_id.clone())
        .filter(|s| !s.is_empty());
    let name = non_empty(payload.name.clone())
        .or_else(|| non_empty(parsed.name.clone()))
        .or_else(|| non_empty(record.name.take()))
        .or(server_script_id)
        .unwrap_or_else(|| record.id.clone());
    record.name = Some(name);
    record.version = non_empty(payload.version.clone())
        .or_else(|| non_empty(parsed.version.clone()))
        .or_else(|| record.version.take());
    record.description = parsed.description.clone().or_else(|| record.description.take());
    record.author = parsed.author.clone().or_else(|| record.author.take());

    union_into(&mut record.matches, &parsed.matches);
    union_into(&mut record.excludes, &parsed.excludes);

    let mut cache = record.cache.take().unwrap_or_default();
    cache.version = non_empty(payload.version.clone()).or(cache.version);
    cache.etag = non_empty(etag).or(cache.etag);
    cache.sha256 = non_empty(payload.sha256.clone()).or(cache.sha256);
    cache.signature = non_empty(payload.signature.clone()).or(cache.signature);
    cache.expires_at = match &payload.expires_at {
        Some(value) => coerce_expires_at(value, cache.expires_at),
        None => cache.expires_at,
    };
    cache.last_fetched_at = Some(now);
    cache.code = Some(code);
    record.cache = Some(cache);
    record.updated_at = Some(now);
}

/// Conditionally refresh one server-sourced plugin against
/// `{serverBase}/scripts/{scriptId}?license=...`.
///
/// Records without a script id are skipped; a missing server base is
/// an error because the caller should not have routed here without
/// one.
pub fn refresh_server_plugin(
    store: &dyn StateStore,
    fetcher: &dyn HttpFetcher,
    plugin: &PluginRecord,
    server_base: &str,
) -> Result<Option<PluginRecord>> {
    let Some(script_id) = plugin
        .server
        .as_ref()
        .map(|s| s.script_id.as_str())
        .filter(|s| !s.is_empty())
    else {
        return Ok(None);
    };
    if server_base.is_empty() {
        return Err(SyncError::MissingField("serverBase"));
    }

    let mut endpoint = Url::parse(server_base)
        .map_err(|e| SyncError::Transport(format!("invalid server base {server_base}: {e}")))?;
    endpoint
        .path_segments_mut()
        .map_err(|_| SyncError::Transport(format!("invalid server base {server_base}")))?
        .pop_if_empty()
        .extend(["scripts", script_id]);
    if let Some(license) = plugin.server.as_ref().and_then(|s| s.license_key.as_deref()) {
        if !license.is_empty() {
            endpoint.query_pairs_mut().append_pair("license", license);
        }
    }
    let endpoint: String = endpoint.into();

    let etag = plugin.cache.as_ref().and_then(|c| c.etag.as_deref());
    let mut options = FetchOptions::no_store();
    if let Some(etag) = etag {
        options = options.with_header("If-None-Match", etag);
    }
    let response = fetcher.fetch(&endpoint, &options)?;
    if response.is_not_modified() {
        debug!(plugin_id = %plugin.id, "Server script not modified");
        return Ok(None);
    }
    if !response.is_success() {
        return Err(SyncError::Http {
            status: response.status,
            url: endpoint,
        });
    }

    let payload: ServerScriptPayload = response.json()?;
    let code = payload_code(&payload)?;
    let response_etag = response.etag();

    let mut candidate = plugin.clone();
    apply_server_refresh(&mut candidate, &payload, code, response_etag);
    if refresh_key(&candidate) == refresh_key(plugin) {
        debug!(plugin_id = %plugin.id, "Server script unchanged");
        return Ok(None);
    }

    upsert_plugin(store, candidate.clone())?;
    info!(
        plugin_id = %plugin.id,
        version = ?candidate.version,
        "Refreshed server plugin"
    );
    Ok(Some(candidate))
}

/// Best-effort refresh of every enabled url-sourced plugin. The list
/// is persisted once at the end iff at least one record changed.
/// Returns the number of changed records.
pub fn refresh_url_plugins_auto(store: &dyn StateStore, fetcher: &dyn HttpFetcher) -> usize {
    let mut plugins = load_plugins(store);
    let mut changed = 0;

    for plugin in plugins.iter_mut() {
        if plugin.source_type != SourceType::Url || !plugin.enabled {
            continue;
        }
        let Some(href) = plugin.url_href().map(str::to_string) else {
            continue;
        };
        let etag = plugin.refresh_etag().map(str::to_string);
        match conditional_fetch(fetcher, &href, etag.as_deref()) {
            Ok(Some((code, new_etag))) => {
                let mut candidate = plugin.clone();
                apply_url_refresh(&mut candidate, code, new_etag);
                if refresh_key(&candidate) != refresh_key(plugin) {
                    *plugin = candidate;
                    changed += 1;
                }
            }
            Ok(None) => {}
            Err(e) => {
                debug!(plugin_id = %plugin.id, error = %e, "Url plugin refresh failed");
            }
        }
    }

    if changed > 0 {
        save_plugins(store, &plugins).log_err();
    }
    changed
}

/// What an auto-refresh sweep touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub url_plugins_changed: usize,
    pub subscriptions_changed: usize,
}

impl SweepSummary {
    pub fn any_changed(&self) -> bool {
        self.url_plugins_changed > 0 || self.subscriptions_changed > 0
    }
}

/// Run both sweeps: enabled url plugins, then enabled subscriptions.
#[instrument(name = "refresh_sweep", skip_all)]
pub fn refresh_all_auto(store: &dyn StateStore, fetcher: &dyn HttpFetcher) -> SweepSummary {
    let url_plugins_changed = refresh_url_plugins_auto(store, fetcher);
    let subscriptions_changed = subscriptions::refresh_subscriptions_auto(store, fetcher);
    let summary = SweepSummary {
        url_plugins_changed,
        subscriptions_changed,
    };
    if summary.any_changed() {
        info!(
            url_plugins_changed,
            subscriptions_changed, "Auto refresh applied changes"
        );
    }
    summary
}
