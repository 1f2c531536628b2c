//! Orchestration layer: storage events, navigation, the message
//! surface, and outbound broadcasts.
//!
//! All mutating paths write the store inside a suppress scope so the
//! store-change listener does not reconcile a second time, then apply
//! the minimal host change themselves. Changes arriving from outside
//! (another surface writing the store directly) reach the listener
//! unsuppressed and trigger a full reconcile.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::badge;
use crate::coordinator::Coordinator;
use crate::error::ResultExt;
use crate::host::InjectionHost;
use crate::http::HttpFetcher;
use crate::mapper;
use crate::messages::{IncomingScript, Request, Response, ScriptPatch, CORE_SOURCE};
use crate::metadata::parse_metadata;
use crate::patterns;
use crate::records::{
    self, generate_plugin_id, now_millis, ExecutableScript, InlineSource, PluginRecord,
    ScriptOrigin, SourceType,
};
use crate::refresh;
use crate::settings;
use crate::store::{StateStore, StoreChange, StoreScope};

/// Broadcasts pushed to the embedder's UI surfaces.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundEvent {
    StateChanged { source: String },
    BadgeCount { count: u32 },
}

pub type BroadcastFn = Arc<dyn Fn(&OutboundEvent) + Send + Sync>;

/// Ties the store, refresher, coordinator and message surface
/// together for one embedder.
pub struct SyncService {
    store: Arc<dyn StateStore>,
    host: Arc<dyn InjectionHost>,
    fetcher: Arc<dyn HttpFetcher>,
    coordinator: Arc<Coordinator>,
    broadcast: Option<BroadcastFn>,
    active_url: Mutex<String>,
}

impl SyncService {
    pub fn new(
        store: Arc<dyn StateStore>,
        host: Arc<dyn InjectionHost>,
        fetcher: Arc<dyn HttpFetcher>,
    ) -> Self {
        let coordinator = Arc::new(Coordinator::new(
            store.clone(),
            host.clone(),
            fetcher.clone(),
        ));
        SyncService {
            store,
            host,
            fetcher,
            coordinator,
            broadcast: None,
            active_url: Mutex::new(String::new()),
        }
    }

    pub fn with_broadcast(mut self, broadcast: BroadcastFn) -> Self {
        self.broadcast = Some(broadcast);
        self
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Wire the store listener and bring the host in line with stored
    /// state. Call once after construction.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.store.add_listener(Arc::new(move |change: &StoreChange| {
            if let Some(service) = weak.upgrade() {
                service.handle_store_change(change);
            }
        }));
        self.coordinator.reconcile_all();
        self.emit_badge();
        info!("Sync service started");
    }

    fn emit(&self, event: OutboundEvent) {
        if let Some(broadcast) = &self.broadcast {
            broadcast(&event);
        }
    }

    fn emit_state_changed(&self) {
        self.emit(OutboundEvent::StateChanged {
            source: CORE_SOURCE.to_string(),
        });
    }

    fn emit_badge(&self) -> u32 {
        let url = self.active_url.lock().clone();
        let count = badge::count_for_url(&*self.store, &url);
        self.emit(OutboundEvent::BadgeCount { count });
        count
    }

    /// React to a store change. Self-triggered writes arrive while a
    /// suppress scope is active and are ignored; only the watched
    /// record and settings keys cause a reconcile.
    pub fn handle_store_change(&self, change: &StoreChange) {
        if self.coordinator.is_suppressed() {
            debug!(scope = change.scope.as_str(), "Ignoring self-triggered store change");
            return;
        }
        let relevant = match change.scope {
            StoreScope::Local => change.changed_keys.iter().any(|key| {
                matches!(
                    key.as_str(),
                    records::SCRIPTS_KEY | records::SUBSCRIPTIONS_KEY
                )
            }),
            StoreScope::Sync => change.changed_keys.iter().any(|key| {
                matches!(
                    key.as_str(),
                    settings::ENABLED_KEY
                        | settings::VISUAL_INDICATOR_KEY
                        | settings::AUTO_UPDATE_KEY
                )
            }),
        };
        if !relevant {
            return;
        }
        debug!(
            scope = change.scope.as_str(),
            keys = ?change.changed_keys,
            "Store change triggers reconcile"
        );
        self.coordinator.reconcile_all();
        self.emit_state_changed();
        self.emit_badge();
    }

    /// Record the active page URL, opportunistically refresh remote
    /// sources, and recount the badge. Returns the count.
    pub fn handle_navigation(&self, url: &str) -> u32 {
        *self.active_url.lock() = url.to_string();
        self.maybe_refresh_for_url(url);
        self.emit_badge()
    }

    /// Auto-refresh gate: a sweep is only worth running when the page
    /// could execute remote-sourced code, or url plugins exist whose
    /// metadata may change their coverage.
    fn maybe_refresh_for_url(&self, url: &str) {
        if url.is_empty() || !settings::load_settings(&*self.store).auto_update {
            return;
        }
        let has_url_plugin = records::load_plugins(&*self.store)
            .iter()
            .any(|p| p.enabled && p.source_type == SourceType::Url);
        let remote_covers_page = mapper::enabled_scripts(&*self.store).iter().any(|s| {
            matches!(s.source_type, SourceType::Url | SourceType::Server)
                && patterns::is_covered(url, &s.metadata.matches, &s.metadata.excludes)
        });
        if !has_url_plugin && !remote_covers_page {
            return;
        }

        let _suppress = self.coordinator.suppress();
        let summary = refresh::refresh_all_auto(&*self.store, &*self.fetcher);
        self.coordinator.reconcile_all();
        if summary.any_changed() {
            self.emit_state_changed();
        }
    }

    /// Kill switch: flip the global setting off and tear everything
    /// down.
    pub fn emergency_stop(&self) {
        {
            let _suppress = self.coordinator.suppress();
            settings::set_enabled(&*self.store, false).log_err();
        }
        self.coordinator.reconcile_all();
        self.emit_state_changed();
        self.emit_badge();
        warn!("Emergency stop engaged");
    }

    /// Dispatch a raw JSON message; undecodable input becomes a
    /// failure response instead of an error.
    pub fn handle_raw_message(&self, raw: serde_json::Value) -> Response {
        match serde_json::from_value::<Request>(raw) {
            Ok(request) => self.handle_message(request),
            Err(e) => {
                warn!(error = %e, "Undecodable message");
                Response::failure(format!("bad message: {e}"))
            }
        }
    }

    pub fn handle_message(&self, request: Request) -> Response {
        match request {
            Request::GetScripts => Response::scripts(mapper::enabled_scripts(&*self.store)),
            Request::AddScript { script } => self.add_script(script),
            Request::UpdateScript { id, script } => self.update_script(&id, script),
            Request::DeleteScript { id } => self.delete_script(&id),
            Request::ToggleScript { id } => self.toggle_script(&id),
            Request::ReloadScripts => {
                self.coordinator.reconcile_all();
                self.emit_badge();
                Response::ack()
            }
            Request::EmergencyStop => {
                self.emergency_stop();
                Response::ack()
            }
            Request::StateChanged { source } => {
                if source.as_deref() != Some(CORE_SOURCE) {
                    self.coordinator.reconcile_all();
                    self.emit_badge();
                }
                Response::state_ack()
            }
            Request::CheckHostApi => Response::availability(self.host.is_available()),
        }
    }

    fn add_script(&self, incoming: IncomingScript) -> Response {
        let now = now_millis();
        let record = PluginRecord {
            id: incoming
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(generate_plugin_id),
            name: Some(incoming.name),
            enabled: incoming.enabled != Some(false),
            source_type: SourceType::Inline,
            inline: Some(InlineSource {
                content: incoming.code,
            }),
            created_at: Some(now),
            updated_at: Some(now),
            ..Default::default()
        };

        {
            let _suppress = self.coordinator.suppress();
            if let Err(e) = records::upsert_plugin(&*self.store, record.clone()) {
                return Response::failure(e);
            }
        }
        self.coordinator.resync_one(&record.id);
        self.emit_state_changed();
        self.emit_badge();
        info!(plugin_id = %record.id, "Added script");
        Response::saved(mapper::map_plugin(&record).unwrap_or_else(|| fallback_script(&record)))
    }

    fn update_script(&self, id: &str, patch: ScriptPatch) -> Response {
        let mut plugins = records::load_plugins(&*self.store);
        let Some(record) = plugins.iter_mut().find(|p| p.id == id) else {
            return Response::maybe(None);
        };
        if let Some(name) = patch.name {
            record.name = Some(name);
        }
        if let Some(enabled) = patch.enabled {
            record.enabled = enabled;
        }
        if let Some(code) = patch.code {
            // Code lives in the source payload; only inline records
            // accept direct edits.
            if record.source_type == SourceType::Inline {
                record.inline = Some(InlineSource { content: code });
            } else {
                warn!(
                    plugin_id = %record.id,
                    source = ?record.source_type,
                    "Ignoring code update for non-inline record"
                );
            }
        }
        record.updated_at = Some(now_millis());
        let updated = record.clone();

        {
            let _suppress = self.coordinator.suppress();
            if let Err(e) = records::save_plugins(&*self.store, &plugins) {
                return Response::failure(e);
            }
        }
        self.coordinator.resync_one(&updated.id);
        self.emit_state_changed();
        self.emit_badge();
        Response::maybe(mapper::map_plugin(&updated))
    }

    fn delete_script(&self, id: &str) -> Response {
        let mut plugins = records::load_plugins(&*self.store);
        let before = plugins.len();
        plugins.retain(|p| p.id != id);
        if plugins.len() < before {
            let _suppress = self.coordinator.suppress();
            if let Err(e) = records::save_plugins(&*self.store, &plugins) {
                return Response::failure(e);
            }
            info!(plugin_id = %id, "Deleted script");
        }
        self.coordinator.unregister_one(id);
        self.emit_state_changed();
        self.emit_badge();
        Response::ack()
    }

    fn toggle_script(&self, id: &str) -> Response {
        let mut plugins = records::load_plugins(&*self.store);
        let Some(record) = plugins.iter_mut().find(|p| p.id == id) else {
            return Response::maybe(None);
        };
        record.enabled = !record.enabled;
        record.updated_at = Some(now_millis());
        let updated = record.clone();

        {
            let _suppress = self.coordinator.suppress();
            if let Err(e) = records::save_plugins(&*self.store, &plugins) {
                return Response::failure(e);
            }
        }
        if updated.enabled {
            self.coordinator.resync_one(&updated.id);
        } else {
            self.coordinator.unregister_one(&updated.id);
        }
        self.emit_state_changed();
        self.emit_badge();
        info!(plugin_id = %updated.id, enabled = updated.enabled, "Toggled script");
        Response::maybe(mapper::map_plugin(&updated))
    }
}

/// Response shape for a record the mapper rejects (no code or no match
/// patterns): the UI still needs to see what was saved.
fn fallback_script(record: &PluginRecord) -> ExecutableScript {
    let code = record.resolved_code().unwrap_or_default().to_string();
    ExecutableScript {
        id: record.id.clone(),
        name: record.name.clone().unwrap_or_else(|| record.id.clone()),
        enabled: record.enabled,
        source_type: record.source_type,
        code: code.clone(),
        metadata: parse_metadata(&code),
        origin: ScriptOrigin::Plugin {
            plugin_id: record.id.clone(),
        },
    }
}
