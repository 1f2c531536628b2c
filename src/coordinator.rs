//! Registration reconciliation.
//!
//! One reconcile pass tears down every registration this process owns
//! and rebuilds the enabled set from storage. Passes never overlap: a
//! request that arrives mid-pass sets a pending flag, and the running
//! pass is followed by exactly one catch-up pass no matter how many
//! requests landed meanwhile. The flags mutex is only ever held for
//! flag flips, never across a pass.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::debug_panic;
use crate::error::Result;
use crate::host::{ExecutionWorld, InjectionHost, RegistrationRequest, RunTiming};
use crate::http::HttpFetcher;
use crate::indicator;
use crate::loader;
use crate::mapper;
use crate::records::ExecutableScript;
use crate::settings;
use crate::store::StateStore;

/// Host-side registration id for a script.
pub fn registration_id(script_id: &str) -> String {
    format!("userscript_{script_id}")
}

#[derive(Debug, Default)]
struct ReconcileFlags {
    in_flight: bool,
    pending: bool,
    suppress: u32,
}

/// Holds reconciliation suppressed while a self-inflicted storage
/// write is in progress. Dropping the guard lifts the suppression.
pub struct SuppressGuard<'a> {
    coordinator: &'a Coordinator,
}

impl Drop for SuppressGuard<'_> {
    fn drop(&mut self) {
        let mut flags = self.coordinator.flags.lock();
        flags.suppress = flags.suppress.saturating_sub(1);
    }
}

/// Drives the injection host to mirror the enabled script set.
pub struct Coordinator {
    store: Arc<dyn StateStore>,
    host: Arc<dyn InjectionHost>,
    fetcher: Arc<dyn HttpFetcher>,
    flags: Mutex<ReconcileFlags>,
    /// Script id to the registration ids created for it (the script
    /// itself, plus the indicator overlay when enabled).
    tracked: Mutex<HashMap<String, Vec<String>>>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn StateStore>,
        host: Arc<dyn InjectionHost>,
        fetcher: Arc<dyn HttpFetcher>,
    ) -> Self {
        Coordinator {
            store,
            host,
            fetcher,
            flags: Mutex::new(ReconcileFlags::default()),
            tracked: Mutex::new(HashMap::new()),
        }
    }

    pub fn suppress(&self) -> SuppressGuard<'_> {
        self.flags.lock().suppress += 1;
        SuppressGuard { coordinator: self }
    }

    pub fn is_suppressed(&self) -> bool {
        self.flags.lock().suppress > 0
    }

    /// Script ids currently registered, ordered.
    pub fn tracked_script_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tracked.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn try_begin(&self) -> bool {
        let mut flags = self.flags.lock();
        if flags.in_flight {
            flags.pending = true;
            false
        } else {
            flags.in_flight = true;
            true
        }
    }

    /// Returns true when a queued request means another pass must run.
    fn finish(&self) -> bool {
        let mut flags = self.flags.lock();
        if !flags.in_flight {
            debug_panic!("reconcile finished without a matching begin");
            return false;
        }
        if flags.pending {
            flags.pending = false;
            true
        } else {
            flags.in_flight = false;
            false
        }
    }

    /// Rebuild every registration from storage. Requests that arrive
    /// while a pass runs coalesce into a single follow-up pass.
    pub fn reconcile_all(&self) {
        if !self.try_begin() {
            debug!("Reconcile in flight, queued follow-up");
            return;
        }
        loop {
            self.reconcile_pass();
            if !self.finish() {
                break;
            }
            debug!("Running queued reconcile pass");
        }
    }

    #[instrument(name = "reconcile_pass", skip(self))]
    fn reconcile_pass(&self) {
        if !self.host.is_available() {
            warn!("Injection engine unavailable, skipping reconcile");
            return;
        }

        let previous: Vec<(String, Vec<String>)> = self.tracked.lock().drain().collect();
        for (script_id, ids) in previous {
            if let Err(e) = self.host.unregister(&ids) {
                warn!(script_id = %script_id, error = %e, "Stale unregistration failed");
            }
        }

        let settings = settings::load_settings(&*self.store);
        if !settings.enabled {
            info!("Sync disabled, scripts stay unregistered");
            return;
        }

        let scripts = mapper::enabled_scripts(&*self.store);
        let mut registered = 0;
        for script in &scripts {
            match self.register_script(script, settings.visual_indicator) {
                Ok(()) => registered += 1,
                Err(e) => {
                    warn!(script_id = %script.id, error = %e, "Script registration failed")
                }
            }
        }
        info!(registered, total = scripts.len(), "Reconcile pass complete");
    }

    fn register_script(&self, script: &ExecutableScript, with_indicator: bool) -> Result<()> {
        let reg_id = registration_id(&script.id);
        let sources = loader::assemble_sources(&*self.fetcher, script);
        self.host.register(RegistrationRequest {
            id: reg_id.clone(),
            matches: script.metadata.matches.clone(),
            excludes: script.metadata.excludes.clone(),
            js_sources: sources,
            world: ExecutionWorld::Main,
            run_at: RunTiming::DocumentIdle,
        })?;

        let mut ids = vec![reg_id.clone()];
        if with_indicator {
            // The overlay is cosmetic; its failure never blocks the script.
            match self.host.register(indicator::indicator_request(&reg_id, script)) {
                Ok(()) => ids.push(indicator::indicator_id(&reg_id)),
                Err(e) => {
                    warn!(script_id = %script.id, error = %e, "Indicator registration failed")
                }
            }
        }
        self.tracked.lock().insert(script.id.clone(), ids);
        Ok(())
    }

    /// Remove one script's registrations. Untracked ids are a no-op.
    pub fn unregister_one(&self, script_id: &str) {
        let Some(ids) = self.tracked.lock().remove(script_id) else {
            return;
        };
        if let Err(e) = self.host.unregister(&ids) {
            warn!(script_id, error = %e, "Unregistration failed");
        }
    }

    /// Targeted replacement for one script: drop its registrations and
    /// register its current mapped form, leaving every other script's
    /// registrations alone. Scripts that no longer map (or are
    /// disabled, or fall under a disabled global switch) stay
    /// unregistered.
    pub fn resync_one(&self, script_id: &str) {
        self.unregister_one(script_id);
        if !self.host.is_available() {
            return;
        }
        let settings = settings::load_settings(&*self.store);
        if !settings.enabled {
            return;
        }
        let Some(script) = mapper::enabled_scripts(&*self.store)
            .into_iter()
            .find(|s| s.id == script_id)
        else {
            return;
        };
        if let Err(e) = self.register_script(&script, settings.visual_indicator) {
            warn!(script_id, error = %e, "Script registration failed");
        }
    }
}
