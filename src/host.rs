//! Injection host abstraction.
//!
//! The page-injection engine is external; this trait captures the
//! slice of its API the coordinator drives. [`TracingHost`] is an
//! in-process implementation that enforces the engine's id rules
//! (no duplicate registration, no unknown unregistration) and records
//! what would be injected.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::info;

use crate::error::{Result, SyncError};

/// Which JavaScript world a script executes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionWorld {
    /// The page's own world, for the user's functional code.
    Main,
    /// An isolated world, used for the indicator overlay.
    Isolated,
}

impl ExecutionWorld {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionWorld::Main => "MAIN",
            ExecutionWorld::Isolated => "USER_SCRIPT",
        }
    }
}

/// When in the page lifecycle a script runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTiming {
    DocumentStart,
    DocumentEnd,
    DocumentIdle,
}

impl RunTiming {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTiming::DocumentStart => "document_start",
            RunTiming::DocumentEnd => "document_end",
            RunTiming::DocumentIdle => "document_idle",
        }
    }
}

/// Everything the host needs to register one script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRequest {
    /// Host-side registration id, unique per registration.
    pub id: String,
    pub matches: Vec<String>,
    pub excludes: Vec<String>,
    /// Code blobs in execution order (required resources first, the
    /// script's own code last).
    pub js_sources: Vec<String>,
    pub world: ExecutionWorld,
    pub run_at: RunTiming,
}

/// The injection engine interface.
pub trait InjectionHost: Send + Sync {
    /// Register one script. Fails if the id is already registered.
    fn register(&self, request: RegistrationRequest) -> Result<()>;

    /// Remove the given registrations. Fails if any id is unknown.
    fn unregister(&self, ids: &[String]) -> Result<()>;

    /// Remove every registration.
    fn unregister_all(&self) -> Result<()>;

    /// Capability probe: whether the engine is usable at all.
    fn is_available(&self) -> bool;
}

/// In-process host that records registrations and logs transitions.
#[derive(Default)]
pub struct TracingHost {
    registrations: Mutex<BTreeMap<String, RegistrationRequest>>,
    register_calls: AtomicUsize,
}

impl TracingHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of current registrations, ordered by id.
    pub fn registered(&self) -> Vec<RegistrationRequest> {
        self.registrations.lock().values().cloned().collect()
    }

    /// Ids of current registrations, ordered.
    pub fn registered_ids(&self) -> Vec<String> {
        self.registrations.lock().keys().cloned().collect()
    }

    /// Total successful `register` calls since construction.
    pub fn register_call_count(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }
}

impl InjectionHost for TracingHost {
    fn register(&self, request: RegistrationRequest) -> Result<()> {
        let mut registrations = self.registrations.lock();
        if registrations.contains_key(&request.id) {
            return Err(SyncError::Registration {
                id: request.id,
                message: "id already registered".to_string(),
            });
        }
        info!(
            registration_id = %request.id,
            world = request.world.as_str(),
            run_at = request.run_at.as_str(),
            matches = request.matches.len(),
            sources = request.js_sources.len(),
            "Registered script"
        );
        registrations.insert(request.id.clone(), request);
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unregister(&self, ids: &[String]) -> Result<()> {
        let mut registrations = self.registrations.lock();
        for id in ids {
            if !registrations.contains_key(id) {
                return Err(SyncError::Registration {
                    id: id.clone(),
                    message: "id not registered".to_string(),
                });
            }
        }
        for id in ids {
            registrations.remove(id);
            info!(registration_id = %id, "Unregistered script");
        }
        Ok(())
    }

    fn unregister_all(&self) -> Result<()> {
        let mut registrations = self.registrations.lock();
        let count = registrations.len();
        registrations.clear();
        if count > 0 {
            info!(count, "Unregistered all scripts");
        }
        Ok(())
    }

    fn is_available(&self) -> bool {
        true
    }
}
