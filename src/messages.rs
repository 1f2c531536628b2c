//! RPC surface shared with UI surfaces.
//!
//! Requests are tagged JSON objects (`type` field, SCREAMING_SNAKE
//! names) with payload fields alongside the tag. Responses always
//! carry `success` plus a variant-specific payload; undecodable input
//! maps to `{success: false, error}` at the dispatch layer rather than
//! an error the transport has to understand.

use serde::{Deserialize, Serialize};

use crate::records::ExecutableScript;

/// Source tag the service stamps on its own broadcasts, so it can
/// ignore them when they echo back.
pub const CORE_SOURCE: &str = "core";

/// New-script payload of an add request. Always becomes an inline
/// record; `enabled` defaults to on when omitted.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingScript {
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// Partial script update; absent fields stay untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScriptPatch {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub code: Option<String>,
}

/// Requests accepted over the message bus.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    GetScripts,
    AddScript {
        script: IncomingScript,
    },
    UpdateScript {
        id: String,
        script: ScriptPatch,
    },
    DeleteScript {
        id: String,
    },
    ToggleScript {
        id: String,
    },
    ReloadScripts,
    EmergencyStop,
    StateChanged {
        #[serde(default)]
        source: Option<String>,
    },
    CheckHostApi,
}

/// Responses, serialized as bare payload objects.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    ScriptList {
        success: bool,
        scripts: Vec<ExecutableScript>,
    },
    Saved {
        success: bool,
        script: ExecutableScript,
    },
    MaybeScript {
        success: bool,
        script: Option<ExecutableScript>,
    },
    HostAvailability {
        success: bool,
        available: bool,
    },
    StateAck {
        ok: bool,
    },
    Ack {
        success: bool,
    },
    Failure {
        success: bool,
        error: String,
    },
}

impl Response {
    pub fn ack() -> Self {
        Response::Ack { success: true }
    }

    pub fn scripts(scripts: Vec<ExecutableScript>) -> Self {
        Response::ScriptList {
            success: true,
            scripts,
        }
    }

    pub fn saved(script: ExecutableScript) -> Self {
        Response::Saved {
            success: true,
            script,
        }
    }

    pub fn maybe(script: Option<ExecutableScript>) -> Self {
        Response::MaybeScript {
            success: true,
            script,
        }
    }

    pub fn availability(available: bool) -> Self {
        Response::HostAvailability {
            success: true,
            available,
        }
    }

    pub fn state_ack() -> Self {
        Response::StateAck { ok: true }
    }

    pub fn failure(error: impl std::fmt::Display) -> Self {
        Response::Failure {
            success: false,
            error: error.to_string(),
        }
    }
}
