//! Visual indicator overlay registered alongside a script.
//!
//! The overlay runs in the isolated world with the exact same URL
//! scope as the script it shadows, so a page shows the border iff at
//! least one managed script actually runs there. The embedded source
//! is idempotent per page and posts an emergency-stop message the
//! host relay forwards back to the service.

use crate::host::{ExecutionWorld, RegistrationRequest, RunTiming};
use crate::records::ExecutableScript;

/// Message type posted by the overlay's stop button.
pub const EMERGENCY_STOP_MESSAGE: &str = "AUTS_EMERGENCY_STOP";

/// Injected overlay: green page border plus an emergency stop button.
pub const INDICATOR_SOURCE: &str = r#"(() => {
  const BORDER_ID = '__auts_visual_border__';
  const BUTTON_ID = '__auts_emergency_stop__';
  if (document.getElementById(BORDER_ID)) return;

  const border = document.createElement('div');
  border.id = BORDER_ID;
  border.style.cssText =
    'position:fixed;inset:0;pointer-events:none;' +
    'border:3px solid #10B981;box-sizing:border-box;' +
    'z-index:2147483646;';

  const button = document.createElement('button');
  button.id = BUTTON_ID;
  button.textContent = 'Stop scripts';
  button.style.cssText =
    'position:fixed;bottom:12px;right:12px;padding:6px 10px;' +
    'background:#EF4444;color:#fff;border:none;border-radius:4px;' +
    'font:12px sans-serif;cursor:pointer;z-index:2147483647;';
  button.addEventListener('click', () => {
    window.postMessage({ type: 'AUTS_EMERGENCY_STOP' }, '*');
  });

  const attach = () => {
    document.body.appendChild(border);
    document.body.appendChild(button);
  };
  if (document.body) {
    attach();
  } else {
    window.addEventListener('DOMContentLoaded', attach, { once: true });
  }
})();"#;

/// Registration id of the overlay shadowing `registration_id`.
pub fn indicator_id(registration_id: &str) -> String {
    format!("{registration_id}_indicator")
}

/// Build the overlay registration mirroring the script's URL scope.
pub fn indicator_request(registration_id: &str, script: &ExecutableScript) -> RegistrationRequest {
    RegistrationRequest {
        id: indicator_id(registration_id),
        matches: script.metadata.matches.clone(),
        excludes: script.metadata.excludes.clone(),
        js_sources: vec![INDICATOR_SOURCE.to_string()],
        world: ExecutionWorld::Isolated,
        run_at: RunTiming::DocumentIdle,
    }
}
