//! Assembles the ordered JavaScript sources for one executable script.
//!
//! `@require` dependencies are fetched fresh with a bounded timeout and
//! prepended in declaration order; the script's own code always runs
//! last. A dependency that fails to download is skipped with a warning
//! rather than blocking the script.

use std::time::Duration;

use tracing::{debug, warn};

use crate::http::{FetchOptions, HttpFetcher};
use crate::records::ExecutableScript;

/// Upper bound on a single dependency download.
const REQUIRE_TIMEOUT: Duration = Duration::from_secs(15);

fn fetch_require(fetcher: &dyn HttpFetcher, url: &str) -> Option<String> {
    let options = FetchOptions::no_store().with_timeout(REQUIRE_TIMEOUT);
    match fetcher.fetch(url, &options) {
        Ok(response) if response.is_success() => Some(response.text()),
        Ok(response) => {
            warn!(url, status = response.status, "Dependency download failed");
            None
        }
        Err(e) => {
            warn!(url, error = %e, "Dependency download failed");
            None
        }
    }
}

/// Ordered sources for registration: resolved `@require` bodies first,
/// then the script's own code.
pub fn assemble_sources(fetcher: &dyn HttpFetcher, script: &ExecutableScript) -> Vec<String> {
    let mut sources = Vec::with_capacity(script.metadata.requires.len() + 1);
    for url in &script.metadata.requires {
        if let Some(body) = fetch_require(fetcher, url) {
            debug!(script_id = %script.id, url, "Resolved dependency");
            sources.push(body);
        }
    }
    sources.push(script.code.clone());
    sources
}
