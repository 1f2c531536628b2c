//! Per-page active-script count, shown on the toolbar badge.

use crate::mapper;
use crate::patterns::is_covered;
use crate::settings;
use crate::store::StateStore;

/// How many enabled scripts would run on `url`. Zero when the global
/// switch is off or the state cannot be read.
pub fn count_for_url(store: &dyn StateStore, url: &str) -> u32 {
    if !settings::is_enabled(store) {
        return 0;
    }
    mapper::enabled_scripts(store)
        .iter()
        .filter(|script| is_covered(url, &script.metadata.matches, &script.metadata.excludes))
        .count() as u32
}
