//! Glob-style URL pattern matching.
//!
//! Patterns use `*` for any run of characters and `?` for a single
//! character. A leading `*://` scheme wildcard is restricted to
//! `http`/`https`. Matching is case-insensitive and tolerates a
//! trailing slash plus any query string or fragment on the URL.

use regex::Regex;

/// Whether `url` matches the glob `pattern`.
///
/// Empty inputs and patterns that fail to compile match nothing.
pub fn url_matches(url: &str, pattern: &str) -> bool {
    if url.is_empty() || pattern.is_empty() {
        return false;
    }

    let mut regex_pattern = regex::escape(pattern)
        .replace("\\*", ".*")
        .replace("\\?", ".");

    // Scheme wildcard covers http/https only, never ftp/file/etc.
    if pattern.starts_with("*://") {
        if let Some(rest) = regex_pattern.strip_prefix(".*://") {
            regex_pattern = format!("https?://{rest}");
        }
    }

    let full = format!("(?i)^{regex_pattern}(?:/)?(?:[?#].*)?$");
    Regex::new(&full)
        .map(|re| re.is_match(url))
        .unwrap_or(false)
}

/// Whether `url` is covered by a match/exclude list pair.
///
/// Excludes always win: any matching exclude pattern makes the URL
/// uncovered regardless of the match list.
pub fn is_covered(url: &str, matches: &[String], excludes: &[String]) -> bool {
    for exclude in excludes {
        if url_matches(url, exclude) {
            return false;
        }
    }
    for pattern in matches {
        if url_matches(url, pattern) {
            return true;
        }
    }
    false
}

/// Normalize a whole pattern list. Order is preserved; duplicates are
/// left alone (the host tolerates them).
pub fn normalize_patterns(patterns: &[String]) -> Vec<String> {
    patterns
        .iter()
        .map(|p| normalize_match_pattern(p))
        .collect()
}

/// Normalize a pattern for host registration: strip any fragment, then
/// any query string, then ensure a trailing `*`.
pub fn normalize_match_pattern(pattern: &str) -> String {
    let mut base = pattern;
    if let Some(hash) = base.find('#') {
        base = &base[..hash];
    }
    if let Some(query) = base.find('?') {
        base = &base[..query];
    }
    if base.ends_with('*') {
        base.to_string()
    } else {
        format!("{base}*")
    }
}
