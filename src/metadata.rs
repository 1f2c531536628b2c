//! Userscript metadata block parsing.
//!
//! Extracts `@key value` directives from the first
//! `// ==UserScript== ... // ==/UserScript==` block in a script body.
//! Parsing never fails: malformed or absent blocks simply yield an
//! empty [`ScriptMetadata`].

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Parsed metadata directives from a userscript header block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScriptMetadata {
    /// Display name from `@name` (last occurrence wins).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Version string from `@version`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Description from `@description`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Author from `@author`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// URL patterns from `@match`, in order of appearance.
    pub matches: Vec<String>,
    /// URL patterns from `@exclude` / `@exclude-match`.
    pub excludes: Vec<String>,
    /// Requested privileges from `@grant`.
    pub grants: Vec<String>,
    /// External source URLs from `@require`.
    pub requires: Vec<String>,
}

fn block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"//\s*==UserScript==([\s\S]*?)//\s*==/UserScript==").expect("valid regex")
    })
}

fn directive_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^//\s*@([a-zA-Z0-9_-]+)\s+(.+?)\s*$").expect("valid regex"))
}

/// Parse the metadata block out of `code`.
///
/// Only the first block is considered. Lines inside the block that are
/// not `// @key value` directives are skipped. Scalar keys keep the
/// last occurrence; list keys accumulate in order.
pub fn parse_metadata(code: &str) -> ScriptMetadata {
    let mut meta = ScriptMetadata::default();

    let Some(caps) = block_regex().captures(code) else {
        return meta;
    };
    let body = caps.get(1).map(|m| m.as_str()).unwrap_or("");

    for raw_line in body.lines() {
        let line = raw_line.trim();
        let Some(m) = directive_regex().captures(line) else {
            continue;
        };
        let key = m[1].to_lowercase();
        let value = m[2].to_string();
        match key.as_str() {
            "name" => meta.name = Some(value),
            "version" => meta.version = Some(value),
            "description" => meta.description = Some(value),
            "author" => meta.author = Some(value),
            "match" => meta.matches.push(value),
            "exclude" | "exclude-match" => meta.excludes.push(value),
            "grant" => meta.grants.push(value),
            "require" => meta.requires.push(value),
            _ => {}
        }
    }

    meta
}
