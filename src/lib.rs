//! Registry synchronization core for a userscript manager.
//!
//! Keeps a persisted collection of script sources (inline code, remote
//! URLs, licensed server subscriptions, local files) mapped into a
//! normalized executable form, conditionally refreshed against their
//! remotes, and reconciled against an external page-injection engine
//! without stale or duplicate registrations.

pub mod error;
pub mod logging;

// Leaf building blocks
pub mod metadata;
pub mod patterns;
pub mod records;
pub mod settings;
pub mod store;

// External collaborator seams
pub mod host;
pub mod http;

// Mapping, refresh and registration
pub mod badge;
pub mod coordinator;
pub mod indicator;
pub mod loader;
pub mod mapper;
pub mod refresh;
pub mod subscriptions;

// Embedder surface
pub mod messages;
pub mod service;
