//! Error types for registry synchronization.
//!
//! Fallible operations return [`Result`], and call sites that are
//! best-effort (per-script registration, background refresh) downgrade
//! failures to log lines via [`ResultExt`] instead of aborting the pass.

use thiserror::Error;

/// Errors that can occur while synchronizing the script registry.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Remote endpoint answered with a non-success status.
    #[error("HTTP {status} fetching {url}")]
    Http { status: u16, url: String },

    /// Request never produced a response (DNS, connect, timeout).
    #[error("transport error: {0}")]
    Transport(String),

    /// Payload could not be parsed as the expected JSON shape.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Backing store read or write failed.
    #[error("store error: {0}")]
    Store(String),

    /// Host rejected a script registration.
    #[error("registration failed for {id}: {message}")]
    Registration { id: String, message: String },

    /// A record was missing a field the operation cannot proceed without.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// Base64 payload code could not be decoded.
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// IO error (log directory, file-backed store).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Extension trait for logging errors without propagating them.
///
/// Best-effort paths (badge updates, per-plugin refresh) use these to
/// record the failure with its call site and carry on.
pub trait ResultExt<T> {
    /// Log the error at `error` level and convert to `Option`.
    fn log_err(self) -> Option<T>;

    /// Log the error at `warn` level and convert to `Option`.
    fn warn_on_err(self) -> Option<T>;
}

impl<T, E: std::fmt::Debug> ResultExt<T> for std::result::Result<T, E> {
    #[track_caller]
    fn log_err(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                let location = std::panic::Location::caller();
                tracing::error!(
                    error = ?e,
                    file = location.file(),
                    line = location.line(),
                    "Operation failed"
                );
                None
            }
        }
    }

    #[track_caller]
    fn warn_on_err(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                let location = std::panic::Location::caller();
                tracing::warn!(
                    error = ?e,
                    file = location.file(),
                    line = location.line(),
                    "Operation had warning"
                );
                None
            }
        }
    }
}

/// Panic in debug builds, log an error in release builds.
///
/// Used for states that indicate a logic bug (e.g. finishing a
/// reconcile pass that was never started) where crashing a release
/// process would be worse than a loud log line.
#[macro_export]
macro_rules! debug_panic {
    ($($arg:tt)*) => {
        if cfg!(debug_assertions) {
            panic!($($arg)*);
        } else {
            tracing::error!("IMPOSSIBLE STATE: {}", format!($($arg)*));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_error_formats_status_and_url() {
        let err = SyncError::Http {
            status: 404,
            url: "https://example.com/script.user.js".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "HTTP 404 fetching https://example.com/script.user.js"
        );
    }

    #[test]
    fn log_err_converts_to_option() {
        let ok: std::result::Result<i32, String> = Ok(5);
        assert_eq!(ok.log_err(), Some(5));

        let err: std::result::Result<i32, String> = Err("boom".to_string());
        assert_eq!(err.log_err(), None);
    }

    #[test]
    fn json_error_converts() {
        let parse_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: SyncError = parse_err.into();
        assert!(matches!(err, SyncError::Json(_)));
    }
}
