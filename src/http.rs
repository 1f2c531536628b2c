//! HTTP fetcher abstraction.
//!
//! Refresh and resource loading go through [`HttpFetcher`] so tests
//! can substitute canned responses. The ureq-backed implementation
//! treats every received status as a success at the transport level;
//! 304 in particular is a first-class outcome, not an error.

use std::io::Read;
use std::time::Duration;

use serde::de::DeserializeOwned;
use ureq::Agent;

use crate::error::{Result, SyncError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Options for a single fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Ask intermediaries not to serve a cached copy.
    pub cache_bypass: bool,
    /// Extra request headers (precondition tokens and the like).
    pub headers: Vec<(String, String)>,
    /// Per-request deadline overriding the agent default.
    pub timeout: Option<Duration>,
}

impl FetchOptions {
    /// Options with cache bypass on, the baseline for refresh traffic.
    pub fn no_store() -> Self {
        FetchOptions {
            cache_bypass: true,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A completed HTTP exchange.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_not_modified(&self) -> bool {
        self.status == 304
    }

    /// Case-insensitive response header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn etag(&self) -> Option<String> {
        self.header("etag").map(str::to_string)
    }

    /// Body as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Body parsed as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Abstract transport used by refresh and resource loading.
pub trait HttpFetcher: Send + Sync {
    fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchResponse>;
}

/// Blocking fetcher backed by a shared [`ureq::Agent`].
pub struct UreqFetcher {
    agent: Agent,
}

impl UreqFetcher {
    pub fn new(timeout: Duration) -> Self {
        let agent: Agent = Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        UreqFetcher { agent }
    }
}

impl Default for UreqFetcher {
    fn default() -> Self {
        UreqFetcher::new(DEFAULT_TIMEOUT)
    }
}

impl HttpFetcher for UreqFetcher {
    fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchResponse> {
        let mut request = self.agent.get(url);
        if let Some(timeout) = options.timeout {
            request = request.config().timeout_global(Some(timeout)).build();
        }
        if options.cache_bypass {
            request = request
                .header("Cache-Control", "no-cache")
                .header("Pragma", "no-cache");
        }
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .call()
            .map_err(|e| SyncError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let mut headers = Vec::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.push((name.as_str().to_string(), value.to_string()));
            }
        }

        let mut body = Vec::new();
        response
            .into_body()
            .into_reader()
            .read_to_end(&mut body)?;

        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }
}
