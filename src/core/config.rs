//! Runtime configuration
//!
//! Tunables for the plugin runtime: the promise settlement window, the poll
//! cadence of the settlement loop, and the HTTP client timeouts used by the
//! guest `fetch` bridge. Values can come from code or from the environment
//! (`SOURCE_RUNTIME_*` variables).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default promise settlement window. Documented contract: a guest promise
/// that has not settled after this long fails the operation with
/// `PromiseTimeout`.
const DEFAULT_PROMISE_TIMEOUT_MS: u64 = 30_000;

/// Default cadence of the settlement poll loop.
const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

/// Configuration for one plugin runtime instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Hard timeout for guest promise settlement, in milliseconds.
    pub promise_timeout_ms: u64,

    /// Interval between settlement checks, in milliseconds.
    pub poll_interval_ms: u64,

    /// Total timeout for a guest-initiated HTTP request, in milliseconds.
    pub request_timeout_ms: u64,

    /// Connect timeout for guest-initiated HTTP requests, in milliseconds.
    pub connect_timeout_ms: u64,

    /// Capacity of the command channel feeding the dedicated worker thread.
    pub channel_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            promise_timeout_ms: DEFAULT_PROMISE_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            request_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            channel_capacity: 32,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from `SOURCE_RUNTIME_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("SOURCE_RUNTIME"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn promise_timeout(&self) -> Duration {
        Duration::from_millis(self.promise_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
