use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 80 usable bytes per chunk plus the terminator.
pub const DEFAULT_BUFFER_CAPACITY: usize = 81;

pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_millis(10);

pub const ENV_BUFFER_CAPACITY: &str = "STDREDIRECT_BUFFER_CAPACITY";
pub const ENV_TEARDOWN_TIMEOUT: &str = "STDREDIRECT_TEARDOWN_TIMEOUT";

/// Tunables for one redirection record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedirectConfig {
    /// Size of the delivery buffer, terminator included.
    pub buffer_capacity: usize,
    /// How long deactivation waits for the reader thread to exit.
    #[serde(with = "humantime_serde")]
    pub teardown_timeout: Duration,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
        }
    }
}

impl RedirectConfig {
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = timeout;
        self
    }

    /// Defaults overridden by `STDREDIRECT_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but with a custom variable source.
    /// Unparseable values are logged and ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_BUFFER_CAPACITY) {
            match raw.trim().parse::<usize>() {
                Ok(capacity) => config.buffer_capacity = capacity,
                Err(e) => tracing::warn!("Ignoring {}={:?}: {}", ENV_BUFFER_CAPACITY, raw, e),
            }
        }

        if let Some(raw) = lookup(ENV_TEARDOWN_TIMEOUT) {
            match humantime::parse_duration(raw.trim()) {
                Ok(timeout) => config.teardown_timeout = timeout,
                Err(e) => tracing::warn!("Ignoring {}={:?}: {}", ENV_TEARDOWN_TIMEOUT, raw, e),
            }
        }

        config
    }

    /// A chunk needs room for at least one byte and the terminator.
    pub fn validate(&self) -> Result<(), String> {
        if self.buffer_capacity < 2 {
            return Err(format!(
                "buffer capacity must be at least 2 bytes, got {}",
                self.buffer_capacity
            ));
        }
        Ok(())
    }

    /// Largest number of bytes delivered in a single chunk.
    pub fn chunk_limit(&self) -> usize {
        self.buffer_capacity.saturating_sub(1)
    }
}
