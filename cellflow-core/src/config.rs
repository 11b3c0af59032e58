//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Tunables for an [`Engine`](crate::reactive::Engine) and its event bridge.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Quiet period a control must observe before its latest value is
    /// released to the scheduler. `0` forwards every event immediately.
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,

    /// Treat an injection equal to the current value as a no-op: the version
    /// is not bumped and nothing is scheduled.
    #[serde(default = "default_true")]
    pub skip_unchanged_injections: bool,

    /// Convert a panic inside a cell body into a cell failure instead of
    /// unwinding through the scheduler.
    #[serde(default = "default_true")]
    pub catch_panics: bool,
}

impl EngineConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(text: &str) -> EngineResult<Self> {
        serde_json::from_str(text).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Builder-style debounce override. Saturates at `u64::MAX` milliseconds.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = u64::try_from(debounce.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// The debounce window as a [`Duration`].
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce(),
            skip_unchanged_injections: default_true(),
            catch_panics: default_true(),
        }
    }
}

fn default_debounce() -> u64 {
    0
}

fn default_true() -> bool {
    true
}
