//! Harness configuration

use crate::result::{HarnessError, HarnessResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default number of tests in flight
pub const DEFAULT_CONCURRENCY: usize = 6;
/// Default host-side wait for a completion message, in milliseconds
pub const DEFAULT_LOAD_TIMEOUT_MS: u64 = 5000;
/// Default worker-side execution timeout, in milliseconds
pub const DEFAULT_TEST_TIMEOUT_MS: u64 = 500;

/// How a launched test is separated from the coordinator and its siblings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// Own thread and single-threaded runtime; a panic in any task the test
    /// starts fails that test
    #[default]
    Thread,
    /// Task on the caller's runtime, sharing its clock. Only panics in work
    /// started through `Done::spawn` are attributed to the test.
    Task,
}

/// Scheduling and timeout settings for a suite run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Maximum tests in flight at once
    pub concurrency: usize,
    /// How long the coordinator waits for a launched test to report
    pub load_timeout_ms: u64,
    /// How long a worker lets test logic run before failing it
    pub test_timeout_ms: u64,
    /// Where launched tests run
    pub isolation: Isolation,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            load_timeout_ms: DEFAULT_LOAD_TIMEOUT_MS,
            test_timeout_ms: DEFAULT_TEST_TIMEOUT_MS,
            isolation: Isolation::Thread,
        }
    }
}

impl HarnessConfig {
    /// Create default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the in-flight budget
    #[must_use]
    pub const fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the host-side timeout
    #[must_use]
    pub const fn with_load_timeout_ms(mut self, ms: u64) -> Self {
        self.load_timeout_ms = ms;
        self
    }

    /// Set the worker-side timeout
    #[must_use]
    pub const fn with_test_timeout_ms(mut self, ms: u64) -> Self {
        self.test_timeout_ms = ms;
        self
    }

    /// Set where launched tests run
    #[must_use]
    pub const fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    /// Host-side timeout as a duration
    #[must_use]
    pub const fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    /// Worker-side timeout as a duration
    #[must_use]
    pub const fn test_timeout(&self) -> Duration {
        Duration::from_millis(self.test_timeout_ms)
    }

    /// Reject settings the scheduler cannot run with
    pub fn validate(&self) -> HarnessResult<()> {
        if self.concurrency == 0 {
            return Err(HarnessError::config("concurrency must be at least 1"));
        }
        if self.load_timeout_ms == 0 {
            return Err(HarnessError::config("load_timeout_ms must be positive"));
        }
        if self.test_timeout_ms == 0 {
            return Err(HarnessError::config("test_timeout_ms must be positive"));
        }
        Ok(())
    }

    /// Parse YAML and validate
    pub fn from_yaml(text: &str) -> HarnessResult<Self> {
        let config: Self = serde_yaml_ng::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse JSON and validate
    pub fn from_json(text: &str) -> HarnessResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.yaml`/`.yml` or `.json` file
    pub fn load(path: impl AsRef<Path>) -> HarnessResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => Self::from_yaml(&text),
            Some("json") => Self::from_json(&text),
            _ => Err(HarnessError::config(format!(
                "unsupported config format: {}",
                path.display()
            ))),
        }
    }
}
