//! Runtime configuration.
//!
//! Every section has serde defaults, so a config file only needs the keys it
//! changes:
//!
//! ```json
//! { "policies": { "rate_window_ms": 5000 }, "persistence": { "dir": "./state" } }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{Result, StewardError};
use crate::policies::RetryPolicy;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub effectors: EffectorConfig,
    pub policies: PolicyConfig,
    pub restart: RestartConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectorConfig {
    /// Applied when `InvokeOptions::timeout` is unset. `None` means no deadline.
    pub default_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub rate_window_ms: u64,
    pub rate_period_ms: u64,
    pub health_check_interval_ms: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            rate_window_ms: 30_000,
            rate_period_ms: 1_000,
            health_check_interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2_000,
            multiplier: 2.0,
        }
    }
}

impl RestartConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub dir: Option<PathBuf>,
}

impl RuntimeConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| StewardError::Persistence(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| StewardError::InvalidParameter(format!("config: {e}")))
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.effectors.default_timeout_ms.map(Duration::from_millis)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.policies.rate_window_ms)
    }

    pub fn rate_period(&self) -> Duration {
        Duration::from_millis(self.policies.rate_period_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.policies.health_check_interval_ms)
    }
}
