//! Configuration for scheduled reconciliation jobs

use crate::utils::get_env_with_prefix;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the job scheduler
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobsConfig {
    /// Run jobs on their interval. When false they only run on demand.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Seconds between reconciliation sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Seconds between override expiry runs
    #[serde(default = "default_override_expiry_interval_secs")]
    pub override_expiry_interval_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            sweep_interval_secs: default_sweep_interval_secs(),
            override_expiry_interval_secs: default_override_expiry_interval_secs(),
        }
    }
}

impl JobsConfig {
    /// Load jobs configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(enabled) = get_env_with_prefix("JOBS_ENABLED") {
            config.enabled = enabled.parse().unwrap_or(false);
        }

        if let Some(secs) = get_env_with_prefix("JOBS_SWEEP_INTERVAL_SECS") {
            if let Ok(s) = secs.parse() {
                config.sweep_interval_secs = s;
            }
        }

        if let Some(secs) = get_env_with_prefix("JOBS_OVERRIDE_EXPIRY_INTERVAL_SECS") {
            if let Ok(s) = secs.parse() {
                config.override_expiry_interval_secs = s;
            }
        }

        config
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn override_expiry_interval(&self) -> Duration {
        Duration::from_secs(self.override_expiry_interval_secs)
    }
}

fn default_enabled() -> bool {
    false
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

fn default_override_expiry_interval_secs() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = JobsConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.sweep_interval(), Duration::from_secs(3600));
        assert_eq!(config.override_expiry_interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: JobsConfig = serde_json::from_str(r#"{"enabled": true}"#).unwrap();
        assert!(config.enabled);
        assert_eq!(config.sweep_interval_secs, 3600);
    }
}
