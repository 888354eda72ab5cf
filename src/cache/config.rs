use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::{InMemoryCache, NoOpCache};
use crate::traits::cache::Cache;
use crate::utils::get_env_with_prefix;

/// Cache backend type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    InMemory,
    /// Disable read caching
    NoOp,
}

/// Entitlement read cache configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,

    /// Default TTL for cached entitlement reads (in seconds)
    #[serde(default = "default_ttl_seconds")]
    pub default_ttl_seconds: u64,

    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            default_ttl_seconds: default_ttl_seconds(),
            max_entries: default_max_entries(),
        }
    }
}

impl CacheConfig {
    /// Load cache configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(backend) = get_env_with_prefix("CACHE_BACKEND") {
            config.backend = match backend.to_lowercase().as_str() {
                "noop" => CacheBackend::NoOp,
                _ => CacheBackend::InMemory,
            };
        }

        if let Some(ttl) = get_env_with_prefix("CACHE_DEFAULT_TTL_SECONDS") {
            if let Ok(seconds) = ttl.parse() {
                config.default_ttl_seconds = seconds;
            }
        }

        if let Some(max) = get_env_with_prefix("CACHE_MAX_ENTRIES") {
            if let Ok(entries) = max.parse() {
                config.max_entries = entries;
            }
        }

        config
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_seconds)
    }

    /// Build the configured backend
    pub fn build(&self) -> Arc<dyn Cache> {
        match self.backend {
            CacheBackend::InMemory => Arc::new(InMemoryCache::with_default_ttl(
                self.max_entries,
                self.default_ttl(),
            )),
            CacheBackend::NoOp => Arc::new(NoOpCache),
        }
    }
}

fn default_ttl_seconds() -> u64 {
    30
}

fn default_max_entries() -> u64 {
    10_000
}
