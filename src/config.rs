use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::error::{EntitlementError, Result};
use crate::jobs::JobsConfig;
use crate::utils::get_env_with_prefix;

/// Main configuration for the entitlement subsystem
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub plans: PlanConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_json")]
    pub json: bool,
}

/// Per-user sync coordinator settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncConfig {
    /// Quiet period a non-forced request waits before executing
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// How long a successful sync result is served without a provider call
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Capacity of each coordinator's command channel
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
    /// An idle coordinator shuts down after this long and is dropped from the registry
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

/// Plan mapping settings.
///
/// `price_plans` is consulted first. Amount tiers are the fallback for prices
/// that are not listed.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlanConfig {
    #[serde(default = "default_free_plan")]
    pub free_plan: String,
    #[serde(default = "default_tier_one_max_amount")]
    pub tier_one_max_amount: i64,
    #[serde(default = "default_tier_one_plan")]
    pub tier_one_plan: String,
    #[serde(default = "default_tier_two_max_amount")]
    pub tier_two_max_amount: i64,
    #[serde(default = "default_tier_two_plan")]
    pub tier_two_plan: String,
    #[serde(default = "default_highest_plan")]
    pub highest_plan: String,
    #[serde(default)]
    pub price_plans: HashMap<String, String>,
    /// Disable the amount fallback so unknown prices become configuration errors
    #[serde(default = "default_amount_tiers")]
    pub amount_tiers: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: default_json(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            cache_ttl_secs: default_cache_ttl_secs(),
            command_buffer: default_command_buffer(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = get_env_with_prefix("SYNC_DEBOUNCE_MS") {
            if let Ok(ms) = ms.parse() {
                config.debounce_ms = ms;
            }
        }
        if let Some(secs) = get_env_with_prefix("SYNC_CACHE_TTL_SECS") {
            if let Ok(secs) = secs.parse() {
                config.cache_ttl_secs = secs;
            }
        }
        if let Some(buffer) = get_env_with_prefix("SYNC_COMMAND_BUFFER") {
            if let Ok(buffer) = buffer.parse() {
                config.command_buffer = buffer;
            }
        }
        if let Some(secs) = get_env_with_prefix("SYNC_IDLE_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse() {
                config.idle_timeout_secs = secs;
            }
        }
        config
    }
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            free_plan: default_free_plan(),
            tier_one_max_amount: default_tier_one_max_amount(),
            tier_one_plan: default_tier_one_plan(),
            tier_two_max_amount: default_tier_two_max_amount(),
            tier_two_plan: default_tier_two_plan(),
            highest_plan: default_highest_plan(),
            price_plans: HashMap::new(),
            amount_tiers: default_amount_tiers(),
        }
    }
}

impl PlanConfig {
    /// Load plan mapping from the environment.
    ///
    /// `PLAN_PRICES` takes a comma separated list of `price_id=plan_slug` pairs.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(free) = get_env_with_prefix("FREE_PLAN") {
            config.free_plan = free;
        }
        if let Some(amount) = get_env_with_prefix("PLAN_TIER_ONE_MAX_AMOUNT") {
            if let Ok(amount) = amount.parse() {
                config.tier_one_max_amount = amount;
            }
        }
        if let Some(plan) = get_env_with_prefix("PLAN_TIER_ONE") {
            config.tier_one_plan = plan;
        }
        if let Some(amount) = get_env_with_prefix("PLAN_TIER_TWO_MAX_AMOUNT") {
            if let Ok(amount) = amount.parse() {
                config.tier_two_max_amount = amount;
            }
        }
        if let Some(plan) = get_env_with_prefix("PLAN_TIER_TWO") {
            config.tier_two_plan = plan;
        }
        if let Some(plan) = get_env_with_prefix("PLAN_HIGHEST") {
            config.highest_plan = plan;
        }
        if let Some(prices) = get_env_with_prefix("PLAN_PRICES") {
            config.price_plans = parse_price_plans(&prices);
        }
        if let Some(enabled) = get_env_with_prefix("PLAN_AMOUNT_TIERS") {
            config.amount_tiers = enabled.parse().unwrap_or(true);
        }
        config
    }
}

fn parse_price_plans(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (price, plan) = pair.split_once('=')?;
            let (price, plan) = (price.trim(), plan.trim());
            if price.is_empty() || plan.is_empty() {
                return None;
            }
            Some((price.to_string(), plan.to_string()))
        })
        .collect()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_json() -> bool {
    false
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_cache_ttl_secs() -> u64 {
    30
}

fn default_command_buffer() -> usize {
    32
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_free_plan() -> String {
    "free".to_string()
}

fn default_tier_one_max_amount() -> i64 {
    6900
}

fn default_tier_one_plan() -> String {
    "gestao".to_string()
}

fn default_tier_two_max_amount() -> i64 {
    24900
}

fn default_tier_two_plan() -> String {
    "psi_regular".to_string()
}

fn default_highest_plan() -> String {
    "psi_regular".to_string()
}

fn default_amount_tiers() -> bool {
    true
}

/// Builder for Config with environment variable support
#[must_use = "builder does nothing until you call build()"]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn with_json_logging(mut self, enabled: bool) -> Self {
        self.config.logging.json = enabled;
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.config.sync = sync;
        self
    }

    pub fn with_plans(mut self, plans: PlanConfig) -> Self {
        self.config.plans = plans;
        self
    }

    pub fn with_jobs(mut self, jobs: JobsConfig) -> Self {
        self.config.jobs = jobs;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    /// Load configuration from environment variables with PLANSYNC_ prefix
    pub fn from_env(mut self) -> Self {
        if let Some(level) = get_env_with_prefix("LOG_LEVEL") {
            self.config.logging.level = level;
        }
        if let Some(json) = get_env_with_prefix("LOG_JSON") {
            self.config.logging.json = json.parse().unwrap_or(false);
        }

        self.config.sync = SyncConfig::from_env();
        self.config.plans = PlanConfig::from_env();
        self.config.jobs = JobsConfig::from_env();
        self.config.cache = CacheConfig::from_env();

        self
    }

    /// Build the configuration, validating all settings
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid log level, a zero cache
    /// TTL, unordered amount tiers or zero job intervals.
    pub fn build(self) -> Result<Config> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.config.logging.level.to_lowercase().as_str()) {
            return Err(EntitlementError::configuration(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.config.logging.level,
                valid_log_levels.join(", ")
            )));
        }

        if self.config.sync.cache_ttl_secs == 0 {
            return Err(EntitlementError::configuration(
                "Sync cache TTL must be greater than 0",
            ));
        }

        if self.config.sync.command_buffer == 0 {
            return Err(EntitlementError::configuration(
                "Sync command buffer must be greater than 0",
            ));
        }

        if self.config.sync.idle_timeout_secs < self.config.sync.cache_ttl_secs {
            return Err(EntitlementError::configuration(
                "Sync idle timeout must not be shorter than the sync cache TTL",
            ));
        }

        let plans = &self.config.plans;
        if plans.free_plan.is_empty() {
            return Err(EntitlementError::configuration("Free plan slug must not be empty"));
        }
        if plans.amount_tiers && plans.tier_one_max_amount >= plans.tier_two_max_amount {
            return Err(EntitlementError::configuration(format!(
                "Tier one threshold ({}) must be below tier two threshold ({})",
                plans.tier_one_max_amount, plans.tier_two_max_amount
            )));
        }

        if self.config.jobs.enabled
            && (self.config.jobs.sweep_interval_secs == 0
                || self.config.jobs.override_expiry_interval_secs == 0)
        {
            return Err(EntitlementError::configuration(
                "Job intervals must be greater than 0 when jobs are enabled",
            ));
        }

        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
