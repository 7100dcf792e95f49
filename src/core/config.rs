//! # Configuration
//!
//! Environment-driven process configuration with an optional YAML file that
//! overrides the governance tunables.
//!
//! - **Version**: 1.1.0
//! - **Since**: 1.0.0
//!
//! ## Changelog
//! - 1.1.0: YAML overrides via `GOVERNANCE_CONFIG_PATH`
//! - 1.0.0: Initial environment loading

use crate::features::dedup::DedupConfig;
use crate::features::rate_limiting::GovernorConfig;
use crate::features::tenant_queue::TenantQueueConfig;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Default Discord REST base URL
pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

#[derive(Debug, Clone)]
pub struct Config {
    pub discord_token: String,
    pub api_base_url: String,
    pub log_level: String,
    pub governor: GovernorConfig,
    pub tenant_queue: TenantQueueConfig,
    pub dedup: DedupConfig,
    /// JSON-lines audit file; in-memory audit store when unset
    pub audit_log_path: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let discord_token = std::env::var("DISCORD_TOKEN")
            .map_err(|_| anyhow!("DISCORD_TOKEN environment variable not set"))?;

        let mut governor = GovernorConfig::default();
        if let Some(max) = env_parse::<u32>("GOVERNOR_MAX_REQUESTS")? {
            governor.max_requests_per_window = max;
        }
        if let Some(ms) = env_parse::<u64>("GOVERNOR_WINDOW_MS")? {
            governor.window = Duration::from_millis(ms);
        }
        governor.max_rate_limit_retries = env_parse::<u32>("GOVERNOR_MAX_RETRIES")?;

        let mut tenant_queue = TenantQueueConfig::default();
        if let Some(ms) = env_parse::<u64>("TENANT_PACING_MS")? {
            tenant_queue.pacing = Duration::from_millis(ms);
        }

        let mut dedup = DedupConfig::default();
        if let Some(ms) = env_parse::<u64>("DEDUP_WINDOW_MS")? {
            dedup.default_window = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("DEDUP_SWEEP_INTERVAL_MS")? {
            dedup.sweep_interval = Duration::from_millis(ms);
        }

        let mut config = Config {
            discord_token,
            api_base_url: std::env::var("DISCORD_API_BASE")
                .unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            governor,
            tenant_queue,
            dedup,
            audit_log_path: std::env::var("AUDIT_LOG_PATH").ok().filter(|p| !p.is_empty()),
        };

        if let Ok(path) = std::env::var("GOVERNANCE_CONFIG_PATH") {
            let overrides = GovernanceOverrides::load(&path)?;
            config.apply(&overrides);
        }

        config.validate()?;
        Ok(config)
    }

    /// Apply file overrides on top of environment values
    pub fn apply(&mut self, overrides: &GovernanceOverrides) {
        if let Some(max) = overrides.max_requests_per_window {
            self.governor.max_requests_per_window = max;
        }
        if let Some(ms) = overrides.window_ms {
            self.governor.window = Duration::from_millis(ms);
        }
        if overrides.max_rate_limit_retries.is_some() {
            self.governor.max_rate_limit_retries = overrides.max_rate_limit_retries;
        }
        if let Some(ms) = overrides.tenant_pacing_ms {
            self.tenant_queue.pacing = Duration::from_millis(ms);
        }
        if let Some(ms) = overrides.dedup_window_ms {
            self.dedup.default_window = Duration::from_millis(ms);
        }
        if let Some(ms) = overrides.dedup_sweep_interval_ms {
            self.dedup.sweep_interval = Duration::from_millis(ms);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.governor.max_requests_per_window == 0 {
            return Err(anyhow!("governor budget must allow at least one request per window"));
        }
        if self.governor.window.is_zero() {
            return Err(anyhow!("governor window must be non-zero"));
        }
        if self.dedup.sweep_interval.is_zero() {
            return Err(anyhow!("dedup sweep interval must be non-zero"));
        }
        Ok(())
    }
}

/// Governance tunables read from a YAML file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GovernanceOverrides {
    #[serde(default)]
    pub max_requests_per_window: Option<u32>,

    #[serde(default)]
    pub window_ms: Option<u64>,

    #[serde(default)]
    pub max_rate_limit_retries: Option<u32>,

    #[serde(default)]
    pub tenant_pacing_ms: Option<u64>,

    #[serde(default)]
    pub dedup_window_ms: Option<u64>,

    #[serde(default)]
    pub dedup_sweep_interval_ms: Option<u64>,
}

impl GovernanceOverrides {
    pub fn load(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read governance config {path}"))?;
        let overrides: GovernanceOverrides = serde_yaml::from_str(&contents)
            .with_context(|| format!("invalid governance config {path}"))?;
        Ok(overrides)
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("invalid value for {key}: {e}")),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            discord_token: "token".to_string(),
            api_base_url: DEFAULT_API_BASE.to_string(),
            log_level: "info".to_string(),
            governor: GovernorConfig::default(),
            tenant_queue: TenantQueueConfig::default(),
            dedup: DedupConfig::default(),
            audit_log_path: None,
        }
    }

    #[test]
    fn test_defaults_match_contract() {
        let config = base_config();
        assert_eq!(config.governor.max_requests_per_window, 50);
        assert_eq!(config.governor.window, Duration::from_secs(1));
        assert_eq!(config.governor.max_rate_limit_retries, None);
        assert_eq!(config.tenant_queue.pacing, Duration::from_millis(100));
        assert_eq!(config.dedup.default_window, Duration::from_millis(2000));
        assert_eq!(config.dedup.sweep_interval, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_overrides() {
        let yaml = r#"
max_requests_per_window: 40
window_ms: 2000
max_rate_limit_retries: 5
tenant_pacing_ms: 250
"#;
        let overrides: GovernanceOverrides = serde_yaml::from_str(yaml).unwrap();
        let mut config = base_config();
        config.apply(&overrides);

        assert_eq!(config.governor.max_requests_per_window, 40);
        assert_eq!(config.governor.window, Duration::from_secs(2));
        assert_eq!(config.governor.max_rate_limit_retries, Some(5));
        assert_eq!(config.tenant_queue.pacing, Duration::from_millis(250));
        // untouched values keep their defaults
        assert_eq!(config.dedup.default_window, Duration::from_millis(2000));
    }

    #[test]
    fn test_empty_overrides_change_nothing() {
        let overrides: GovernanceOverrides = serde_yaml::from_str("{}").unwrap();
        let mut config = base_config();
        config.apply(&overrides);
        assert_eq!(config.governor.max_requests_per_window, 50);
        assert_eq!(config.governor.max_rate_limit_retries, None);
    }

    #[test]
    fn test_validate_rejects_zero_budget() {
        let mut config = base_config();
        config.governor.max_requests_per_window = 0;
        assert!(config.validate().is_err());
    }
}
