//! Configuration management for Tollgate.
//!
//! Tiers can be written either with an explicit bucket shape:
//!
//! ```yaml
//! tiers:
//!   - name: burst
//!     capacity: 20
//!     refill_rate_per_second: 5
//! ```
//!
//! or in Envoy's `requests_per_unit` style, which becomes a bucket holding
//! `requests_per_unit` tokens that refills completely over one unit:
//!
//! ```yaml
//! tiers:
//!   - name: per-minute
//!     requests_per_unit: 100
//!     unit: minute
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::quota::QuotaSettings;
use crate::ratelimit::TierSettings;

/// Prefix for environment variable overrides, e.g. `TOLLGATE__TOKENS__TTL_MS`.
const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for Tollgate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Rate limit tiers, all of which must admit a request
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierConfig>,

    /// Long-window quota
    #[serde(default)]
    pub quota: QuotaConfig,

    /// Proof token settings
    #[serde(default)]
    pub tokens: TokenConfig,

    /// Bucket store maintenance settings
    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for TollgateConfig {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
            quota: QuotaConfig::default(),
            tokens: TokenConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

fn default_tiers() -> Vec<TierConfig> {
    vec![
        TierConfig::per_unit("per-second", 10, TimeUnit::Second),
        TierConfig::per_unit("per-minute", 100, TimeUnit::Minute),
        TierConfig::per_unit("per-hour", 1000, TimeUnit::Hour),
    ]
}

/// Time unit for per-unit tiers (matches Envoy's configuration format).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of this time unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// Configuration for one rate limit tier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierConfig {
    /// Tier name, unique within the configuration
    pub name: String,

    /// Maximum tokens held (explicit style)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<f64>,

    /// Tokens added per second (explicit style)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refill_rate_per_second: Option<f64>,

    /// Requests allowed per unit (Envoy style)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_unit: Option<u64>,

    /// The time unit (Envoy style)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<TimeUnit>,
}

impl TierConfig {
    /// An explicit-style tier.
    pub fn explicit(name: &str, capacity: f64, refill_rate_per_second: f64) -> Self {
        Self {
            name: name.to_string(),
            capacity: Some(capacity),
            refill_rate_per_second: Some(refill_rate_per_second),
            ..Default::default()
        }
    }

    /// An Envoy-style tier.
    pub fn per_unit(name: &str, requests_per_unit: u64, unit: TimeUnit) -> Self {
        Self {
            name: name.to_string(),
            requests_per_unit: Some(requests_per_unit),
            unit: Some(unit),
            ..Default::default()
        }
    }

    /// Resolve and validate this tier.
    pub fn to_settings(&self) -> Result<TierSettings> {
        match (
            self.capacity,
            self.refill_rate_per_second,
            self.requests_per_unit,
            self.unit,
        ) {
            (Some(capacity), Some(rate), None, None) => TierSettings::new(&self.name, capacity, rate),
            (None, None, Some(requests), Some(unit)) => {
                TierSettings::per_window(&self.name, requests, unit.duration())
            }
            _ => Err(TollgateError::InvalidConfiguration(format!(
                "tier '{}' must set either capacity and refill_rate_per_second, or requests_per_unit and unit",
                self.name
            ))),
        }
    }
}

/// Quota configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Units allowed per period
    pub units_limit: u64,

    /// Period length in seconds
    pub period_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            units_limit: 100_000,
            period_secs: 30 * 86400,
        }
    }
}

impl QuotaConfig {
    /// Resolve and validate the quota.
    pub fn to_settings(&self) -> Result<QuotaSettings> {
        QuotaSettings::new(self.units_limit, Duration::from_secs(self.period_secs))
    }
}

/// Proof token configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// How long an issued token stays valid, in milliseconds
    #[serde(default = "default_token_ttl")]
    pub ttl_ms: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_token_ttl(),
        }
    }
}

impl TokenConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

fn default_token_ttl() -> u64 {
    1000
}

/// Bucket store maintenance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// How often idle buckets are evicted, in seconds
    #[serde(default = "default_eviction_interval")]
    pub eviction_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            eviction_interval_secs: default_eviction_interval(),
        }
    }
}

impl StoreConfig {
    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }
}

fn default_eviction_interval() -> u64 {
    60
}

impl TollgateConfig {
    /// Load configuration from a file, with `TOLLGATE__*` environment
    /// variables taking precedence over file values.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        ::config::Config::builder()
            .add_source(::config::File::from(path))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| TollgateError::Config(format!("Failed to load {}: {}", path.display(), e)))
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Resolve and validate every tier.
    pub fn tier_settings(&self) -> Result<Vec<TierSettings>> {
        self.tiers.iter().map(TierConfig::to_settings).collect()
    }

    /// Resolve and validate the quota.
    pub fn quota_settings(&self) -> Result<QuotaSettings> {
        self.quota.to_settings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TollgateConfig::default();
        let tiers = config.tier_settings().unwrap();

        assert_eq!(tiers.len(), 3);
        assert_eq!(tiers[0].name(), "per-second");
        assert_eq!(tiers[1].bucket().capacity(), 100.0);
        assert_eq!(tiers[2].bucket().refill_rate_per_second(), 1000.0 / 3600.0);

        let quota = config.quota_settings().unwrap();
        assert_eq!(quota.units_limit(), 100_000);
        assert_eq!(quota.period(), Duration::from_secs(30 * 86400));
        assert_eq!(config.tokens.ttl(), Duration::from_secs(1));
    }

    #[test]
    fn test_parse_mixed_tier_styles() {
        let yaml = r#"
tiers:
  - name: burst
    capacity: 20
    refill_rate_per_second: 0.5
  - name: per-minute
    requests_per_unit: 120
    unit: minute
quota:
  units_limit: 5000
  period_secs: 86400
tokens:
  ttl_ms: 250
"#;
        let config = TollgateConfig::from_yaml(yaml).unwrap();
        let tiers = config.tier_settings().unwrap();

        assert_eq!(tiers[0].bucket().capacity(), 20.0);
        assert_eq!(tiers[0].bucket().refill_rate_per_second(), 0.5);
        assert_eq!(tiers[1].bucket().capacity(), 120.0);
        assert_eq!(tiers[1].bucket().refill_rate_per_second(), 2.0);

        let quota = config.quota_settings().unwrap();
        assert_eq!(quota.units_limit(), 5000);
        assert_eq!(config.tokens.ttl(), Duration::from_millis(250));
        assert_eq!(config.store.eviction_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let yaml = r#"
tiers:
  - name: only
    capacity: 1
    refill_rate_per_second: 1
"#;
        let config = TollgateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.tiers.len(), 1);
        assert_eq!(config.quota.units_limit, 100_000);
        assert_eq!(config.tokens.ttl_ms, 1000);

        let empty = TollgateConfig::from_yaml("{}").unwrap();
        assert_eq!(empty.tiers.len(), 3);
    }

    #[test]
    fn test_tier_must_pick_one_style() {
        let mixed = TierConfig {
            name: "confused".to_string(),
            capacity: Some(10.0),
            refill_rate_per_second: Some(1.0),
            requests_per_unit: Some(10),
            unit: Some(TimeUnit::Second),
        };
        assert!(matches!(mixed.to_settings(), Err(TollgateError::InvalidConfiguration(_))));

        let incomplete = TierConfig {
            name: "incomplete".to_string(),
            capacity: Some(10.0),
            ..Default::default()
        };
        assert!(incomplete.to_settings().is_err());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(TierConfig::explicit("zero", 0.0, 1.0).to_settings().is_err());
        assert!(TierConfig::explicit("negative", 5.0, -1.0).to_settings().is_err());
        assert!(TierConfig::per_unit("empty", 0, TimeUnit::Hour).to_settings().is_err());

        let quota = QuotaConfig {
            units_limit: 10,
            period_secs: 0,
        };
        assert!(quota.to_settings().is_err());
    }

    #[test]
    fn test_malformed_yaml_is_config_error() {
        let result = TollgateConfig::from_yaml("tiers: [not, a, tier");
        assert!(matches!(result, Err(TollgateError::Config(_))));
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("tollgate-test-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "tiers:\n  - name: per-second\n    requests_per_unit: 5\n    unit: second\ntokens:\n  ttl_ms: 40\n",
        )
        .unwrap();

        let config = TollgateConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.tiers.len(), 1);
        assert_eq!(config.tier_settings().unwrap()[0].bucket().capacity(), 5.0);
        assert_eq!(config.tokens.ttl_ms, 40);
        assert_eq!(config.quota.period_secs, 30 * 86400);
    }

    #[test]
    fn test_time_unit_duration() {
        assert_eq!(TimeUnit::Second.duration(), Duration::from_secs(1));
        assert_eq!(TimeUnit::Minute.duration(), Duration::from_secs(60));
        assert_eq!(TimeUnit::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(TimeUnit::Day.duration(), Duration::from_secs(86400));
    }
}
