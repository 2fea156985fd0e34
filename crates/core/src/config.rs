//! Engine configuration with construction-time validation.
//!
//! Loaded from TOML plus `PM_ARB_`-prefixed environment overrides via
//! figment. Validation failures are fatal at startup; nothing downstream
//! re-checks ranges at use time.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::CoreError;
use crate::types::ContractPair;

/// Minimum polling interval accepted, in milliseconds.
pub const MIN_POLLING_INTERVAL_MS: u64 = 1_000;
/// Maximum polling interval accepted, in milliseconds.
pub const MAX_POLLING_INTERVAL_MS: u64 = 300_000;

/// Configuration errors. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field is outside its valid range.
    #[error("config field {field} out of range: {detail}")]
    OutOfRange {
        /// Offending field name.
        field: &'static str,
        /// Human-readable detail.
        detail: String,
    },

    /// The contract-pair list is malformed.
    #[error("contract pair list invalid: {0}")]
    PairList(String),

    /// The config source could not be read or parsed.
    #[error("failed to load config: {0}")]
    Load(String),
}

impl From<ConfigError> for CoreError {
    fn from(err: ConfigError) -> Self {
        CoreError::ConfigValidation(err.to_string())
    }
}

/// NTP probe settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NtpConfig {
    /// Primary server, tried first.
    pub primary: String,
    /// Fallback server, tried after the primary is exhausted.
    pub fallback: String,
    /// Attempts per server.
    pub attempts: u32,
    /// Delay between attempts, in milliseconds.
    pub retry_delay_ms: u64,
}

impl Default for NtpConfig {
    fn default() -> Self {
        Self {
            primary: "pool.ntp.org".to_string(),
            fallback: "time.google.com".to_string(),
            attempts: 3,
            retry_delay_ms: 2_000,
        }
    }
}

/// Full engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Trading-cycle period in milliseconds.
    pub polling_interval_ms: u64,
    /// Total bankroll in USD.
    pub bankroll_usd: Decimal,
    /// Maximum position size as a fraction of bankroll.
    pub max_position_pct: Decimal,
    /// Maximum concurrently open pairs.
    pub max_open_pairs: u32,
    /// Daily loss limit as a fraction of bankroll.
    pub daily_loss_pct: Decimal,
    /// Minimum net edge required to act.
    pub min_edge_threshold: Decimal,
    /// Estimated gas per two-leg trade, in USD.
    pub gas_estimate_usd: Decimal,
    /// Notional position size over which gas is amortized, in USD.
    pub position_size_usd: Decimal,
    /// Edge-threshold multiplier applied while a venue is degraded.
    #[serde(default = "default_degraded_multiplier")]
    pub degraded_threshold_multiplier: Decimal,
    /// Verified contract pairs to watch.
    pub pairs: Vec<ContractPair>,
    /// NTP probe settings.
    #[serde(default)]
    pub ntp: NtpConfig,
    /// Postgres URL for the persistence collaborators, if any.
    #[serde(default)]
    pub database_url: Option<String>,
}

fn default_degraded_multiplier() -> Decimal {
    dec!(1.5)
}

impl EngineConfig {
    /// Loads configuration from a TOML file with `PM_ARB_` env overrides.
    ///
    /// # Errors
    /// Returns [`ConfigError`] on unreadable sources or failed validation.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("PM_ARB_"))
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every field against its contract range.
    ///
    /// # Errors
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_POLLING_INTERVAL_MS..=MAX_POLLING_INTERVAL_MS).contains(&self.polling_interval_ms)
        {
            return Err(ConfigError::OutOfRange {
                field: "polling_interval_ms",
                detail: format!(
                    "{} not in [{MIN_POLLING_INTERVAL_MS}, {MAX_POLLING_INTERVAL_MS}]",
                    self.polling_interval_ms
                ),
            });
        }
        if self.bankroll_usd <= Decimal::ZERO {
            return Err(ConfigError::OutOfRange {
                field: "bankroll_usd",
                detail: format!("{} must be positive", self.bankroll_usd),
            });
        }
        if self.max_position_pct <= Decimal::ZERO || self.max_position_pct > Decimal::ONE {
            return Err(ConfigError::OutOfRange {
                field: "max_position_pct",
                detail: format!("{} not in (0, 1]", self.max_position_pct),
            });
        }
        if self.max_open_pairs == 0 {
            return Err(ConfigError::OutOfRange {
                field: "max_open_pairs",
                detail: "must be a positive integer".to_string(),
            });
        }
        if self.daily_loss_pct <= Decimal::ZERO || self.daily_loss_pct > Decimal::ONE {
            return Err(ConfigError::OutOfRange {
                field: "daily_loss_pct",
                detail: format!("{} not in (0, 1]", self.daily_loss_pct),
            });
        }
        if self.min_edge_threshold < Decimal::ZERO {
            return Err(ConfigError::OutOfRange {
                field: "min_edge_threshold",
                detail: format!("{} must be non-negative", self.min_edge_threshold),
            });
        }
        if self.gas_estimate_usd < Decimal::ZERO {
            return Err(ConfigError::OutOfRange {
                field: "gas_estimate_usd",
                detail: format!("{} must be non-negative", self.gas_estimate_usd),
            });
        }
        if self.position_size_usd <= Decimal::ZERO {
            return Err(ConfigError::OutOfRange {
                field: "position_size_usd",
                detail: format!("{} must be positive", self.position_size_usd),
            });
        }
        if self.degraded_threshold_multiplier < Decimal::ONE {
            return Err(ConfigError::OutOfRange {
                field: "degraded_threshold_multiplier",
                detail: format!("{} must be at least 1", self.degraded_threshold_multiplier),
            });
        }
        ContractPair::validate_unique(&self.pairs)
            .map_err(|e| ConfigError::PairList(e.to_string()))?;
        Ok(())
    }
}
