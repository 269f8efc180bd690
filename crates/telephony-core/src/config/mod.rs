//! Configuration for telephony-core
//!
//! Loaded with the `config` crate: an optional TOML file layered under
//! `DIALTONE__`-prefixed environment variables, e.g.
//! `DIALTONE__BILLING__RATE_PER_MINUTE=700`.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use dialtone_infra_common::RetryPolicy;

use crate::error::{Result, TelephonyError};
use crate::types::{Money, TenantId};

/// Main configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelephonyConfig {
    pub database_url: String,
    pub api_bind_address: String,
    pub billing: BillingConfig,
    pub carrier: CarrierConfig,
    pub reconcile: ReconcileConfig,
    pub dispatch: DispatchConfig,
    pub history: HistoryConfig,
    pub auth: AuthConfig,
    pub logging: LogSettings,
}

/// Whose balance a call is charged against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceScope {
    Tenant,
    Number,
}

/// Tariff and balance policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    /// Price of one billed minute, in minor units
    pub rate_per_minute: Money,
    /// Free minutes granted when an account is first opened
    pub free_minutes: i64,
    /// Lowest funds value checked debits may reach
    pub balance_floor: Money,
    /// Let metering push funds below the floor (post-paid overage)
    pub allow_overage: bool,
    pub scope: BalanceScope,
}

/// Carrier API client settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CarrierConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
}

/// Background reconciliation of transient number states
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

/// Notification delivery settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub attempt_timeout_ms: u64,
    pub total_budget_ms: u64,
    pub telegram_api_base: String,
    pub vk_api_base: String,
    pub vk_api_version: String,
    pub sms_gateway_url: String,
    pub sms_api_key: Option<String>,
}

/// Call history query settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// IANA timezone used when a tenant has none configured
    pub default_timezone: String,
    pub default_limit: u32,
    pub max_limit: u32,
}

/// Request-scoped credentials
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Bearer token -> tenant id
    pub tokens: HashMap<String, TenantId>,
    /// Shared secret the carrier sends in `X-Webhook-Secret`
    pub webhook_secret: Option<String>,
}

/// Logging settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub json: bool,
}

impl TelephonyConfig {
    /// Load from an optional TOML file plus `DIALTONE__*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: TelephonyConfig = builder
            .add_source(
                config::Environment::with_prefix("DIALTONE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment only
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    pub fn validate(&self) -> Result<()> {
        if self.billing.rate_per_minute <= 0 {
            return Err(TelephonyError::Config(
                "billing.rate_per_minute must be greater than 0".into(),
            ));
        }
        if self.billing.free_minutes < 0 {
            return Err(TelephonyError::Config(
                "billing.free_minutes must not be negative".into(),
            ));
        }
        if self.carrier.timeout_ms == 0 {
            return Err(TelephonyError::Config(
                "carrier.timeout_ms must be greater than 0".into(),
            ));
        }
        if self.dispatch.max_attempts == 0 || self.dispatch.attempt_timeout_ms == 0 {
            return Err(TelephonyError::Config(
                "dispatch.max_attempts and dispatch.attempt_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.history.default_limit == 0 || self.history.default_limit > self.history.max_limit {
            return Err(TelephonyError::Config(
                "history.default_limit must be within 1..=history.max_limit".into(),
            ));
        }
        self.history
            .default_timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| {
                TelephonyError::Config(format!(
                    "unknown timezone '{}'",
                    self.history.default_timezone
                ))
            })?;
        Ok(())
    }
}

impl DispatchConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            attempt_timeout: Duration::from_millis(self.attempt_timeout_ms),
            total_budget: Duration::from_millis(self.total_budget_ms),
            jitter: true,
        }
    }
}

impl CarrierConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for TelephonyConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            api_bind_address: "127.0.0.1:8085".to_string(),
            billing: BillingConfig::default(),
            carrier: CarrierConfig::default(),
            reconcile: ReconcileConfig::default(),
            dispatch: DispatchConfig::default(),
            history: HistoryConfig::default(),
            auth: AuthConfig::default(),
            logging: LogSettings::default(),
        }
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            rate_per_minute: 500,
            free_minutes: 10,
            balance_floor: 0,
            allow_overage: true,
            scope: BalanceScope::Tenant,
        }
    }
}

impl Default for CarrierConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9090".to_string(),
            api_key: None,
            timeout_ms: 5000,
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 2000,
            attempt_timeout_ms: 3000,
            total_budget_ms: 10_000,
            telegram_api_base: "https://api.telegram.org".to_string(),
            vk_api_base: "https://api.vk.com/method".to_string(),
            vk_api_version: "5.199".to_string(),
            sms_gateway_url: "http://127.0.0.1:9191/send".to_string(),
            sms_api_key: None,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            default_timezone: "Europe/Moscow".to_string(),
            default_limit: 20,
            max_limit: 100,
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
