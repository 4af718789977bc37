//! Layered, env-driven configuration. Deserialized from a TOML file via `serde` + `toml`, then
//! overridden field-by-field from environment variables, and validated once before the `System`
//! is built. A failed validation is a fatal configuration error (exit code 2).

use crate::money::Currency;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf, str::FromStr};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub starting_capital: String,
    pub starting_capital_currency: String,
    /// Never defaults to `false` implicitly: every config file must say so explicitly.
    pub paper_trading: bool,
    pub loss_threshold_percent: String,
    pub reconcile_interval_seconds: u64,
    pub reconcile_tolerance_percent: String,
    pub reconcile_fail_limit: u32,
    pub event_bus_max_queue_size: usize,
    pub symbol_lock_timeout_ms: u64,
    pub submit_timeout_ms: u64,
    pub fetch_poll_interval_ms: u64,
    pub fetch_poll_deadline_ms: u64,
    pub circuit_breaker_cooldown_seconds: i64,
    pub wal_dir: PathBuf,
    pub persistence_path: PathBuf,
    pub circuit_breaker_state_path: PathBuf,
    /// Opaque per-venue credentials, unexamined by the core and handed through to whichever
    /// exchange adapter is selected.
    #[serde(default)]
    pub venue_credentials: HashMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid environment override for {field}: {value}")]
    InvalidEnvOverride { field: &'static str, value: String },
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl GatewayConfig {
    /// Load from `path`, then apply `GATEWAY_*` environment variable overrides, then validate.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let mut config: Self =
            toml::from_str(&contents).map_err(|source| ConfigError::Parse { path, source })?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Override individual fields from `GATEWAY_<FIELD_NAME>` environment variables.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(value) = std::env::var("GATEWAY_PAPER_TRADING") {
            self.paper_trading = parse_env("paper_trading", &value)?;
        }
        if let Ok(value) = std::env::var("GATEWAY_LOSS_THRESHOLD_PERCENT") {
            self.loss_threshold_percent = value;
        }
        if let Ok(value) = std::env::var("GATEWAY_RECONCILE_INTERVAL_SECONDS") {
            self.reconcile_interval_seconds = parse_env("reconcile_interval_seconds", &value)?;
        }
        if let Ok(value) = std::env::var("GATEWAY_RECONCILE_FAIL_LIMIT") {
            self.reconcile_fail_limit = parse_env("reconcile_fail_limit", &value)?;
        }
        if let Ok(value) = std::env::var("GATEWAY_SYMBOL_LOCK_TIMEOUT_MS") {
            self.symbol_lock_timeout_ms = parse_env("symbol_lock_timeout_ms", &value)?;
        }
        if let Ok(value) = std::env::var("GATEWAY_SUBMIT_TIMEOUT_MS") {
            self.submit_timeout_ms = parse_env("submit_timeout_ms", &value)?;
        }
        if let Ok(value) = std::env::var("GATEWAY_WAL_DIR") {
            self.wal_dir = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("GATEWAY_PERSISTENCE_PATH") {
            self.persistence_path = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("GATEWAY_CIRCUIT_BREAKER_STATE_PATH") {
            self.circuit_breaker_state_path = PathBuf::from(value);
        }
        Ok(())
    }

    /// Fatal on failure: configuration errors exit 2.
    fn validate(&self) -> Result<(), ConfigError> {
        let loss_threshold = Decimal::from_str(&self.loss_threshold_percent).map_err(|_| {
            ConfigError::Invalid {
                field: "loss_threshold_percent",
                reason: "not a decimal".into(),
            }
        })?;
        if loss_threshold <= Decimal::ZERO || loss_threshold >= Decimal::ONE {
            return Err(ConfigError::Invalid {
                field: "loss_threshold_percent",
                reason: "must be in (0, 1)".into(),
            });
        }

        let tolerance = Decimal::from_str(&self.reconcile_tolerance_percent).map_err(|_| {
            ConfigError::Invalid {
                field: "reconcile_tolerance_percent",
                reason: "not a decimal".into(),
            }
        })?;
        if tolerance < Decimal::ZERO {
            return Err(ConfigError::Invalid {
                field: "reconcile_tolerance_percent",
                reason: "must be non-negative".into(),
            });
        }

        Decimal::from_str(&self.starting_capital).map_err(|_| ConfigError::Invalid {
            field: "starting_capital",
            reason: "not a decimal".into(),
        })?;

        if self.reconcile_fail_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "reconcile_fail_limit",
                reason: "must be at least 1".into(),
            });
        }

        if self.event_bus_max_queue_size == 0 {
            return Err(ConfigError::Invalid {
                field: "event_bus_max_queue_size",
                reason: "must be at least 1".into(),
            });
        }

        Ok(())
    }

    pub fn starting_capital_decimal(&self) -> Decimal {
        Decimal::from_str(&self.starting_capital).expect("validated at load time")
    }

    pub fn starting_capital_currency(&self) -> Currency {
        Currency::new(self.starting_capital_currency.as_str())
    }

    pub fn loss_threshold_decimal(&self) -> Decimal {
        Decimal::from_str(&self.loss_threshold_percent).expect("validated at load time")
    }

    pub fn reconcile_tolerance_decimal(&self) -> Decimal {
        Decimal::from_str(&self.reconcile_tolerance_percent).expect("validated at load time")
    }
}

fn parse_env<T: FromStr>(field: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidEnvOverride {
            field,
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(label: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("gateway_config_test_{label}_{}.toml", std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn sample_toml() -> &'static str {
        r#"
            starting_capital = "10000"
            starting_capital_currency = "usdt"
            paper_trading = true
            loss_threshold_percent = "0.1"
            reconcile_interval_seconds = 30
            reconcile_tolerance_percent = "0.01"
            reconcile_fail_limit = 3
            event_bus_max_queue_size = 1024
            symbol_lock_timeout_ms = 500
            submit_timeout_ms = 5000
            fetch_poll_interval_ms = 200
            fetch_poll_deadline_ms = 30000
            circuit_breaker_cooldown_seconds = 300
            wal_dir = "/tmp/gateway/wal"
            persistence_path = "/tmp/gateway/orders.jsonl"
            circuit_breaker_state_path = "/tmp/gateway/breaker.json"
        "#
    }

    #[test]
    fn loads_and_validates_a_well_formed_config() {
        let path = write_config("ok", sample_toml());
        let config = GatewayConfig::load(&path).unwrap();
        assert!(config.paper_trading);
        assert_eq!(config.starting_capital_decimal().to_string(), "10000");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn rejects_loss_threshold_out_of_range() {
        let bad = sample_toml().replace("loss_threshold_percent = \"0.1\"", "loss_threshold_percent = \"1.5\"");
        let path = write_config("bad_threshold", &bad);
        let err = GatewayConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "loss_threshold_percent", .. }));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn env_override_takes_precedence_over_file() {
        let path = write_config("env", sample_toml());
        unsafe {
            std::env::set_var("GATEWAY_RECONCILE_FAIL_LIMIT", "7");
        }
        let config = GatewayConfig::load(&path).unwrap();
        assert_eq!(config.reconcile_fail_limit, 7);
        unsafe {
            std::env::remove_var("GATEWAY_RECONCILE_FAIL_LIMIT");
        }
        let _ = std::fs::remove_file(&path);
    }
}
