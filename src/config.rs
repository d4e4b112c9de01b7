// src/config.rs
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_ENV: &str = "STOCK_TRADER_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "stock_trader.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid value for {key}: {value}")]
    Env { key: &'static str, value: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: SocketAddr,
    pub database_path: PathBuf,
    pub log_level: String,
    pub starting_cash: Decimal,
    pub bcrypt_cost: u32,
    pub session: SessionConfig,
    pub oracle: OracleConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Signing secret for session tokens. A random one is generated at
    /// startup when unset, so sessions end with the process.
    pub secret: Option<String>,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OracleProvider {
    AlphaVantage,
    Fixed,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub provider: OracleProvider,
    pub base_url: String,
    pub api_key: String,
    pub timeout_ms: u64,
    /// Price table for the `fixed` provider.
    pub fixed_prices: HashMap<String, Decimal>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: SocketAddr::from(([127, 0, 0, 1], 3030)),
            database_path: PathBuf::from("finance.db"),
            log_level: "info".to_string(),
            starting_cash: Decimal::new(1_000_000, 2),
            bcrypt_cost: bcrypt::DEFAULT_COST,
            session: SessionConfig::default(),
            oracle: OracleConfig::default(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            secret: None,
            ttl_secs: 24 * 60 * 60,
        }
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        OracleConfig {
            provider: OracleProvider::AlphaVantage,
            base_url: "https://www.alphavantage.co/query".to_string(),
            api_key: "demo".to_string(),
            timeout_ms: 5000,
            fixed_prices: HashMap::new(),
        }
    }
}

impl Config {
    /// Reads the TOML file named by `STOCK_TRADER_CONFIG` (or
    /// `stock_trader.toml` when present), then applies env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            Err(_) => Config::default(),
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("STOCK_TRADER_LISTEN") {
            self.listen = value.parse().map_err(|_| ConfigError::Env {
                key: "STOCK_TRADER_LISTEN",
                value,
            })?;
        }
        if let Some(value) = lookup("STOCK_TRADER_DB") {
            self.database_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("STOCK_TRADER_SESSION_SECRET") {
            self.session.secret = Some(value);
        }
        if let Some(value) = lookup("ALPHAVANTAGE_API_KEY") {
            self.oracle.api_key = value;
        }
        if let Some(value) = lookup("STOCK_TRADER_LOG") {
            self.log_level = value;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn defaults_without_file() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.listen.port(), 3030);
        assert_eq!(config.starting_cash, dec!(10000.00));
        assert_eq!(config.oracle.provider, OracleProvider::AlphaVantage);
        assert!(config.session.secret.is_none());
    }

    #[test]
    fn reads_fixed_prices() {
        let config = Config::from_toml(
            r#"
            starting_cash = "2500.50"
            bcrypt_cost = 4

            [oracle]
            provider = "fixed"
            timeout_ms = 250

            [oracle.fixed_prices]
            AAPL = "190.12"
            MSFT = "411.00"
            "#,
        )
        .unwrap();
        assert_eq!(config.starting_cash, dec!(2500.50));
        assert_eq!(config.oracle.provider, OracleProvider::Fixed);
        assert_eq!(config.oracle.timeout_ms, 250);
        assert_eq!(config.oracle.fixed_prices["MSFT"], dec!(411.00));
    }

    #[test]
    fn env_overrides_win() {
        let mut config = Config::default();
        config
            .apply_overrides(|key| match key {
                "STOCK_TRADER_LISTEN" => Some("0.0.0.0:8080".to_string()),
                "ALPHAVANTAGE_API_KEY" => Some("KEY".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.listen.port(), 8080);
        assert_eq!(config.oracle.api_key, "KEY");

        let err = config
            .apply_overrides(|key| (key == "STOCK_TRADER_LISTEN").then(|| "nope".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }
}
