//! Configuration management
//!
//! Handles loading and parsing of JSON configuration files with environment
//! variable support for API and notification credentials. Every parameter is
//! validated at load time; a strategy with an invalid configuration never
//! starts.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::error::ConfigError;
use crate::types::Symbol;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    pub strategies: Vec<StrategyConfig>,
}

impl Config {
    /// Load configuration from JSON file, overlaying credentials from the
    /// environment, and validate it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        let mut config: Config = serde_json::from_str(&contents)?;

        if let Ok(api_key) = std::env::var("BINANCE_API_KEY") {
            config.exchange.api_key = Some(api_key);
        }
        if let Ok(api_secret) = std::env::var("BINANCE_API_SECRET") {
            config.exchange.api_secret = Some(api_secret);
        }
        if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
            config.notifier.telegram_bot_token = Some(token);
        }
        if let Ok(chat_id) = std::env::var("TELEGRAM_CHAT_ID") {
            config.notifier.telegram_chat_id = Some(chat_id);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate all sections. Called from `from_file`; public so tests and
    /// embedders building a `Config` by hand get the same checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.tick_interval_secs == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "engine.tick_interval_secs",
                value: "0".into(),
                reason: "must be at least 1 second",
            });
        }
        if self.engine.max_errors == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "engine.max_errors",
                value: "0".into(),
                reason: "must allow at least one error before halting",
            });
        }

        let mut seen = HashSet::new();
        for strategy in &self.strategies {
            if !seen.insert(strategy.id.as_str()) {
                return Err(ConfigError::DuplicateStrategyId(strategy.id.clone()));
            }
            strategy.validate()?;
        }
        Ok(())
    }

    /// Credentials are only mandatory for live trading; paper mode and the
    /// audit command work without them.
    pub fn require_exchange_credentials(&self) -> Result<(), ConfigError> {
        if self.exchange.api_key.is_none() {
            return Err(ConfigError::MissingCredential("BINANCE_API_KEY"));
        }
        if self.exchange.api_secret.is_none() {
            return Err(ConfigError::MissingCredential("BINANCE_API_SECRET"));
        }
        Ok(())
    }
}

/// Exchange connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    pub base_url: String,
    /// Candle interval fed to the indicator window, e.g. "1h"
    pub kline_interval: String,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            api_key: None,
            api_secret: None,
            base_url: "https://api.binance.com".to_string(),
            kline_interval: "1h".to_string(),
        }
    }
}

/// Engine/scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub state_dir: String,
    pub tick_interval_secs: u64,
    /// Safety monitor runs every this many ticks (slower than the main tick)
    pub safety_check_every_ticks: u64,
    /// Open order intents older than this are cancelled
    pub order_timeout_minutes: i64,
    /// Orders unfindable on the exchange for this long are treated as failed
    pub not_found_grace_minutes: i64,
    /// Consecutive transient errors before the strategy is halted
    pub max_errors: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            state_dir: "state".to_string(),
            tick_interval_secs: 30,
            safety_check_every_ticks: 20,
            order_timeout_minutes: 5,
            not_found_grace_minutes: 5,
            max_errors: 5,
        }
    }
}

/// Notification sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram_bot_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram_chat_id: Option<String>,
    pub max_attempts: u32,
    pub backoff_secs: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        NotifierConfig {
            telegram_bot_token: None,
            telegram_chat_id: None,
            max_attempts: 3,
            backoff_secs: 30,
        }
    }
}

/// Per-strategy instance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub id: String,
    pub symbol: String,
    pub ott: OttParams,
    pub params: DcaParams,
}

impl StrategyConfig {
    pub fn symbol(&self) -> Symbol {
        Symbol::new(&self.symbol)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::InvalidParameter {
                name: "strategy.id",
                value: self.id.clone(),
                reason: "must not be empty",
            });
        }
        if self.symbol.trim().is_empty() {
            return Err(ConfigError::InvalidParameter {
                name: "strategy.symbol",
                value: self.symbol.clone(),
                reason: "must not be empty",
            });
        }
        self.ott.validate()?;
        self.params.validate()
    }
}

/// OTT indicator parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OttParams {
    /// VIDYA period
    pub period: usize,
    /// Envelope factor in percent
    pub opt: f64,
}

impl Default for OttParams {
    fn default() -> Self {
        OttParams {
            period: 20,
            opt: 2.0,
        }
    }
}

impl OttParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.period < 1 || self.period > 200 {
            return Err(ConfigError::InvalidParameter {
                name: "ott.period",
                value: self.period.to_string(),
                reason: "must be between 1 and 200",
            });
        }
        if !(0.1..=10.0).contains(&self.opt) {
            return Err(ConfigError::InvalidParameter {
                name: "ott.opt",
                value: self.opt.to_string(),
                reason: "must be between 0.1 and 10.0",
            });
        }
        Ok(())
    }
}

/// DCA cycle parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DcaParams {
    /// First-entry quantity in base asset units
    pub base_quantity: f64,
    /// Each DCA entry is base_quantity * dca_multiplier^n
    pub dca_multiplier: f64,
    /// Minimum drop from the reference price before a DCA entry, in percent
    pub min_drop_pct: f64,
    /// Profit over average cost / reference price required to sell, in percent
    pub profit_threshold_pct: f64,
    /// Hard cap on entries per cycle
    pub max_dca_steps: usize,
    /// Market orders when true, tick-rounded limit orders otherwise
    pub use_market_orders: bool,
    /// Starting cash balance for PnL accounting
    pub initial_balance: f64,
}

impl Default for DcaParams {
    fn default() -> Self {
        DcaParams {
            base_quantity: 1.0,
            dca_multiplier: 1.5,
            min_drop_pct: 2.0,
            profit_threshold_pct: 1.0,
            max_dca_steps: 10,
            use_market_orders: true,
            initial_balance: 1000.0,
        }
    }
}

impl DcaParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.base_quantity.is_finite() && self.base_quantity > 0.0) {
            return Err(ConfigError::InvalidParameter {
                name: "params.base_quantity",
                value: self.base_quantity.to_string(),
                reason: "must be a positive finite number",
            });
        }
        if !(self.dca_multiplier.is_finite() && self.dca_multiplier >= 1.0) {
            return Err(ConfigError::InvalidParameter {
                name: "params.dca_multiplier",
                value: self.dca_multiplier.to_string(),
                reason: "must be >= 1.0",
            });
        }
        if !(self.min_drop_pct.is_finite() && self.min_drop_pct >= 0.0) {
            return Err(ConfigError::InvalidParameter {
                name: "params.min_drop_pct",
                value: self.min_drop_pct.to_string(),
                reason: "must be >= 0",
            });
        }
        if !(self.profit_threshold_pct.is_finite() && self.profit_threshold_pct >= 0.0) {
            return Err(ConfigError::InvalidParameter {
                name: "params.profit_threshold_pct",
                value: self.profit_threshold_pct.to_string(),
                reason: "must be >= 0",
            });
        }
        if self.max_dca_steps == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "params.max_dca_steps",
                value: "0".into(),
                reason: "must allow at least one entry",
            });
        }
        if !(self.initial_balance.is_finite() && self.initial_balance > 0.0) {
            return Err(ConfigError::InvalidParameter {
                name: "params.initial_balance",
                value: self.initial_balance.to_string(),
                reason: "must be a positive finite number",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_strategy() -> StrategyConfig {
        StrategyConfig {
            id: "dca-btc".to_string(),
            symbol: "BTCUSDT".to_string(),
            ott: OttParams::default(),
            params: DcaParams::default(),
        }
    }

    #[test]
    fn test_valid_config_passes() {
        let config = Config {
            exchange: ExchangeConfig::default(),
            engine: EngineConfig::default(),
            notifier: NotifierConfig::default(),
            strategies: vec![sample_strategy()],
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_strategy_ids_rejected() {
        let config = Config {
            exchange: ExchangeConfig::default(),
            engine: EngineConfig::default(),
            notifier: NotifierConfig::default(),
            strategies: vec![sample_strategy(), sample_strategy()],
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateStrategyId(_))
        ));
    }

    #[test]
    fn test_ott_params_range() {
        let mut ott = OttParams::default();
        ott.period = 0;
        assert!(ott.validate().is_err());
        ott.period = 201;
        assert!(ott.validate().is_err());
        ott = OttParams { period: 20, opt: 0.05 };
        assert!(ott.validate().is_err());
    }

    #[test]
    fn test_dca_params_rejects_nonsense() {
        let mut params = DcaParams::default();
        params.base_quantity = 0.0;
        assert!(params.validate().is_err());

        params = DcaParams::default();
        params.dca_multiplier = 0.5;
        assert!(params.validate().is_err());

        params = DcaParams::default();
        params.initial_balance = f64::NAN;
        assert!(params.validate().is_err());
    }
}
