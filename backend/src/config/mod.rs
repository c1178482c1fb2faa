//! # Configuration Module
//!
//! This module handles loading and validating configuration from
//! environment variables. All settings are centralized here.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let config = AppConfig::from_env()?;
//! println!("RPC URL: {}", config.solana_rpc_url);
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Description | Example |
//! |----------|-------------|---------|
//! | `SOLANA_RPC_URL` | Solana RPC endpoint | `https://api.devnet.solana.com` |
//! | `VAULT_PROGRAM_ID` | Deployed vault program ID | `AVRBwuFHdU51...` |
//! | `SETTLEMENT_MINT` | Settlement asset mint (6 decimals) | `EPjFWdd5...` |
//! | `RISK_MINT` | Risk asset mint (8 decimals) | `3NZ9JMVB...` |
//! | `KEYPAIR_PATH` | Operator keypair file | `~/.config/solana/id.json` |
//! | `EXCHANGE_API_URL` | Exchange REST base URL | `https://api.exchange.example/v1` |
//! | `EXCHANGE_API_KEY` | Exchange API key | `...` |
//! | `STATE_FILE` | Persisted wallet classification | `vault_monitor_state.json` |
//! | `SERVER_HOST` | Control plane host | `127.0.0.1` |
//! | `SERVER_PORT` | Control plane port | `8080` |
//!
//! Strategy knobs live in [`EngineConfig`]; each one can be overridden by
//! an environment variable of the same name in upper case.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required environment variable is missing
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    /// Failed to parse a value
    #[error("Failed to parse {0}: {1}")]
    ParseError(String, String),
}

/// Application configuration loaded from environment variables.
///
/// Connection settings for both gateways and the control plane, plus the
/// [`EngineConfig`] shared by every processor.
#[derive(Debug, Clone)]
pub struct AppConfig {
    // ==========================================
    // LEDGER SETTINGS
    // ==========================================

    /// Solana RPC endpoint URL.
    ///
    /// Common values:
    /// - Devnet: `https://api.devnet.solana.com`
    /// - Mainnet: `https://api.mainnet-beta.solana.com`
    /// - Local: `http://localhost:8899`
    pub solana_rpc_url: String,

    /// The deployed vault program ID.
    ///
    /// Deposit and withdrawal queues live in accounts derived from it.
    pub vault_program_id: String,

    /// Settlement asset (stablecoin) mint address.
    pub settlement_mint: String,

    /// Risk asset (wrapped bitcoin) mint address.
    pub risk_mint: String,

    /// Path to the operator keypair used to sign vault and token calls.
    ///
    /// When the file cannot be loaded the engine runs read-only.
    pub keypair_path: String,

    /// Operator wallet address override.
    ///
    /// Only needed when running without a keypair, so balances can still
    /// be observed.
    pub operator_address: Option<String>,

    // ==========================================
    // EXCHANGE SETTINGS
    // ==========================================

    /// Exchange REST base URL.
    pub exchange_api_url: String,

    /// Exchange API key (sent as `X-Api-Key`).
    pub exchange_api_key: String,

    /// On-chain address owning the exchange deposit token account.
    pub exchange_deposit_address: Option<String>,

    // ==========================================
    // SERVER SETTINGS
    // ==========================================

    /// HTTP server host address.
    ///
    /// Use `127.0.0.1` for localhost only, `0.0.0.0` to accept
    /// connections from any interface.
    pub server_host: String,

    /// HTTP server port number.
    pub server_port: u16,

    /// Key required in `X-Api-Key` for administrative routes.
    ///
    /// Administrative routes are refused when unset.
    pub admin_api_key: Option<String>,

    // ==========================================
    // ENGINE SETTINGS
    // ==========================================

    /// Where the balance monitor persists its classification state.
    pub state_file: String,

    /// Strategy and scheduling knobs.
    pub engine: EngineConfig,
}

/// Strategy, safety and scheduling parameters for the five processors.
///
/// Defaults mirror the values the vault has been operated with.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Perpetual market used for the hedge.
    pub market: String,

    /// Hedge notional per unit of settlement asset deposited.
    pub leverage: Decimal,

    /// Upper bound on deposit queue ids scanned per tick.
    pub max_deposit_scan: u64,

    /// Deposits at or below this amount are ignored.
    pub deposit_dust: Decimal,

    /// Share of recorded vault value that is transferable settlement asset.
    ///
    /// The remainder is the risk-asset leg held by the vault.
    pub settlement_leg_ratio: Decimal,

    /// Accepted shortfall when checking funds received after a mint.
    pub receipt_tolerance: Decimal,

    /// Absolute delta above which the hedge is adjusted.
    pub delta_band: Decimal,

    /// Hedge adjustments smaller than this (USD) are skipped.
    pub min_adjustment_usd: Decimal,

    /// Hourly funding rate below which the hedge is closed.
    pub negative_funding_threshold: Decimal,

    /// Margin ratio that triggers a warning.
    pub margin_warning_ratio: Decimal,

    /// Margin ratio at or above which the health snapshot is flagged
    /// unhealthy. Sits at or below the warning ratio.
    pub margin_unhealthy_ratio: Decimal,

    /// Largest accepted NAV move between two reports, as a fraction.
    pub nav_max_change: Decimal,

    /// Wallet amounts at or below this are treated as rounding noise.
    pub balance_dust: Decimal,

    /// Pending deposits below this are not sent to the exchange yet.
    pub min_auto_deposit: Decimal,

    pub deposit_interval: Duration,
    pub withdrawal_interval: Duration,
    pub funding_check_interval: Duration,
    pub rebalance_interval: Duration,
    pub nav_interval: Duration,
    pub balance_interval: Duration,

    /// Upper bound on waiting for a signed transaction to confirm.
    pub tx_timeout: Duration,

    /// Pause after a mint before reading the operator balance.
    pub settle_delay: Duration,

    /// How long a withdrawal may wait for exchange funds before it is retried.
    pub settlement_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            market: "BTC-USD".to_string(),
            leverage: dec!(2.0),
            max_deposit_scan: 100,
            deposit_dust: dec!(0.01),
            settlement_leg_ratio: dec!(0.5),
            receipt_tolerance: dec!(0.1),
            delta_band: dec!(0.05),
            min_adjustment_usd: dec!(10),
            negative_funding_threshold: dec!(-0.0001),
            margin_warning_ratio: dec!(0.8),
            margin_unhealthy_ratio: dec!(0.7),
            nav_max_change: dec!(0.05),
            balance_dust: dec!(0.1),
            min_auto_deposit: dec!(1.0),
            deposit_interval: Duration::from_secs(30),
            withdrawal_interval: Duration::from_secs(30),
            funding_check_interval: Duration::from_secs(60),
            rebalance_interval: Duration::from_secs(3600),
            nav_interval: Duration::from_secs(3600),
            balance_interval: Duration::from_secs(60),
            tx_timeout: Duration::from_secs(120),
            settle_delay: Duration::from_secs(5),
            settlement_timeout: Duration::from_secs(2 * 3600),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Use `dotenvy::dotenv()` before calling this to load from `.env` file.
    ///
    /// ## Returns
    ///
    /// - `Ok(AppConfig)` - Configuration loaded successfully
    /// - `Err(ConfigError)` - A required variable is missing or invalid
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            // Ledger
            solana_rpc_url: get_env_or_default(
                "SOLANA_RPC_URL",
                "https://api.devnet.solana.com",
            ),
            vault_program_id: get_env("VAULT_PROGRAM_ID")?,
            settlement_mint: get_env_or_default(
                "SETTLEMENT_MINT",
                "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
            ),
            risk_mint: get_env_or_default(
                "RISK_MINT",
                "3NZ9JMVBmGAqocybic2c7LQCJScmgsAZ6vQqTDzcqmJh",
            ),
            keypair_path: get_env_or_default(
                "KEYPAIR_PATH",
                "~/.config/solana/id.json",
            ),
            operator_address: env::var("OPERATOR_ADDRESS").ok(),

            // Exchange
            exchange_api_url: get_env_or_default(
                "EXCHANGE_API_URL",
                "https://api.starknet.extended.exchange/api/v1",
            ),
            exchange_api_key: get_env_or_default("EXCHANGE_API_KEY", ""),
            exchange_deposit_address: env::var("EXCHANGE_DEPOSIT_ADDRESS").ok(),

            // Server
            server_host: get_env_or_default("SERVER_HOST", "127.0.0.1"),
            server_port: get_env_parsed("SERVER_PORT", 8080)?,
            admin_api_key: env::var("ADMIN_API_KEY").ok().filter(|k| !k.is_empty()),

            // Engine
            state_file: get_env_or_default("STATE_FILE", "vault_monitor_state.json"),
            engine: EngineConfig::from_env()?,
        };

        config.engine.validate()?;
        Ok(config)
    }
}

impl EngineConfig {
    /// Build engine settings from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            market: get_env_or_default("MARKET", &d.market),
            leverage: get_env_parsed("LEVERAGE", d.leverage)?,
            max_deposit_scan: get_env_parsed("MAX_DEPOSIT_SCAN", d.max_deposit_scan)?,
            deposit_dust: get_env_parsed("DEPOSIT_DUST", d.deposit_dust)?,
            settlement_leg_ratio: get_env_parsed("SETTLEMENT_LEG_RATIO", d.settlement_leg_ratio)?,
            receipt_tolerance: get_env_parsed("RECEIPT_TOLERANCE", d.receipt_tolerance)?,
            delta_band: get_env_parsed("DELTA_BAND", d.delta_band)?,
            min_adjustment_usd: get_env_parsed("MIN_ADJUSTMENT_USD", d.min_adjustment_usd)?,
            negative_funding_threshold: get_env_parsed(
                "NEGATIVE_FUNDING_THRESHOLD",
                d.negative_funding_threshold,
            )?,
            margin_warning_ratio: get_env_parsed("MARGIN_WARNING_RATIO", d.margin_warning_ratio)?,
            margin_unhealthy_ratio: get_env_parsed(
                "MARGIN_UNHEALTHY_RATIO",
                d.margin_unhealthy_ratio,
            )?,
            nav_max_change: get_env_parsed("NAV_MAX_CHANGE", d.nav_max_change)?,
            balance_dust: get_env_parsed("BALANCE_DUST", d.balance_dust)?,
            min_auto_deposit: get_env_parsed("MIN_AUTO_DEPOSIT", d.min_auto_deposit)?,
            deposit_interval: get_env_secs("DEPOSIT_INTERVAL", d.deposit_interval)?,
            withdrawal_interval: get_env_secs("WITHDRAWAL_INTERVAL", d.withdrawal_interval)?,
            funding_check_interval: get_env_secs("FUNDING_CHECK_INTERVAL", d.funding_check_interval)?,
            rebalance_interval: get_env_secs("REBALANCE_INTERVAL", d.rebalance_interval)?,
            nav_interval: get_env_secs("NAV_INTERVAL", d.nav_interval)?,
            balance_interval: get_env_secs("BALANCE_CHECK_INTERVAL", d.balance_interval)?,
            tx_timeout: get_env_secs("TX_TIMEOUT", d.tx_timeout)?,
            settle_delay: get_env_secs("SETTLE_DELAY", d.settle_delay)?,
            settlement_timeout: get_env_secs("SETTLEMENT_TIMEOUT", d.settlement_timeout)?,
        })
    }

    /// Reject settings that would break the engine's invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.settlement_leg_ratio <= Decimal::ZERO || self.settlement_leg_ratio > Decimal::ONE {
            return Err(ConfigError::InvalidValue(
                "SETTLEMENT_LEG_RATIO".to_string(),
                "must be in (0, 1]".to_string(),
            ));
        }
        if self.leverage <= Decimal::ZERO {
            return Err(ConfigError::InvalidValue(
                "LEVERAGE".to_string(),
                "must be positive".to_string(),
            ));
        }
        if self.margin_unhealthy_ratio > self.margin_warning_ratio {
            return Err(ConfigError::InvalidValue(
                "MARGIN_UNHEALTHY_RATIO".to_string(),
                "must not exceed MARGIN_WARNING_RATIO".to_string(),
            ));
        }
        if self.nav_max_change <= Decimal::ZERO {
            return Err(ConfigError::InvalidValue(
                "NAV_MAX_CHANGE".to_string(),
                "must be positive".to_string(),
            ));
        }
        let intervals = [
            ("DEPOSIT_INTERVAL", self.deposit_interval),
            ("WITHDRAWAL_INTERVAL", self.withdrawal_interval),
            ("FUNDING_CHECK_INTERVAL", self.funding_check_interval),
            ("NAV_INTERVAL", self.nav_interval),
            ("BALANCE_CHECK_INTERVAL", self.balance_interval),
        ];
        for (key, interval) in intervals {
            if interval.is_zero() {
                return Err(ConfigError::InvalidValue(key.to_string(), "must be > 0".to_string()));
            }
        }
        Ok(())
    }
}

/// Get a required environment variable.
///
/// Returns an error if the variable is not set.
fn get_env(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Get an environment variable with a default value.
///
/// Returns the default if the variable is not set.
fn get_env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse an optional environment variable, keeping `default` when unset.
fn get_env_parsed<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::ParseError(key.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}

/// Parse a whole number of seconds.
fn get_env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    get_env_parsed(key, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_env_or_default() {
        // Should return default when not set
        let value = get_env_or_default("NONEXISTENT_VAR_12345", "default_value");
        assert_eq!(value, "default_value");
    }

    #[test]
    fn test_get_env_parsed_reports_bad_numbers() {
        env::set_var("VAULT_TEST_BAD_LEVERAGE", "two");
        let result: Result<Decimal, _> = get_env_parsed("VAULT_TEST_BAD_LEVERAGE", dec!(2));
        assert!(matches!(result, Err(ConfigError::ParseError(key, _)) if key == "VAULT_TEST_BAD_LEVERAGE"));

        let fallback: Decimal = get_env_parsed("VAULT_TEST_UNSET_LEVERAGE", dec!(3)).unwrap();
        assert_eq!(fallback, dec!(3));
    }

    #[test]
    fn test_default_engine_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.nav_max_change, dec!(0.05));
        assert_eq!(config.settlement_leg_ratio, dec!(0.5));
    }

    #[test]
    fn test_rejects_out_of_range_leg_ratio() {
        let config = EngineConfig {
            settlement_leg_ratio: dec!(1.5),
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_, _))));
    }

    #[test]
    fn test_rejects_unhealthy_ratio_above_warning() {
        let config = EngineConfig {
            margin_unhealthy_ratio: dec!(0.9),
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue(key, _)) if key == "MARGIN_UNHEALTHY_RATIO"
        ));
    }
}
