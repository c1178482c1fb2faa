//! # Exchange Gateway
//!
//! Read/write access to the custodial perpetuals exchange account that
//! holds the hedge and its cash balance.
//!
//! ## Operations
//!
//! | Operation | Used by |
//! |-----------|---------|
//! | `funding_rate` | rebalancer (funding guard), health snapshot |
//! | `mark_price` | withdrawal close sizing, rebalancer |
//! | `positions` | rebalancer, close |
//! | `account_balance` | NAV reporter, rebalancer, balance monitor |
//! | `open_short` | deposit processor, rebalancer |
//! | `close` | withdrawal state machine, rebalancer |
//! | `request_withdrawal` | withdrawal state machine |
//! | `deposit` | deposit processor, balance monitor |

pub mod client;

use async_trait::async_trait;
use rust_decimal::Decimal;
use solana_sdk::pubkey::Pubkey;
use thiserror::Error;

use crate::ledger::LedgerError;
use crate::models::{AccountBalance, CloseSize, OrderResult, Position, WithdrawalReceipt};

pub use self::client::ExchangeClient;

/// Errors returned by an exchange gateway.
#[derive(Error, Debug)]
pub enum ExchangeError {
    /// Request could not be sent or the connection failed.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Non-success HTTP status.
    #[error("Exchange returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Response body did not match the expected shape.
    #[error("Failed to decode exchange response: {0}")]
    Decode(String),

    /// A route the operation needs is not configured.
    #[error("Not configured: {0}")]
    NotConfigured(String),

    /// The exchange answered with a non-OK envelope.
    #[error("Exchange rejected request: {0}")]
    Rejected(String),

    /// The on-chain leg of a deposit failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ExchangeError::Decode(err.to_string())
        } else {
            ExchangeError::Http(err.to_string())
        }
    }
}

/// Custodial exchange account used for hedging.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Current funding rate per hour (0.0001 = 0.01%/h).
    async fn funding_rate(&self, market: &str) -> Result<Decimal, ExchangeError>;

    async fn mark_price(&self, market: &str) -> Result<Decimal, ExchangeError>;

    /// Open short positions in `market`.
    async fn positions(&self, market: &str) -> Result<Vec<Position>, ExchangeError>;

    async fn account_balance(&self) -> Result<AccountBalance, ExchangeError>;

    /// Open or increase a short of `usd_size` notional.
    async fn open_short(&self, market: &str, usd_size: Decimal) -> Result<OrderResult, ExchangeError>;

    /// Reduce the short. Returns `NothingToClose` when no short is open.
    async fn close(&self, market: &str, size: CloseSize) -> Result<OrderResult, ExchangeError>;

    /// Withdraw settlement asset from the exchange to `recipient`.
    async fn request_withdrawal(
        &self,
        amount: Decimal,
        recipient: &Pubkey,
    ) -> Result<WithdrawalReceipt, ExchangeError>;

    /// Move settlement asset from the operator wallet into the exchange account.
    ///
    /// Returns the transaction signature.
    async fn deposit(&self, amount: Decimal) -> Result<String, ExchangeError>;
}
