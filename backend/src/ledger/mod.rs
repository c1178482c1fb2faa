//! # Ledger Gateway
//!
//! Read/write access to the on-chain vault program and token balances.
//!
//! ## Responsibilities
//!
//! - Read queue lengths and queue items
//! - Value shares and report the vault's risk-asset holdings
//! - Read token balances of any wallet
//! - Submit signed program invocations and token transfers
//!
//! ## Fixed Point
//!
//! Amounts cross the chain boundary as integers (settlement asset: 6
//! decimals, risk asset: 8 decimals). Implementations scale them to
//! `Decimal` before returning, and scale them back before writing.
//!
//! ## Signing
//!
//! Reads never need a key. Signed operations return
//! [`LedgerError::SignerUnavailable`] when the operator keypair could not be
//! loaded, so the engine degrades to read-only behaviour.

pub mod signer;
pub mod solana;

use async_trait::async_trait;
use rust_decimal::Decimal;
use solana_sdk::pubkey::Pubkey;
use thiserror::Error;

use crate::models::{Asset, DepositRequest, QueueKind, TxConfirmation, WithdrawalRequest};

pub use self::solana::SolanaLedger;

/// Errors returned by a ledger gateway.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// RPC call failed after all retries.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// RPC call or confirmation did not finish in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Blocking task panicked or was cancelled.
    #[error("Blocking task failed: {0}")]
    Task(String),

    /// Account data could not be decoded.
    #[error("Failed to decode account: {0}")]
    Decode(String),

    /// Address could not be parsed.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Amount cannot be represented at the asset's precision.
    #[error("Invalid amount: {0}")]
    Amount(String),

    /// No operator keypair is loaded.
    #[error("Operator signer unavailable, running read-only")]
    SignerUnavailable,

    /// The network accepted the call but the program rejected it.
    #[error("Transaction rejected: {0}")]
    Rejected(String),
}

/// Vault program and token access used by every processor.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Number of requests ever appended to a queue.
    async fn queue_length(&self, kind: QueueKind) -> Result<u64, LedgerError>;

    /// Read one deposit slot. `None` for a slot that was never written.
    async fn read_deposit(&self, request_id: u64) -> Result<Option<DepositRequest>, LedgerError>;

    /// Read one withdrawal slot. `None` for a slot that was never written.
    async fn read_withdrawal(
        &self,
        request_id: u64,
    ) -> Result<Option<WithdrawalRequest>, LedgerError>;

    /// Current value of `shares`, in settlement asset (both legs).
    async fn preview_redeem(&self, shares: u128) -> Result<Decimal, LedgerError>;

    /// Risk asset held by the vault, in risk-asset units.
    async fn risk_asset_held(&self) -> Result<Decimal, LedgerError>;

    /// Token balance of `owner` for `asset`.
    async fn balance_of(&self, asset: Asset, owner: &Pubkey) -> Result<Decimal, LedgerError>;

    /// Signed call of a vault program function with integer arguments.
    ///
    /// Blocks until the network confirms the transaction.
    async fn invoke(&self, function: &str, args: &[u64]) -> Result<TxConfirmation, LedgerError>;

    /// Signed token transfer from the operator wallet.
    async fn transfer(
        &self,
        asset: Asset,
        recipient: &Pubkey,
        amount: Decimal,
    ) -> Result<TxConfirmation, LedgerError>;

    /// Operator wallet address.
    fn operator(&self) -> Pubkey;

    /// Vault address (recipient of forwarded settlement funds).
    fn vault(&self) -> Pubkey;

    /// Whether signed operations are possible.
    fn can_sign(&self) -> bool;
}
