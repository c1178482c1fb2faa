//! # Vault Queue Records
//!
//! Deposit and withdrawal requests as stored by the vault program.
//! They are owned by the ledger; the engine only reads them and changes
//! them through signed invocations.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;

/// Which of the two vault queues an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Deposit,
    Withdrawal,
}

impl QueueKind {
    /// Seed prefix of the queue item accounts.
    pub fn seed(&self) -> &'static [u8] {
        match self {
            QueueKind::Deposit => b"deposit",
            QueueKind::Withdrawal => b"withdrawal",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKind::Deposit => write!(f, "deposit"),
            QueueKind::Withdrawal => write!(f, "withdrawal"),
        }
    }
}

/// Token held or moved by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Asset {
    /// Stable-value token, 6 decimals.
    Settlement,
    /// Volatile long leg (wrapped bitcoin), 8 decimals.
    Risk,
}

impl Asset {
    pub fn decimals(&self) -> u32 {
        match self {
            Asset::Settlement => crate::utils::SETTLEMENT_DECIMALS,
            Asset::Risk => crate::utils::RISK_DECIMALS,
        }
    }
}

/// A user's request to deposit settlement asset and receive shares.
///
/// Slots past the end of the live queue read back with a zero `user`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositRequest {
    /// Sequential id, dense from 0.
    pub request_id: u64,

    /// Depositor.
    pub user: Pubkey,

    /// Receiver of the minted shares.
    pub receiver: Pubkey,

    /// Recorded value of the deposit (both legs).
    pub settlement_amount: Decimal,

    /// Slippage bound on minted shares.
    pub min_shares: u128,

    /// Unix timestamp of the request.
    pub timestamp: u64,

    /// Set by the vault once shares are minted.
    pub processed: bool,
}

impl DepositRequest {
    /// True when this slot is past the end of the live queue.
    pub fn is_sentinel(&self) -> bool {
        self.user == Pubkey::default()
    }
}

/// Withdrawal lifecycle as recorded by the vault.
///
/// The engine writes PROCESSING and READY; COMPLETED and CANCELLED are
/// written by other actors and only observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WithdrawalStatus {
    Pending,
    Processing,
    Ready,
    Completed,
    Cancelled,
}

impl WithdrawalStatus {
    /// Decode the on-chain status byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(WithdrawalStatus::Pending),
            1 => Some(WithdrawalStatus::Processing),
            2 => Some(WithdrawalStatus::Ready),
            3 => Some(WithdrawalStatus::Completed),
            4 => Some(WithdrawalStatus::Cancelled),
            _ => None,
        }
    }

    /// READY, COMPLETED and CANCELLED need no further engine action.
    pub fn is_terminal_for_engine(&self) -> bool {
        matches!(
            self,
            WithdrawalStatus::Ready | WithdrawalStatus::Completed | WithdrawalStatus::Cancelled
        )
    }
}

/// A user's request to redeem shares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalRequest {
    pub request_id: u64,
    pub user: Pubkey,
    pub shares: u128,
    pub min_assets: u128,

    /// Value recorded when the request was made (both legs).
    pub settlement_value: Decimal,

    pub timestamp: u64,
    pub status: WithdrawalStatus,
}

/// Confirmation of a signed ledger transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxConfirmation {
    /// Transaction signature (base58).
    pub signature: String,
}
