//! # Balance Store
//!
//! Durable home of the balance monitor's [`PendingBalance`] record.
//!
//! The record is small and rewritten after every mutation, so the file
//! store replaces the whole file atomically:
//!
//! ```text
//! 1. serialize PendingBalance to JSON
//!              ↓
//! 2. write <state_file>.tmp and fsync
//!              ↓
//! 3. rename over <state_file>
//! ```
//!
//! A crash at any point leaves either the old or the new record on disk.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Errors returned by a balance store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("State file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("State file is corrupt: {0}")]
    Corrupt(String),
}

/// Classification of funds observed on the operator wallet.
///
/// Both pending amounts are never negative.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingBalance {
    /// Inflow attributed to deposits, not yet sent to the exchange.
    pub pending_deposit: Decimal,

    /// Settlement funds expected back from the exchange for withdrawals.
    pub pending_withdrawal_amount: Decimal,

    /// Wallet balance at the last observation.
    #[serde(alias = "last_balance")]
    pub last_observed_balance: Decimal,
}

/// Narrow persistence interface for [`PendingBalance`].
#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// Load the last saved record, `None` on first start.
    async fn load(&self) -> Result<Option<PendingBalance>, StoreError>;

    /// Replace the saved record.
    async fn save(&self, balance: &PendingBalance) -> Result<(), StoreError>;
}

/// JSON file store with atomic replace.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

#[async_trait]
impl BalanceStore for JsonFileStore {
    async fn load(&self) -> Result<Option<PendingBalance>, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let balance: PendingBalance = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Corrupt(format!("{}: {}", self.path.display(), e)))?;

        if balance.pending_deposit.is_sign_negative() || balance.pending_withdrawal_amount.is_sign_negative() {
            return Err(StoreError::Corrupt(format!(
                "{}: negative pending amount",
                self.path.display()
            )));
        }

        Ok(Some(balance))
    }

    async fn save(&self, balance: &PendingBalance) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(balance)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let temp = self.temp_path();
        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temp, &self.path).await?;
        debug!("💾 Saved balance state to {}", self.path.display());
        Ok(())
    }
}

/// In-memory store, for running without a state file.
#[derive(Default)]
pub struct MemoryStore {
    record: Mutex<Option<PendingBalance>>,
}

#[async_trait]
impl BalanceStore for MemoryStore {
    async fn load(&self) -> Result<Option<PendingBalance>, StoreError> {
        Ok(self.record.lock().clone())
    }

    async fn save(&self, balance: &PendingBalance) -> Result<(), StoreError> {
        *self.record.lock() = Some(balance.clone());
        Ok(())
    }
}
