//! # Engine Errors
//!
//! Every processor tick returns `Result<_, EngineError>`. The variants are
//! the four failure categories the engine distinguishes:
//!
//! | Variant | Cause | Handling |
//! |---------|-------|----------|
//! | `Transient` | gateway timeout, network error | logged, retried next tick |
//! | `InvalidData` | unparsable queue entry or response | logged, item skipped |
//! | `SafetyRule` | NAV jump too large, dust adjustment | logged, deliberately skipped |
//! | `Capability` | missing signing key | no-op failure, read-only mode |
//!
//! None of them is fatal; the runner records the error in the processor
//! status snapshot and proceeds to the next tick.

use thiserror::Error;

use crate::exchange::ExchangeError;
use crate::ledger::LedgerError;
use crate::store::StoreError;

/// Failure of one reconciliation step.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Network I/O or confirmation timeout. Safe to retry.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Data read from a gateway could not be interpreted.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// An operation was skipped because it would violate a safety bound.
    #[error("safety rule: {0}")]
    SafetyRule(String),

    /// A required capability (signing key, route) is not configured.
    #[error("capability unavailable: {0}")]
    Capability(String),
}

impl EngineError {
    /// Short category label used in status snapshots and logs.
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Transient(_) => "transient",
            EngineError::InvalidData(_) => "invalid_data",
            EngineError::SafetyRule(_) => "safety_rule",
            EngineError::Capability(_) => "capability",
        }
    }
}

impl From<LedgerError> for EngineError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Rpc(_) | LedgerError::Timeout(_) | LedgerError::Task(_) => {
                EngineError::Transient(err.to_string())
            }
            LedgerError::Decode(_) | LedgerError::InvalidAddress(_) | LedgerError::Amount(_) => {
                EngineError::InvalidData(err.to_string())
            }
            LedgerError::SignerUnavailable => EngineError::Capability(err.to_string()),
            LedgerError::Rejected(_) => EngineError::Transient(err.to_string()),
        }
    }
}

impl From<ExchangeError> for EngineError {
    fn from(err: ExchangeError) -> Self {
        match err {
            ExchangeError::Http(_) | ExchangeError::Status { .. } => {
                EngineError::Transient(err.to_string())
            }
            ExchangeError::Decode(_) => EngineError::InvalidData(err.to_string()),
            ExchangeError::NotConfigured(_) => EngineError::Capability(err.to_string()),
            ExchangeError::Rejected(_) => EngineError::Transient(err.to_string()),
            ExchangeError::Ledger(inner) => EngineError::from(inner),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Io(_) => EngineError::Transient(err.to_string()),
            StoreError::Corrupt(_) => EngineError::InvalidData(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_errors_map_to_categories() {
        let timeout: EngineError = LedgerError::Timeout("confirm".into()).into();
        assert_eq!(timeout.category(), "transient");

        let decode: EngineError = LedgerError::Decode("short".into()).into();
        assert_eq!(decode.category(), "invalid_data");

        let signer: EngineError = LedgerError::SignerUnavailable.into();
        assert_eq!(signer.category(), "capability");
    }

    #[test]
    fn test_exchange_errors_map_to_categories() {
        let missing: EngineError = ExchangeError::NotConfigured("deposit route".into()).into();
        assert!(matches!(missing, EngineError::Capability(_)));

        let nested: EngineError = ExchangeError::Ledger(LedgerError::SignerUnavailable).into();
        assert!(matches!(nested, EngineError::Capability(_)));
    }
}
