//! # Wallet Notices
//!
//! One-way messages from the deposit processor and the withdrawal state
//! machine to the balance monitor, which is the only owner of the
//! persisted [`PendingBalance`](crate::store::PendingBalance).
//!
//! ```text
//! DepositQueueProcessor ──┐
//!                         ├── WalletNotice ──► BalanceMonitor (drained each tick)
//! WithdrawalStateMachine ─┘
//! ```

use rust_decimal::Decimal;
use tokio::sync::mpsc;

/// Funds movement another loop is handling itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletNotice {
    /// Exchange withdrawal requested; `amount` will arrive on the wallet.
    WithdrawalExpected { request_id: u64, amount: Decimal },

    /// Funds for the withdrawal were sent on to the vault.
    WithdrawalForwarded { request_id: u64, amount: Decimal },

    /// The state machine gave up waiting; the monitor takes over the funds.
    WithdrawalAbandoned { request_id: u64 },

    /// The request left PENDING on-chain before its funds were forwarded.
    /// Nothing is owed to the vault any more.
    WithdrawalCancelled { request_id: u64 },

    /// A mint is about to send `amount` to the wallet.
    DepositExpected { request_id: u64, amount: Decimal },

    /// Deposit handling finished; `forwarded` went on to the exchange.
    DepositSettled { request_id: u64, forwarded: Decimal },
}

pub type NoticeSender = mpsc::UnboundedSender<WalletNotice>;
pub type NoticeReceiver = mpsc::UnboundedReceiver<WalletNotice>;

pub fn channel() -> (NoticeSender, NoticeReceiver) {
    mpsc::unbounded_channel()
}
