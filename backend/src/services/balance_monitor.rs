//! # Balance Monitor
//!
//! Watches the operator wallet's settlement balance and decides what each
//! change belongs to. It is the only writer of [`PendingBalance`].
//!
//! ## Tick
//!
//! ```text
//! 1. drain WalletNotices       → open / release reservations
//! 2. read wallet balance, drain notices again
//! 3. classify increase since last observation:
//!      a. reserved funds other loops are expecting  → no action
//!      b. pending withdrawal funds                   → forward to vault
//!      c. anything left                              → pending_deposit
//! 4. forward unreserved pending withdrawals out of free funds
//! 5. pending_deposit ≥ minimum → deposit to exchange, run strategy pass
//! ```
//!
//! The record is saved after every step that changes it. Reservations
//! are in memory only, so after a restart every persisted pending
//! withdrawal is treated as unreserved and forwarded by this loop.
//!
//! ## Free Funds
//!
//! ```text
//! free = balance − reserved funds already arrived − pending_deposit
//! ```
//!
//! Only free funds are ever forwarded to the vault.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, info, warn};

use super::notices::{NoticeReceiver, WalletNotice};
use super::position_manager::PositionRebalancer;
use super::runner::{Processor, Trigger};
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::exchange::ExchangeGateway;
use crate::ledger::LedgerGateway;
use crate::models::{Asset, QueueKind};
use crate::store::{BalanceStore, PendingBalance};
use crate::utils::format_usd;

/// Funds another loop expects on the wallet and will move itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Reservation {
    amount: Decimal,
    /// Part of `amount` already seen arriving.
    arrived: Decimal,
}

impl Reservation {
    fn outstanding(&self) -> Decimal {
        (self.amount - self.arrived).max(Decimal::ZERO)
    }
}

/// How one balance increase was attributed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub increase: Decimal,
    pub reserved: Decimal,
    pub withdrawal: Decimal,
    pub deposit: Decimal,
}

/// Classification state, free of I/O.
#[derive(Debug, Default)]
pub struct WalletBook {
    balance: PendingBalance,
    reservations: HashMap<(QueueKind, u64), Reservation>,
}

impl WalletBook {
    pub fn new(balance: PendingBalance) -> Self {
        Self {
            balance,
            reservations: HashMap::new(),
        }
    }

    pub fn pending(&self) -> &PendingBalance {
        &self.balance
    }

    /// Apply a notice. Returns `true` if the persisted record changed.
    pub fn apply(&mut self, notice: WalletNotice) -> bool {
        match notice {
            WalletNotice::WithdrawalExpected { request_id, amount } => {
                self.balance.pending_withdrawal_amount += amount;
                self.reservations.insert(
                    (QueueKind::Withdrawal, request_id),
                    Reservation { amount, arrived: Decimal::ZERO },
                );
                true
            }
            WalletNotice::WithdrawalForwarded { request_id, amount } => {
                self.reservations.remove(&(QueueKind::Withdrawal, request_id));
                self.balance.pending_withdrawal_amount =
                    (self.balance.pending_withdrawal_amount - amount).max(Decimal::ZERO);
                true
            }
            WalletNotice::WithdrawalAbandoned { request_id } => {
                self.reservations.remove(&(QueueKind::Withdrawal, request_id));
                false
            }
            WalletNotice::WithdrawalCancelled { request_id } => {
                let Some(reservation) =
                    self.reservations.remove(&(QueueKind::Withdrawal, request_id))
                else {
                    return false;
                };
                self.balance.pending_withdrawal_amount =
                    (self.balance.pending_withdrawal_amount - reservation.amount).max(Decimal::ZERO);
                // Already on the wallet: goes back to the exchange instead
                self.balance.pending_deposit += reservation.arrived;
                true
            }
            WalletNotice::DepositExpected { request_id, amount } => {
                self.reservations.insert(
                    (QueueKind::Deposit, request_id),
                    Reservation { amount, arrived: Decimal::ZERO },
                );
                false
            }
            WalletNotice::DepositSettled { request_id, forwarded } => {
                let Some(reservation) = self.reservations.remove(&(QueueKind::Deposit, request_id))
                else {
                    return false;
                };
                // Arrived but never sent on: now an ordinary pending deposit
                let leftover = reservation.arrived - forwarded;
                if leftover > Decimal::ZERO {
                    self.balance.pending_deposit += leftover;
                    return true;
                }
                false
            }
        }
    }

    /// Reserved funds already sitting on the wallet.
    pub fn arrived_total(&self) -> Decimal {
        self.reservations.values().map(|r| r.arrived).sum()
    }

    /// Part of `pending_withdrawal_amount` no loop is handling.
    pub fn unreserved_withdrawal(&self) -> Decimal {
        let reserved: Decimal = self
            .reservations
            .iter()
            .filter(|((kind, _), _)| *kind == QueueKind::Withdrawal)
            .map(|(_, r)| r.amount)
            .sum();
        (self.balance.pending_withdrawal_amount - reserved).max(Decimal::ZERO)
    }

    /// Wallet funds nobody has claimed.
    pub fn free_funds(&self, current: Decimal) -> Decimal {
        (current - self.arrived_total() - self.balance.pending_deposit).max(Decimal::ZERO)
    }

    /// Wallet funds withdrawal `request_id` may count as arrived: the
    /// balance less classified deposits and what other reservations
    /// already hold. Inflow not yet classified still counts.
    pub fn available_for_withdrawal(&self, request_id: u64, current: Decimal) -> Decimal {
        let own = (QueueKind::Withdrawal, request_id);
        let claimed: Decimal = self
            .reservations
            .iter()
            .filter(|(key, _)| **key != own)
            .map(|(_, r)| r.arrived)
            .sum();
        (current - claimed - self.balance.pending_deposit).max(Decimal::ZERO)
    }

    /// Attribute the change since the last observation and move the
    /// baseline to `current`. Increases at or below `dust` that match
    /// nothing are ignored.
    pub fn classify(&mut self, current: Decimal, dust: Decimal) -> Classification {
        let last = self.balance.last_observed_balance;
        self.balance.last_observed_balance = current;

        let mut result = Classification::default();
        if current <= last {
            return result;
        }
        let mut remaining = current - last;
        result.increase = remaining;

        // Withdrawal reservations before deposit reservations
        let mut keys: Vec<(QueueKind, u64)> = self.reservations.keys().copied().collect();
        keys.sort_by_key(|(kind, id)| (*kind == QueueKind::Deposit, *id));
        for key in keys {
            if remaining <= Decimal::ZERO {
                break;
            }
            if let Some(reservation) = self.reservations.get_mut(&key) {
                let take = reservation.outstanding().min(remaining);
                reservation.arrived += take;
                remaining -= take;
                result.reserved += take;
            }
        }

        let withdrawal = self.unreserved_withdrawal().min(remaining);
        remaining -= withdrawal;
        result.withdrawal = withdrawal;

        if remaining > dust {
            self.balance.pending_deposit += remaining;
            result.deposit = remaining;
        }
        result
    }

    /// Amount of pending withdrawal funds the monitor may forward now.
    pub fn forwardable(&self, current: Decimal) -> Decimal {
        self.unreserved_withdrawal().min(self.free_funds(current))
    }

    pub fn record_forward(&mut self, amount: Decimal) {
        self.balance.pending_withdrawal_amount =
            (self.balance.pending_withdrawal_amount - amount).max(Decimal::ZERO);
        self.balance.last_observed_balance =
            (self.balance.last_observed_balance - amount).max(Decimal::ZERO);
    }

    /// Pending deposit actually present on the wallet.
    pub fn depositable(&self, current: Decimal) -> Decimal {
        self.balance
            .pending_deposit
            .min((current - self.arrived_total()).max(Decimal::ZERO))
    }

    pub fn record_deposit(&mut self, amount: Decimal) {
        self.balance.pending_deposit = (self.balance.pending_deposit - amount).max(Decimal::ZERO);
        self.balance.last_observed_balance =
            (self.balance.last_observed_balance - amount).max(Decimal::ZERO);
    }
}

/// The monitor's book, readable by the withdrawal state machine.
pub type SharedBook = Arc<Mutex<WalletBook>>;

/// The wallet classification loop.
pub struct BalanceMonitor {
    ledger: Arc<dyn LedgerGateway>,
    exchange: Arc<dyn ExchangeGateway>,
    store: Arc<dyn BalanceStore>,
    rebalancer: Arc<PositionRebalancer>,
    config: EngineConfig,

    notices: Mutex<NoticeReceiver>,
    book: SharedBook,
    /// False until a baseline balance exists.
    initialized: AtomicBool,
}

impl BalanceMonitor {
    /// Restore the last saved record, if any.
    pub async fn load(
        ledger: Arc<dyn LedgerGateway>,
        exchange: Arc<dyn ExchangeGateway>,
        store: Arc<dyn BalanceStore>,
        rebalancer: Arc<PositionRebalancer>,
        notices: NoticeReceiver,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let saved = store.load().await?;
        let initialized = saved.is_some();
        if let Some(saved) = &saved {
            info!(
                "💾 Restored balance state: deposit {}, withdrawal {}, last balance {}",
                format_usd(saved.pending_deposit),
                format_usd(saved.pending_withdrawal_amount),
                format_usd(saved.last_observed_balance)
            );
        }

        Ok(Self {
            ledger,
            exchange,
            store,
            rebalancer,
            config,
            notices: Mutex::new(notices),
            book: Arc::new(Mutex::new(WalletBook::new(saved.unwrap_or_default()))),
            initialized: AtomicBool::new(initialized),
        })
    }

    /// Shared handle on the book. Only the monitor writes through it.
    pub fn book(&self) -> SharedBook {
        self.book.clone()
    }

    pub fn pending(&self) -> PendingBalance {
        self.book.lock().pending().clone()
    }

    async fn save(&self) -> Result<(), EngineError> {
        let record = self.pending();
        self.store.save(&record).await?;
        Ok(())
    }

    /// Apply every queued notice. Returns `true` if the record changed.
    fn drain_notices(&self) -> bool {
        let mut receiver = self.notices.lock();
        let mut book = self.book.lock();
        let mut changed = false;
        while let Ok(notice) = receiver.try_recv() {
            debug!("Wallet notice: {:?}", notice);
            changed |= book.apply(notice);
        }
        changed
    }

    /// One full classification pass.
    pub async fn check_balance(&self) -> Result<String, EngineError> {
        let mut dirty = self.drain_notices();

        let operator = self.ledger.operator();
        let current = self.ledger.balance_of(Asset::Settlement, &operator).await?;
        // Notices sent while the read was in flight describe funds it may already include
        dirty |= self.drain_notices();

        if !self.initialized.load(Ordering::SeqCst) {
            self.book.lock().classify(current, Decimal::MAX);
            self.initialized.store(true, Ordering::SeqCst);
            self.save().await?;
            info!("📍 Balance baseline set at {}", format_usd(current));
            return Ok(format!("baseline {}", format_usd(current)));
        }

        let before = self.pending();
        let classification = self.book.lock().classify(current, self.config.balance_dust);
        if classification.increase > Decimal::ZERO {
            info!(
                "💵 Balance increased by {}: reserved {}, withdrawal {}, deposit {}",
                format_usd(classification.increase),
                format_usd(classification.reserved),
                format_usd(classification.withdrawal),
                format_usd(classification.deposit)
            );
        }
        dirty |= self.pending() != before;
        if dirty {
            self.save().await?;
        }

        let mut actions = Vec::new();
        let mut current = current;

        let forward = self.book.lock().forwardable(current);
        if forward > self.config.balance_dust {
            let vault = self.ledger.vault();
            let tx = self.ledger.transfer(Asset::Settlement, &vault, forward).await?;
            self.book.lock().record_forward(forward);
            self.save().await?;
            current -= forward;
            info!("📤 Forwarded {} pending withdrawal funds to vault: {}", format_usd(forward), tx.signature);
            actions.push(format!("forwarded {} to vault", format_usd(forward)));
        }

        let pending_deposit = self.pending().pending_deposit;
        if pending_deposit >= self.config.min_auto_deposit {
            let amount = self.book.lock().depositable(current);
            if amount >= self.config.min_auto_deposit {
                let tx = self.exchange.deposit(amount).await?;
                self.book.lock().record_deposit(amount);
                self.save().await?;
                info!("🏦 Deposited {} to exchange: {}", format_usd(amount), tx);
                actions.push(format!("deposited {} to exchange", format_usd(amount)));

                match self.rebalancer.execute_strategy().await {
                    Ok(summary) => actions.push(summary),
                    Err(e) => warn!("Strategy pass after deposit did not run: {}", e),
                }
            } else {
                debug!(
                    "Pending deposit {} not yet on wallet ({} available)",
                    format_usd(pending_deposit),
                    format_usd(amount)
                );
            }
        }

        if actions.is_empty() {
            actions.push(format!("balance {}", format_usd(current)));
        }
        Ok(actions.join("; "))
    }
}

#[async_trait]
impl Processor for BalanceMonitor {
    fn name(&self) -> &'static str {
        "balance_monitor"
    }

    fn interval(&self) -> Duration {
        self.config.balance_interval
    }

    async fn tick(&self, _trigger: Trigger) -> Result<String, EngineError> {
        self.check_balance().await
    }

    fn details(&self) -> serde_json::Value {
        let book = self.book.lock();
        json!({
            "pendingDeposit": book.pending().pending_deposit,
            "pendingWithdrawalAmount": book.pending().pending_withdrawal_amount,
            "lastObservedBalance": book.pending().last_observed_balance,
            "reservations": book.reservations.len(),
            "minAutoDeposit": self.config.min_auto_deposit,
        })
    }
}
