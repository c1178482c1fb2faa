//! # Withdrawal State Machine
//!
//! Drives each withdrawal request from PENDING to READY.
//!
//! ## States
//!
//! ```text
//!            observed PENDING, not in flight
//! PENDING ───────────────────────────────────► closing_position
//!                                                   │ close hedge, request exchange withdrawal
//!                                                   ▼
//!                                           waiting_settlement
//!                                                   │ wallet balance ≥ due
//!                                                   │ forward to vault, mark_withdrawal_ready
//!                                                   ▼
//!                                                 READY
//! ```
//!
//! The in-flight entries live in memory, keyed by request id. An entry is
//! inserted under the lock before any work starts, so a request observed
//! PENDING twice is only ever started once. Any failure before the funds
//! are forwarded drops the entry and the next tick starts the request
//! again from the close step, which tolerates a hedge that is already
//! closed.
//!
//! Each tick first advances waiting entries, then scans the queue for new
//! PENDING requests. A waiting entry re-reads its request before the
//! forward and again before mark-ready. Once the request is READY,
//! COMPLETED or CANCELLED the entry is dropped, and unforwarded funds go
//! to the balance monitor as a deposit.
//!
//! Arrival is judged from the wallet balance less what the monitor has
//! already attributed elsewhere. Inflow the monitor has not classified
//! yet can still be mistaken for the exchange payout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::balance_monitor::SharedBook;
use super::notices::{NoticeSender, WalletNotice};
use super::runner::{Processor, Trigger};
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::exchange::ExchangeGateway;
use crate::ledger::LedgerGateway;
use crate::models::{Asset, CloseSize, OrderStatus, QueueKind, WithdrawalRequest, WithdrawalStatus};
use crate::utils::{format_usd, to_fixed, SETTLEMENT_DECIMALS};

/// Where an in-flight withdrawal is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    ClosingPosition,
    WaitingSettlement,
}

/// A withdrawal between "observed PENDING" and READY.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingEntry {
    pub step: Step,

    /// Settlement asset to receive from the exchange and forward.
    pub settlement_due: Decimal,

    pub started_at: DateTime<Utc>,

    /// Funds already sent to the vault; only mark-ready remains.
    pub forwarded: bool,

    #[serde(skip)]
    waiting_since: Option<Instant>,
}

impl ProcessingEntry {
    fn new() -> Self {
        Self {
            step: Step::ClosingPosition,
            settlement_due: Decimal::ZERO,
            started_at: Utc::now(),
            forwarded: false,
            waiting_since: None,
        }
    }
}

/// Outcome of one tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub started: u64,
    pub ready: u64,
    pub waiting: u64,
    pub failed: u64,
    pub abandoned: u64,
    /// Dropped because the request closed on-chain.
    pub closed: u64,
}

/// The withdrawal loop.
pub struct WithdrawalStateMachine {
    ledger: Arc<dyn LedgerGateway>,
    exchange: Arc<dyn ExchangeGateway>,
    notices: NoticeSender,
    /// Monitor's view of the wallet, read to judge arrival.
    wallet: SharedBook,
    config: EngineConfig,

    /// In-flight withdrawals; also the de-duplication set.
    entries: Mutex<HashMap<u64, ProcessingEntry>>,
}

impl WithdrawalStateMachine {
    pub fn new(
        ledger: Arc<dyn LedgerGateway>,
        exchange: Arc<dyn ExchangeGateway>,
        notices: NoticeSender,
        wallet: SharedBook,
        config: EngineConfig,
    ) -> Self {
        Self {
            ledger,
            exchange,
            notices,
            wallet,
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Claim a request for processing.
    ///
    /// ## Returns
    ///
    /// `false` if the request is already in flight.
    fn try_begin(&self, request_id: u64) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(&request_id) {
            return false;
        }
        entries.insert(request_id, ProcessingEntry::new());
        true
    }

    fn clear(&self, request_id: u64) {
        self.entries.lock().remove(&request_id);
    }

    fn update(&self, request_id: u64, f: impl FnOnce(&mut ProcessingEntry)) {
        if let Some(entry) = self.entries.lock().get_mut(&request_id) {
            f(entry);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn entry(&self, request_id: u64) -> Option<ProcessingEntry> {
        self.entries.lock().get(&request_id).cloned()
    }

    /// One full pass: advance waiting entries, then start new ones.
    pub async fn run_cycle(&self) -> Result<TickReport, EngineError> {
        let mut report = TickReport::default();
        self.check_processing(&mut report).await?;
        self.scan_pending(&mut report).await?;
        Ok(report)
    }

    /// Find PENDING requests and start them.
    async fn scan_pending(&self, report: &mut TickReport) -> Result<(), EngineError> {
        let length = self.ledger.queue_length(QueueKind::Withdrawal).await?;

        for request_id in 0..length {
            let request = match self.ledger.read_withdrawal(request_id).await {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Skipping unreadable withdrawal #{}: {}", request_id, e);
                    continue;
                }
            };

            if request.status != WithdrawalStatus::Pending {
                continue;
            }
            if !self.try_begin(request_id) {
                debug!("Withdrawal #{} already in flight", request_id);
                continue;
            }

            match self.start_processing(&request).await {
                Ok(()) => report.started += 1,
                Err(e) => {
                    self.clear(request_id);
                    report.failed += 1;
                    warn!("❌ Withdrawal #{} failed to start, will retry: {}", request_id, e);
                }
            }
        }

        Ok(())
    }

    /// Value the shares, close the hedge slice and request exchange funds.
    async fn start_processing(&self, request: &WithdrawalRequest) -> Result<(), EngineError> {
        let request_id = request.request_id;
        info!("🔄 Starting withdrawal #{} ({} shares)", request_id, request.shares);

        let mut value = self.ledger.preview_redeem(request.shares).await?;
        if value <= Decimal::ZERO {
            value = request.settlement_value;
        }
        if value <= Decimal::ZERO {
            return Err(EngineError::InvalidData(format!(
                "withdrawal #{} has no redeemable value",
                request_id
            )));
        }

        // Only the settlement leg sits on the exchange
        let due = value * self.config.settlement_leg_ratio;
        self.update(request_id, |e| e.settlement_due = due);

        self.close_proportional(due).await?;

        let operator = self.ledger.operator();
        let receipt = self.exchange.request_withdrawal(due, &operator).await?;
        info!(
            "✅ Exchange withdrawal {} requested for {} (#{})",
            receipt.id,
            format_usd(due),
            request_id
        );

        self.notify(WalletNotice::WithdrawalExpected {
            request_id,
            amount: due,
        });
        self.update(request_id, |e| {
            e.step = Step::WaitingSettlement;
            e.waiting_since = Some(Instant::now());
        });
        Ok(())
    }

    /// Close the hedge notional backing `due`.
    ///
    /// Full close if the slice covers the whole position.
    async fn close_proportional(&self, due: Decimal) -> Result<(), EngineError> {
        let market = &self.config.market;
        let positions = self.exchange.positions(market).await?;
        let open_notional: Decimal = positions.iter().map(|p| p.value.abs()).sum();
        if open_notional <= Decimal::ZERO {
            debug!("No hedge open, nothing to close");
            return Ok(());
        }

        let close_usd = due * self.config.leverage;
        let size = if open_notional > close_usd {
            let mark = self.exchange.mark_price(market).await?;
            if mark <= Decimal::ZERO {
                return Err(EngineError::InvalidData(format!("mark price {}", mark)));
            }
            CloseSize::Base(close_usd / mark)
        } else {
            CloseSize::All
        };

        let result = self.exchange.close(market, size).await?;
        match result.status {
            OrderStatus::Accepted | OrderStatus::NothingToClose | OrderStatus::TooSmall => Ok(()),
            OrderStatus::Rejected(reason) => Err(EngineError::Transient(format!(
                "close rejected: {}",
                reason
            ))),
        }
    }

    /// Advance every entry waiting for settlement.
    async fn check_processing(&self, report: &mut TickReport) -> Result<(), EngineError> {
        let waiting: Vec<(u64, ProcessingEntry)> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| e.step == Step::WaitingSettlement)
            .map(|(id, e)| (*id, e.clone()))
            .collect();

        if waiting.is_empty() {
            return Ok(());
        }

        let operator = self.ledger.operator();
        let balance = self.ledger.balance_of(Asset::Settlement, &operator).await?;
        let mut spent = Decimal::ZERO;

        for (request_id, entry) in waiting {
            match self.still_open(request_id).await {
                Ok(true) => {}
                Ok(false) => {
                    self.drop_closed(request_id, entry.forwarded);
                    report.closed += 1;
                    continue;
                }
                Err(e) => {
                    warn!("Withdrawal #{} unreadable, holding: {}", request_id, e);
                    report.failed += 1;
                    continue;
                }
            }

            if !entry.forwarded {
                let available =
                    self.wallet.lock().available_for_withdrawal(request_id, balance) - spent;
                if available < entry.settlement_due {
                    let timed_out = entry
                        .waiting_since
                        .map(|since| since.elapsed() >= self.config.settlement_timeout)
                        .unwrap_or(false);
                    if timed_out {
                        warn!(
                            "⌛ Withdrawal #{} waited too long for {}, restarting",
                            request_id,
                            format_usd(entry.settlement_due)
                        );
                        self.clear(request_id);
                        self.notify(WalletNotice::WithdrawalAbandoned { request_id });
                        report.abandoned += 1;
                    } else {
                        report.waiting += 1;
                    }
                    continue;
                }

                info!("✅ Funds arrived for withdrawal #{}", request_id);
                let vault = self.ledger.vault();
                match self
                    .ledger
                    .transfer(Asset::Settlement, &vault, entry.settlement_due)
                    .await
                {
                    Ok(tx) => {
                        spent += entry.settlement_due;
                        self.update(request_id, |e| e.forwarded = true);
                        self.notify(WalletNotice::WithdrawalForwarded {
                            request_id,
                            amount: entry.settlement_due,
                        });
                        info!(
                            "📤 Forwarded {} to vault: {}",
                            format_usd(entry.settlement_due),
                            tx.signature
                        );
                    }
                    Err(e) => {
                        warn!("Forward for withdrawal #{} failed: {}", request_id, e);
                        report.failed += 1;
                        continue;
                    }
                }

                // The request may have closed while the transfer confirmed
                match self.still_open(request_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        self.drop_closed(request_id, true);
                        report.closed += 1;
                        continue;
                    }
                    Err(e) => {
                        warn!("Withdrawal #{} unreadable after forward: {}", request_id, e);
                        report.failed += 1;
                        continue;
                    }
                }
            }

            match self.mark_ready(request_id, entry.settlement_due).await {
                Ok(()) => {
                    self.clear(request_id);
                    report.ready += 1;
                }
                Err(e) => {
                    error!("Withdrawal #{} forwarded but not marked ready: {}", request_id, e);
                    report.failed += 1;
                }
            }
        }

        Ok(())
    }

    /// `false` once the request needs nothing more from the engine.
    async fn still_open(&self, request_id: u64) -> Result<bool, EngineError> {
        Ok(match self.ledger.read_withdrawal(request_id).await? {
            Some(request) => !request.status.is_terminal_for_engine(),
            None => false,
        })
    }

    /// Forget an in-flight request that closed on-chain.
    fn drop_closed(&self, request_id: u64, forwarded: bool) {
        self.clear(request_id);
        if forwarded {
            warn!(
                "Withdrawal #{} closed on-chain after its funds reached the vault, not marking ready",
                request_id
            );
        } else {
            info!(
                "Withdrawal #{} closed on-chain while in flight, funds return to the exchange",
                request_id
            );
            self.notify(WalletNotice::WithdrawalCancelled { request_id });
        }
    }

    async fn mark_ready(&self, request_id: u64, amount: Decimal) -> Result<(), EngineError> {
        let raw = to_fixed(amount, SETTLEMENT_DECIMALS).map_err(EngineError::InvalidData)?;
        self.ledger
            .invoke("mark_withdrawal_ready", &[request_id, raw])
            .await?;
        info!("✅ Withdrawal #{} marked READY ({})", request_id, format_usd(amount));
        Ok(())
    }

    fn notify(&self, notice: WalletNotice) {
        if self.notices.send(notice).is_err() {
            debug!("Balance monitor is gone, notice dropped");
        }
    }
}

#[async_trait]
impl Processor for WithdrawalStateMachine {
    fn name(&self) -> &'static str {
        "withdrawal_processor"
    }

    fn interval(&self) -> Duration {
        self.config.withdrawal_interval
    }

    async fn tick(&self, _trigger: Trigger) -> Result<String, EngineError> {
        let r = self.run_cycle().await?;
        Ok(format!(
            "started {}, ready {}, waiting {}, failed {}, abandoned {}, closed {}",
            r.started, r.ready, r.waiting, r.failed, r.abandoned, r.closed
        ))
    }

    fn details(&self) -> serde_json::Value {
        let entries = self.entries.lock();
        let processing: HashMap<String, &ProcessingEntry> =
            entries.iter().map(|(id, e)| (id.to_string(), e)).collect();
        json!({
            "processingCount": entries.len(),
            "processing": processing,
        })
    }
}
