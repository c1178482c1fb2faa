//! # Deposit Queue Processor
//!
//! Drains the on-chain deposit queue: mints shares, forwards the
//! settlement funds to the exchange and opens the matching hedge.
//!
//! ## Per-Entry Flow
//!
//! ```text
//! DepositRequest #n (processed = false, amount > dust)
//!              │
//!              ├── 1. invoke process_deposit(n)      → vault mints shares,
//!              │                                       pays out the settlement leg
//!              ├── 2. wait settle_delay
//!              ├── 3. read operator balance          → received ≈ amount × leg ratio
//!              ├── 4. exchange.deposit(received)
//!              └── 5. open_short(received × leverage)
//! ```
//!
//! The scan walks ids from 0 and stops at the first slot with a zero
//! user, since requests are append-only and contiguous. A failure on one
//! entry is logged and the scan moves on. A failed mint leaves the entry
//! unprocessed on-chain, so the next tick retries it from step 1. Funds
//! minted but not forwarded are handed to the balance monitor through
//! `DepositSettled`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, info, warn};

use super::notices::{NoticeSender, WalletNotice};
use super::runner::{Processor, Trigger};
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::exchange::ExchangeGateway;
use crate::ledger::LedgerGateway;
use crate::models::{Asset, DepositRequest, QueueKind};
use crate::utils::format_usd;

/// Outcome of one deposit scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub scanned: u64,
    pub processed: u64,
    pub failed: u64,
}

/// The deposit queue loop.
pub struct DepositQueueProcessor {
    ledger: Arc<dyn LedgerGateway>,
    exchange: Arc<dyn ExchangeGateway>,
    notices: NoticeSender,
    config: EngineConfig,

    last_processed_id: Mutex<Option<u64>>,
    queue_length: AtomicU64,
    total_processed: AtomicU64,
}

impl DepositQueueProcessor {
    pub fn new(
        ledger: Arc<dyn LedgerGateway>,
        exchange: Arc<dyn ExchangeGateway>,
        notices: NoticeSender,
        config: EngineConfig,
    ) -> Self {
        Self {
            ledger,
            exchange,
            notices,
            config,
            last_processed_id: Mutex::new(None),
            queue_length: AtomicU64::new(0),
            total_processed: AtomicU64::new(0),
        }
    }

    /// Scan the queue and process every actionable entry.
    pub async fn process_pending_deposits(&self) -> Result<ScanReport, EngineError> {
        let mut report = ScanReport::default();

        match self.ledger.queue_length(QueueKind::Deposit).await {
            Ok(length) => self.queue_length.store(length, Ordering::Relaxed),
            Err(e) => debug!("Deposit queue length unavailable: {}", e),
        }

        for request_id in 0..self.config.max_deposit_scan {
            let request = match self.ledger.read_deposit(request_id).await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => match EngineError::from(e) {
                    EngineError::InvalidData(reason) => {
                        warn!("Skipping unreadable deposit #{}: {}", request_id, reason);
                        continue;
                    }
                    other => return Err(other),
                },
            };
            report.scanned += 1;

            if request.is_sentinel() {
                debug!("End of deposit queue at #{}", request_id);
                break;
            }
            if request.processed || request.settlement_amount <= self.config.deposit_dust {
                continue;
            }

            info!(
                "💰 Deposit #{}: {} from {}",
                request_id,
                format_usd(request.settlement_amount),
                request.user
            );

            match self.process_deposit(&request).await {
                Ok(()) => {
                    report.processed += 1;
                    self.total_processed.fetch_add(1, Ordering::Relaxed);
                    *self.last_processed_id.lock() = Some(request_id);
                }
                Err(e) => {
                    report.failed += 1;
                    warn!("❌ Deposit #{} failed: {}", request_id, e);
                }
            }
        }

        Ok(report)
    }

    /// Mint, forward and hedge one deposit.
    async fn process_deposit(&self, request: &DepositRequest) -> Result<(), EngineError> {
        let request_id = request.request_id;
        let expected = request.settlement_amount * self.config.settlement_leg_ratio;

        self.notify(WalletNotice::DepositExpected {
            request_id,
            amount: expected,
        });

        let forwarded = self.mint_and_forward(request_id, expected).await;
        self.notify(WalletNotice::DepositSettled {
            request_id,
            forwarded: *forwarded.as_ref().unwrap_or(&Decimal::ZERO),
        });
        let received = forwarded?;

        let hedge = received * self.config.leverage;
        let order = self.exchange.open_short(&self.config.market, hedge).await?;
        if !order.is_done() {
            // Funds are on the exchange; the rebalancer closes the gap
            warn!("Hedge for deposit #{} not placed: {:?}", request_id, order.status);
        } else {
            info!("📈 Hedge opened for deposit #{}: {}", request_id, format_usd(hedge));
        }

        Ok(())
    }

    /// Steps 1-4. Returns the amount sent to the exchange.
    async fn mint_and_forward(&self, request_id: u64, expected: Decimal) -> Result<Decimal, EngineError> {
        let confirmation = self.ledger.invoke("process_deposit", &[request_id]).await?;
        info!("✓ Shares minted for deposit #{}: {}", request_id, confirmation.signature);

        if self.config.settle_delay > Duration::ZERO {
            tokio::time::sleep(self.config.settle_delay).await;
        }

        let operator = self.ledger.operator();
        let balance = self.ledger.balance_of(Asset::Settlement, &operator).await?;
        let received = expected.min(balance);

        if received <= Decimal::ZERO {
            return Err(EngineError::Transient(format!(
                "no settlement funds on operator wallet after minting #{}",
                request_id
            )));
        }
        if received < expected * (Decimal::ONE - self.config.receipt_tolerance) {
            warn!(
                "⚠️  Deposit #{} short: expected {}, wallet holds {}",
                request_id,
                format_usd(expected),
                format_usd(balance)
            );
        }

        let tx = self.exchange.deposit(received).await?;
        info!("🏦 Forwarded {} to exchange: {}", format_usd(received), tx);
        Ok(received)
    }

    fn notify(&self, notice: WalletNotice) {
        if self.notices.send(notice).is_err() {
            debug!("Balance monitor is gone, notice dropped");
        }
    }
}

#[async_trait]
impl Processor for DepositQueueProcessor {
    fn name(&self) -> &'static str {
        "deposit_processor"
    }

    fn interval(&self) -> Duration {
        self.config.deposit_interval
    }

    async fn tick(&self, _trigger: Trigger) -> Result<String, EngineError> {
        let report = self.process_pending_deposits().await?;
        Ok(format!(
            "scanned {}, processed {}, failed {}",
            report.scanned, report.processed, report.failed
        ))
    }

    fn details(&self) -> serde_json::Value {
        json!({
            "queueLength": self.queue_length.load(Ordering::Relaxed),
            "lastProcessedId": *self.last_processed_id.lock(),
            "totalProcessed": self.total_processed.load(Ordering::Relaxed),
            "scanLimit": self.config.max_deposit_scan,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::notices;
    use crate::testing::{deposit, test_config, FakeExchange, FakeLedger, Order};
    use rust_decimal_macros::dec;
    use solana_sdk::pubkey::Pubkey;

    fn processor(
        ledger: &Arc<FakeLedger>,
        exchange: &Arc<FakeExchange>,
    ) -> (DepositQueueProcessor, notices::NoticeReceiver) {
        let (tx, rx) = notices::channel();
        let p = DepositQueueProcessor::new(ledger.clone(), exchange.clone(), tx, test_config());
        (p, rx)
    }

    #[tokio::test]
    async fn test_processes_single_entry_and_halts_at_sentinel() {
        let ledger = FakeLedger::new();
        let exchange = FakeExchange::linked(ledger.clone());
        ledger.add_deposit(deposit(0, Pubkey::new_unique(), dec!(1000)));

        let (p, _rx) = processor(&ledger, &exchange);
        let report = p.process_pending_deposits().await.unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(ledger.calls_to("process_deposit"), vec![vec![0]]);
        // id 1 is the sentinel; nothing beyond it is read
        assert_eq!(*ledger.deposit_reads.lock(), vec![0, 1]);

        // Half of the recorded value is the transferable leg
        assert_eq!(*exchange.deposits.lock(), vec![dec!(500)]);
        assert_eq!(exchange.orders(), vec![Order::OpenShort(dec!(1000))]);
        assert_eq!(ledger.operator_balance(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_short_payout_forwards_and_hedges_what_arrived() {
        // Vault pays out 30% instead of the 50% leg
        let mut short = Arc::try_unwrap(FakeLedger::new()).ok().unwrap();
        short.payout_ratio = dec!(0.3);
        let ledger = Arc::new(short);
        let exchange = FakeExchange::linked(ledger.clone());
        ledger.add_deposit(deposit(0, Pubkey::new_unique(), dec!(1000)));

        let (p, mut rx) = processor(&ledger, &exchange);
        let report = p.process_pending_deposits().await.unwrap();

        assert_eq!(report.processed, 1);
        // $300 received against $500 expected, below the 10% tolerance
        assert_eq!(*exchange.deposits.lock(), vec![dec!(300)]);
        assert_eq!(exchange.orders(), vec![Order::OpenShort(dec!(600))]);

        let mut notices = Vec::new();
        while let Ok(notice) = rx.try_recv() {
            notices.push(notice);
        }
        assert_eq!(
            notices,
            vec![
                WalletNotice::DepositExpected { request_id: 0, amount: dec!(500) },
                WalletNotice::DepositSettled { request_id: 0, forwarded: dec!(300) },
            ]
        );
    }

    #[tokio::test]
    async fn test_second_scan_is_idempotent() {
        let ledger = FakeLedger::new();
        let exchange = FakeExchange::linked(ledger.clone());
        ledger.add_deposit(deposit(0, Pubkey::new_unique(), dec!(1000)));
        ledger.add_deposit(deposit(1, Pubkey::new_unique(), dec!(200)));

        let (p, _rx) = processor(&ledger, &exchange);
        p.process_pending_deposits().await.unwrap();
        let second = p.process_pending_deposits().await.unwrap();

        assert_eq!(second.processed, 0);
        assert_eq!(ledger.calls_to("process_deposit"), vec![vec![0], vec![1]]);
        assert_eq!(exchange.deposits.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_skips_dust_and_processed_entries() {
        let ledger = FakeLedger::new();
        let exchange = FakeExchange::linked(ledger.clone());
        let mut done = deposit(0, Pubkey::new_unique(), dec!(50));
        done.processed = true;
        ledger.add_deposit(done);
        ledger.add_deposit(deposit(1, Pubkey::new_unique(), dec!(0.01)));
        ledger.add_deposit(deposit(2, Pubkey::new_unique(), dec!(10)));

        let (p, _rx) = processor(&ledger, &exchange);
        p.process_pending_deposits().await.unwrap();

        assert_eq!(ledger.calls_to("process_deposit"), vec![vec![2]]);
        assert_eq!(*p.last_processed_id.lock(), Some(2));
    }

    #[tokio::test]
    async fn test_failed_forward_does_not_abort_scan() {
        let ledger = FakeLedger::new();
        let exchange = FakeExchange::linked(ledger.clone());
        ledger.add_deposit(deposit(0, Pubkey::new_unique(), dec!(100)));
        ledger.add_deposit(deposit(1, Pubkey::new_unique(), dec!(100)));
        // Operator wallet cannot pay the exchange: forward fails for both
        ledger.fail_transfers.store(true, Ordering::SeqCst);

        let (p, mut rx) = processor(&ledger, &exchange);
        let report = p.process_pending_deposits().await.unwrap();

        assert_eq!(report.failed, 2);
        assert_eq!(ledger.calls_to("process_deposit").len(), 2);
        assert!(exchange.orders().is_empty());

        // Each entry is reserved then released with nothing forwarded
        let mut settled = Vec::new();
        while let Ok(notice) = rx.try_recv() {
            if let WalletNotice::DepositSettled { request_id, forwarded } = notice {
                settled.push((request_id, forwarded));
            }
        }
        assert_eq!(settled, vec![(0, Decimal::ZERO), (1, Decimal::ZERO)]);
    }

    #[tokio::test]
    async fn test_read_only_mode_reports_capability() {
        let ledger = FakeLedger::read_only();
        let exchange = FakeExchange::new();
        ledger.add_deposit(deposit(0, Pubkey::new_unique(), dec!(100)));

        let (p, _rx) = processor(&ledger, &exchange);
        let report = p.process_pending_deposits().await.unwrap();

        assert_eq!(report.failed, 1);
        assert!(exchange.deposits.lock().is_empty());
    }
}
