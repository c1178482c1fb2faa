//! # Engine Supervisor
//!
//! Builds the five processors around injected gateways and owns their
//! handles. The control plane talks to the engine only through this type.
//!
//! ```text
//!                 ┌──────────────── Engine ────────────────┐
//!                 │                                         │
//! LedgerGateway ──┤  DepositQueueProcessor ──┐              │
//!                 │  WithdrawalStateMachine ─┼─ notices ─┐  │
//! ExchangeGateway ┤  PositionRebalancer ◄────┼───────────┤  │
//!                 │  NavReporter             │           ▼  │
//! BalanceStore ───┤                          └──► BalanceMonitor
//!                 └─────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use futures::future::join_all;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::balance_monitor::BalanceMonitor;
use super::deposit_processor::DepositQueueProcessor;
use super::nav_reporter::NavReporter;
use super::notices;
use super::position_manager::PositionRebalancer;
use super::runner::ProcessorHandle;
use super::withdrawal_processor::WithdrawalStateMachine;
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::exchange::ExchangeGateway;
use crate::ledger::LedgerGateway;
use crate::models::ProcessorStatus;
use crate::store::BalanceStore;

pub struct Engine {
    ledger: Arc<dyn LedgerGateway>,
    nav_reporter: Arc<NavReporter>,
    handles: Vec<ProcessorHandle>,
}

impl Engine {
    /// Construct every processor. Nothing runs until [`Engine::start_all`].
    ///
    /// ## Arguments
    ///
    /// * `shutdown` - Engine-wide token; cancelling it stops every loop
    pub async fn new(
        ledger: Arc<dyn LedgerGateway>,
        exchange: Arc<dyn ExchangeGateway>,
        store: Arc<dyn BalanceStore>,
        config: EngineConfig,
        shutdown: CancellationToken,
    ) -> Result<Self, EngineError> {
        let (notice_tx, notice_rx) = notices::channel();

        let rebalancer = Arc::new(PositionRebalancer::new(
            ledger.clone(),
            exchange.clone(),
            config.clone(),
        ));
        let nav_reporter = Arc::new(NavReporter::new(
            ledger.clone(),
            exchange.clone(),
            config.clone(),
        ));
        let deposits = Arc::new(DepositQueueProcessor::new(
            ledger.clone(),
            exchange.clone(),
            notice_tx.clone(),
            config.clone(),
        ));
        let monitor = Arc::new(
            BalanceMonitor::load(
                ledger.clone(),
                exchange.clone(),
                store,
                rebalancer.clone(),
                notice_rx,
                config.clone(),
            )
            .await?,
        );
        let withdrawals = Arc::new(WithdrawalStateMachine::new(
            ledger.clone(),
            exchange,
            notice_tx,
            monitor.book(),
            config,
        ));

        let handles = vec![
            ProcessorHandle::new(deposits, shutdown.clone()),
            ProcessorHandle::new(withdrawals, shutdown.clone()),
            ProcessorHandle::new(rebalancer, shutdown.clone()),
            ProcessorHandle::new(nav_reporter.clone(), shutdown.clone()),
            ProcessorHandle::new(monitor, shutdown),
        ];

        Ok(Self {
            ledger,
            nav_reporter,
            handles,
        })
    }

    pub fn start_all(&self) {
        for handle in &self.handles {
            handle.start();
        }
        info!("🚀 {} processors started", self.running_count());
    }

    /// Stop every loop, waiting for in-progress ticks to finish.
    pub async fn stop_all(&self) {
        join_all(self.handles.iter().map(|h| h.stop())).await;
        info!("🛑 All processors stopped");
    }

    pub fn get(&self, name: &str) -> Option<&ProcessorHandle> {
        self.handles.iter().find(|h| h.name() == name)
    }

    pub fn statuses(&self) -> Vec<ProcessorStatus> {
        self.handles.iter().map(|h| h.status()).collect()
    }

    pub fn running_count(&self) -> usize {
        self.handles.iter().filter(|h| h.is_running()).count()
    }

    pub fn can_sign(&self) -> bool {
        self.ledger.can_sign()
    }

    /// Report NAV now, optionally with an operator-supplied value.
    ///
    /// The change bound still applies. The outcome shows up in the NAV
    /// reporter's status.
    pub async fn force_nav_update(&self, nav: Option<Decimal>) -> Result<String, EngineError> {
        let outcome = self.nav_reporter.force_update(nav).await;
        if let Some(handle) = self.get("nav_reporter") {
            handle.record(&outcome);
        }
        outcome
    }
}
