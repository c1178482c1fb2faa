//! # Position Rebalancer
//!
//! Keeps the exchange short aligned with the vault's risk-asset holdings
//! and takes the hedge off while funding is paid rather than earned.
//!
//! ## Delta
//!
//! ```text
//! risk_value = risk_asset_held × mark_price
//! total_nav  = risk_value + exchange equity
//! delta      = (risk_value − hedge_notional) / total_nav
//! ```
//!
//! | Condition | Action |
//! |-----------|--------|
//! | `|delta| ≤ band` | nothing |
//! | adjustment > +floor | open short for the difference |
//! | adjustment < −floor | buy back the difference |
//! | otherwise | skipped as dust |
//!
//! ## Cadence
//!
//! Each tick (funding interval, 60s by default) records a health snapshot
//! and applies the funding guard. The delta pass runs once per rebalance
//! interval, on every manual tick, and after the balance monitor sends
//! new deposits to the exchange.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::runner::{Processor, Trigger};
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::exchange::ExchangeGateway;
use crate::ledger::LedgerGateway;
use crate::models::{CloseSize, OrderStatus};
use crate::utils::format_usd;

/// Position and funding metrics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    /// Short size in base units, zero when flat.
    pub position_size: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub unrealised_pnl: Decimal,
    pub funding_rate: Decimal,
    pub margin_ratio: Decimal,
    /// Funding APY of the hedge, in percent.
    pub estimated_apy: Decimal,
    pub healthy: bool,
    pub checked_at: DateTime<Utc>,
}

/// Annualised funding yield in percent: `rate × 24 × 365 × leverage × 100`.
pub fn estimated_apy(hourly_rate: Decimal, leverage: Decimal) -> Decimal {
    hourly_rate * dec!(24) * dec!(365) * leverage * dec!(100)
}

/// Inputs and result of one delta computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaReading {
    pub risk_value: Decimal,
    pub hedge_notional: Decimal,
    pub total_nav: Decimal,
    pub delta: Decimal,
}

impl DeltaReading {
    pub fn new(risk_value: Decimal, hedge_notional: Decimal, equity: Decimal) -> Option<Self> {
        let total_nav = risk_value + equity;
        if total_nav <= Decimal::ZERO {
            return None;
        }
        Some(Self {
            risk_value,
            hedge_notional,
            total_nav,
            delta: (risk_value - hedge_notional) / total_nav,
        })
    }

    /// Signed USD change to the short that restores neutrality.
    pub fn adjustment(&self) -> Decimal {
        self.risk_value - self.hedge_notional
    }
}

/// The hedge maintenance loop.
pub struct PositionRebalancer {
    ledger: Arc<dyn LedgerGateway>,
    exchange: Arc<dyn ExchangeGateway>,
    config: EngineConfig,

    /// Set while the hedge is off because funding went negative.
    closed_for_funding: AtomicBool,

    /// Serializes strategy passes from this loop and the balance monitor.
    strategy_lock: tokio::sync::Mutex<()>,

    last_strategy_run: Mutex<Option<Instant>>,
    last_health: Mutex<Option<HealthSnapshot>>,
    last_delta: Mutex<Option<DeltaReading>>,
}

impl PositionRebalancer {
    pub fn new(
        ledger: Arc<dyn LedgerGateway>,
        exchange: Arc<dyn ExchangeGateway>,
        config: EngineConfig,
    ) -> Self {
        Self {
            ledger,
            exchange,
            config,
            closed_for_funding: AtomicBool::new(false),
            strategy_lock: tokio::sync::Mutex::new(()),
            last_strategy_run: Mutex::new(None),
            last_health: Mutex::new(None),
            last_delta: Mutex::new(None),
        }
    }

    pub fn is_closed_for_funding(&self) -> bool {
        self.closed_for_funding.load(Ordering::SeqCst)
    }

    pub fn last_health(&self) -> Option<HealthSnapshot> {
        self.last_health.lock().clone()
    }

    /// Read position and funding metrics, warn on high margin usage.
    pub async fn check_health(&self) -> Result<HealthSnapshot, EngineError> {
        let market = &self.config.market;
        let positions = self.exchange.positions(market).await?;
        let funding_rate = self.exchange.funding_rate(market).await?;
        let balance = self.exchange.account_balance().await?;

        let position_size: Decimal = positions.iter().map(|p| p.size).sum();
        let first = positions.first();
        let margin_ratio = balance.margin_ratio;

        let snapshot = HealthSnapshot {
            position_size,
            entry_price: first.map(|p| p.open_price).unwrap_or_default(),
            mark_price: first.map(|p| p.mark_price).unwrap_or_default(),
            unrealised_pnl: positions.iter().map(|p| p.unrealised_pnl).sum(),
            funding_rate,
            margin_ratio,
            estimated_apy: estimated_apy(funding_rate, self.config.leverage),
            healthy: margin_ratio < self.config.margin_unhealthy_ratio,
            checked_at: Utc::now(),
        };

        if position_size > Decimal::ZERO {
            if margin_ratio > self.config.margin_warning_ratio {
                warn!("⚠️  HIGH MARGIN RATIO: {}", margin_ratio);
            }
            if !snapshot.healthy {
                error!("🚨 Position unhealthy (margin ratio {}), consider intervention", margin_ratio);
            }
        }

        *self.last_health.lock() = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Close the hedge while funding is below the threshold.
    ///
    /// Returns a description of what changed, if anything.
    async fn apply_funding_guard(&self, funding_rate: Decimal) -> Result<Option<String>, EngineError> {
        if funding_rate < self.config.negative_funding_threshold {
            if self.is_closed_for_funding() {
                return Ok(None);
            }
            warn!("📉 Funding rate {} below threshold, closing hedge", funding_rate);
            let result = self.exchange.close(&self.config.market, CloseSize::All).await?;
            if !result.is_done() {
                return Err(EngineError::Transient(format!(
                    "funding close not filled: {:?}",
                    result.status
                )));
            }
            self.closed_for_funding.store(true, Ordering::SeqCst);
            return Ok(Some(format!("hedge closed, funding {}", funding_rate)));
        }

        if funding_rate > Decimal::ZERO && self.closed_for_funding.swap(false, Ordering::SeqCst) {
            info!("📈 Funding rate {} positive again, hedge may reopen", funding_rate);
            return Ok(Some("funding latch cleared".to_string()));
        }

        Ok(None)
    }

    /// Measure delta and adjust the hedge if it left the band.
    pub async fn execute_strategy(&self) -> Result<String, EngineError> {
        let _guard = self.strategy_lock.lock().await;
        *self.last_strategy_run.lock() = Some(Instant::now());

        let market = &self.config.market;
        let risk_units = self.ledger.risk_asset_held().await?;
        let mark = self.exchange.mark_price(market).await?;
        let hedge_notional: Decimal = self
            .exchange
            .positions(market)
            .await?
            .iter()
            .map(|p| p.value.abs())
            .sum();
        let equity = self.exchange.account_balance().await?.equity;

        let risk_value = risk_units * mark;
        if risk_value <= Decimal::ZERO {
            return Err(EngineError::SafetyRule("vault holds no risk asset".to_string()));
        }
        let reading = DeltaReading::new(risk_value, hedge_notional, equity)
            .ok_or_else(|| EngineError::InvalidData("total NAV is not positive".to_string()))?;
        *self.last_delta.lock() = Some(reading.clone());

        debug!(
            "Delta {:.4}: risk {} vs hedge {} (NAV {})",
            reading.delta,
            format_usd(reading.risk_value),
            format_usd(reading.hedge_notional),
            format_usd(reading.total_nav)
        );

        if reading.delta.abs() <= self.config.delta_band {
            return Ok(format!("delta {:.4} within band", reading.delta));
        }

        let adjustment = reading.adjustment();
        if adjustment.abs() < self.config.min_adjustment_usd {
            return Err(EngineError::SafetyRule(format!(
                "adjustment {} below {}",
                format_usd(adjustment),
                format_usd(self.config.min_adjustment_usd)
            )));
        }

        if adjustment > Decimal::ZERO {
            if self.is_closed_for_funding() {
                return Err(EngineError::SafetyRule(
                    "hedge increase held while funding is negative".to_string(),
                ));
            }
            info!("📈 Increasing hedge by {} (delta {:.4})", format_usd(adjustment), reading.delta);
            let result = self.exchange.open_short(market, adjustment).await?;
            Self::expect_filled(&result.status)?;
            Ok(format!("hedge increased by {}", format_usd(adjustment)))
        } else {
            let usd = adjustment.abs();
            if mark <= Decimal::ZERO {
                return Err(EngineError::InvalidData(format!("mark price {}", mark)));
            }
            info!("📉 Decreasing hedge by {} (delta {:.4})", format_usd(usd), reading.delta);
            let result = self.exchange.close(market, CloseSize::Base(usd / mark)).await?;
            Self::expect_filled(&result.status)?;
            Ok(format!("hedge decreased by {}", format_usd(usd)))
        }
    }

    fn expect_filled(status: &OrderStatus) -> Result<(), EngineError> {
        match status {
            OrderStatus::Accepted | OrderStatus::NothingToClose => Ok(()),
            OrderStatus::TooSmall => Err(EngineError::SafetyRule("order below exchange minimum".into())),
            OrderStatus::Rejected(reason) => Err(EngineError::Transient(format!("order rejected: {}", reason))),
        }
    }

    fn strategy_due(&self) -> bool {
        match *self.last_strategy_run.lock() {
            Some(at) => at.elapsed() >= self.config.rebalance_interval,
            None => true,
        }
    }
}

#[async_trait]
impl Processor for PositionRebalancer {
    fn name(&self) -> &'static str {
        "position_rebalancer"
    }

    fn interval(&self) -> Duration {
        self.config.funding_check_interval
    }

    async fn tick(&self, trigger: Trigger) -> Result<String, EngineError> {
        let health = self.check_health().await?;
        let mut actions = Vec::new();

        if let Some(action) = self.apply_funding_guard(health.funding_rate).await? {
            actions.push(action);
        }

        if trigger == Trigger::Manual || self.strategy_due() {
            match self.execute_strategy().await {
                Ok(action) => actions.push(action),
                // A deliberate skip is not a failed tick
                Err(EngineError::SafetyRule(reason)) => actions.push(format!("skipped: {}", reason)),
                Err(e) => return Err(e),
            }
        }

        if actions.is_empty() {
            actions.push(format!("healthy={}, funding {}", health.healthy, health.funding_rate));
        }
        Ok(actions.join("; "))
    }

    fn details(&self) -> serde_json::Value {
        json!({
            "closedForFunding": self.is_closed_for_funding(),
            "health": *self.last_health.lock(),
            "lastDelta": *self.last_delta.lock(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_config, FakeExchange, FakeLedger, Order};

    /// $100 of risk asset at a $50,000 mark.
    fn setup(hedge: Decimal, equity: Decimal) -> (Arc<FakeLedger>, Arc<FakeExchange>, PositionRebalancer) {
        let ledger = FakeLedger::new();
        let exchange = FakeExchange::new();
        *ledger.risk_held.lock() = dec!(0.002);
        exchange.set_short_notional(hedge);
        exchange.set_equity(equity);
        let rebalancer = PositionRebalancer::new(ledger.clone(), exchange.clone(), test_config());
        (ledger, exchange, rebalancer)
    }

    #[test]
    fn test_delta_reading() {
        let reading = DeltaReading::new(dec!(100), dec!(80), dec!(80)).unwrap();
        assert_eq!(reading.total_nav, dec!(180));
        assert!(reading.delta > dec!(0.111) && reading.delta < dec!(0.112));
        assert_eq!(reading.adjustment(), dec!(20));

        assert!(DeltaReading::new(Decimal::ZERO, Decimal::ZERO, Decimal::ZERO).is_none());
    }

    #[test]
    fn test_apy_estimate() {
        // 0.001%/h at 2x
        assert_eq!(estimated_apy(dec!(0.00001), dec!(2)), dec!(17.52));
    }

    #[tokio::test]
    async fn test_increases_hedge_when_net_long() {
        let (_ledger, exchange, rebalancer) = setup(dec!(80), dec!(80));

        let action = rebalancer.execute_strategy().await.unwrap();
        assert!(action.contains("increased"));
        assert_eq!(exchange.orders(), vec![Order::OpenShort(dec!(20))]);
    }

    #[tokio::test]
    async fn test_decreases_hedge_when_net_short() {
        let (_ledger, exchange, rebalancer) = setup(dec!(150), dec!(100));

        rebalancer.execute_strategy().await.unwrap();
        // $50 at $50,000
        assert_eq!(exchange.orders(), vec![Order::Close(CloseSize::Base(dec!(0.001)))]);
    }

    #[tokio::test]
    async fn test_within_band_does_nothing() {
        let (_ledger, exchange, rebalancer) = setup(dec!(98), dec!(100));

        let action = rebalancer.execute_strategy().await.unwrap();
        assert!(action.contains("within band"));
        assert!(exchange.orders().is_empty());
    }

    #[tokio::test]
    async fn test_dust_adjustment_is_skipped() {
        let (ledger, exchange, rebalancer) = setup(dec!(0), dec!(10));
        // $8 of risk asset, fully unhedged: delta is large, adjustment is dust
        *ledger.risk_held.lock() = dec!(0.00016);

        let result = rebalancer.execute_strategy().await;
        assert!(matches!(result, Err(EngineError::SafetyRule(_))));
        assert!(exchange.orders().is_empty());
    }

    #[tokio::test]
    async fn test_negative_funding_closes_once_and_latches() {
        let (_ledger, exchange, rebalancer) = setup(dec!(100), dec!(100));
        *exchange.funding_rate.lock() = dec!(-0.0005);

        rebalancer.tick(Trigger::Scheduled).await.unwrap();
        assert!(rebalancer.is_closed_for_funding());
        assert_eq!(exchange.short_notional(), Decimal::ZERO);

        // Still negative: no second close, and the delta pass may not reopen
        rebalancer.tick(Trigger::Manual).await.unwrap();
        let closes = exchange
            .orders()
            .iter()
            .filter(|o| matches!(o, Order::Close(CloseSize::All)))
            .count();
        assert_eq!(closes, 1);
        assert!(!exchange.orders().iter().any(|o| matches!(o, Order::OpenShort(_))));

        // Funding positive: latch clears and the manual pass reopens
        *exchange.funding_rate.lock() = dec!(0.00002);
        rebalancer.tick(Trigger::Manual).await.unwrap();
        assert!(!rebalancer.is_closed_for_funding());
        assert_eq!(exchange.orders().last(), Some(&Order::OpenShort(dec!(100))));
    }

    #[tokio::test]
    async fn test_health_flag_follows_configured_ratio() {
        let (_ledger, exchange, rebalancer) = setup(dec!(100), dec!(100));
        exchange.balance.lock().margin_ratio = dec!(0.75);

        let health = rebalancer.check_health().await.unwrap();
        assert!(!health.healthy);

        let ledger = FakeLedger::new();
        let lenient = PositionRebalancer::new(
            ledger,
            exchange.clone(),
            EngineConfig {
                margin_unhealthy_ratio: dec!(0.8),
                ..test_config()
            },
        );
        let health = lenient.check_health().await.unwrap();
        assert!(health.healthy);
        assert_eq!(health.margin_ratio, dec!(0.75));
    }

    #[tokio::test]
    async fn test_scheduled_tick_respects_rebalance_interval() {
        let (_ledger, exchange, rebalancer) = setup(dec!(80), dec!(80));

        rebalancer.tick(Trigger::Scheduled).await.unwrap();
        assert_eq!(exchange.orders().len(), 1);

        // Hedge drifts again, but the hourly pass already ran
        exchange.set_short_notional(dec!(50));
        rebalancer.tick(Trigger::Scheduled).await.unwrap();
        assert_eq!(exchange.orders().len(), 1);

        let health = rebalancer.last_health().unwrap();
        assert_eq!(health.funding_rate, dec!(0.00001));
    }
}
