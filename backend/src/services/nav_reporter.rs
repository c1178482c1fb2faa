//! # NAV Reporter
//!
//! Publishes the exchange account equity to the vault as its NAV.
//!
//! ## Report Flow
//!
//! ```text
//! exchange equity (or operator override)
//!              ↓
//! reject if ≤ 0
//!              ↓
//! |nav − last| / last ≤ max change?  ── no ──► skip, state unchanged
//!              ↓ yes
//! invoke update_nav(nav × 10^6)
//!              ↓
//! last_reported_nav = nav, last_report_time = now
//! ```
//!
//! The first report (no previous NAV) is always within bounds. A forced
//! report skips the hourly wait but goes through the same bound.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use super::runner::{Processor, Trigger};
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::exchange::ExchangeGateway;
use crate::ledger::LedgerGateway;
use crate::utils::{format_usd, fraction_change, to_fixed, SETTLEMENT_DECIMALS};

/// Last NAV accepted by the vault.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NavState {
    pub last_reported_nav: Decimal,
    pub last_report_time: Option<DateTime<Utc>>,
}

impl NavState {
    /// Whether moving to `nav` stays within `max_change` of the last report.
    pub fn allows(&self, nav: Decimal, max_change: Decimal) -> bool {
        if self.last_reported_nav <= Decimal::ZERO {
            return true;
        }
        fraction_change(self.last_reported_nav, nav)
            .map(|change| change <= max_change)
            .unwrap_or(true)
    }
}

pub struct NavReporter {
    ledger: Arc<dyn LedgerGateway>,
    exchange: Arc<dyn ExchangeGateway>,
    config: EngineConfig,

    state: Mutex<NavState>,
    current_equity: Mutex<Option<Decimal>>,

    /// Serializes scheduled and forced reports.
    report_lock: tokio::sync::Mutex<()>,
}

impl NavReporter {
    pub fn new(
        ledger: Arc<dyn LedgerGateway>,
        exchange: Arc<dyn ExchangeGateway>,
        config: EngineConfig,
    ) -> Self {
        Self {
            ledger,
            exchange,
            config,
            state: Mutex::new(NavState::default()),
            current_equity: Mutex::new(None),
            report_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> NavState {
        self.state.lock().clone()
    }

    /// Report the current equity, or `nav` when given.
    ///
    /// ## Returns
    ///
    /// - `Ok(summary)` - The vault accepted the new NAV
    /// - `Err(SafetyRule)` - The change exceeds the bound; nothing was sent
    /// - `Err(InvalidData)` - The NAV is not positive
    pub async fn report(&self, nav: Option<Decimal>) -> Result<String, EngineError> {
        let _guard = self.report_lock.lock().await;

        let nav = match nav {
            Some(nav) => nav,
            None => {
                let equity = self.exchange.account_balance().await?.equity;
                *self.current_equity.lock() = Some(equity);
                equity
            }
        };

        if nav <= Decimal::ZERO {
            return Err(EngineError::InvalidData(format!("no equity to report ({})", nav)));
        }

        let state = self.state();
        let last = state.last_reported_nav;
        if !state.allows(nav, self.config.nav_max_change) {
            warn!(
                "NAV change too large, skipping update. Current: {}, New: {}",
                format_usd(last),
                format_usd(nav)
            );
            return Err(EngineError::SafetyRule(format!(
                "NAV {} → {} exceeds {} change",
                format_usd(last),
                format_usd(nav),
                self.config.nav_max_change
            )));
        }

        let raw = to_fixed(nav, SETTLEMENT_DECIMALS).map_err(EngineError::InvalidData)?;
        let confirmation = self.ledger.invoke("update_nav", &[raw]).await?;

        *self.state.lock() = NavState {
            last_reported_nav: nav,
            last_report_time: Some(Utc::now()),
        };
        info!("✅ NAV updated to {}: {}", format_usd(nav), confirmation.signature);
        Ok(format!("NAV updated to {}", format_usd(nav)))
    }

    /// Operator-triggered report outside the hourly cadence.
    pub async fn force_update(&self, nav: Option<Decimal>) -> Result<String, EngineError> {
        info!("🔧 Forced NAV update requested");
        self.report(nav).await
    }

    /// Seconds until the next scheduled report, zero before the first one.
    fn next_update_in(&self) -> u64 {
        let Some(at) = self.state.lock().last_report_time else {
            return 0;
        };
        let elapsed = (Utc::now() - at).num_seconds().max(0) as u64;
        self.config.nav_interval.as_secs().saturating_sub(elapsed)
    }
}

#[async_trait]
impl Processor for NavReporter {
    fn name(&self) -> &'static str {
        "nav_reporter"
    }

    fn interval(&self) -> Duration {
        self.config.nav_interval
    }

    async fn tick(&self, _trigger: Trigger) -> Result<String, EngineError> {
        self.report(None).await
    }

    fn details(&self) -> serde_json::Value {
        let state = self.state();
        json!({
            "lastReportedNav": state.last_reported_nav,
            "lastReportTime": state.last_report_time,
            "currentEquity": *self.current_equity.lock(),
            "updateIntervalSecs": self.config.nav_interval.as_secs(),
            "nextUpdateIn": self.next_update_in(),
        })
    }
}
