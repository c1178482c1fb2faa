//! # Exchange Records
//!
//! Account, position and order results returned by the custodial exchange.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a perpetual position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

/// An open position on the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub market: String,
    pub side: PositionSide,

    /// Size in base units (e.g. BTC), always positive.
    pub size: Decimal,

    /// Notional value in USD.
    pub value: Decimal,

    #[serde(default)]
    pub open_price: Decimal,

    #[serde(default)]
    pub mark_price: Decimal,

    #[serde(default)]
    pub unrealised_pnl: Decimal,
}

/// Exchange account balance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountBalance {
    pub balance: Decimal,
    pub equity: Decimal,
    pub available_for_trade: Decimal,
    pub available_for_withdrawal: Decimal,
    #[serde(default)]
    pub unrealised_pnl: Decimal,
    #[serde(default)]
    pub margin_ratio: Decimal,
}

/// How much of a position to close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseSize {
    /// The whole position.
    All,
    /// A quantity in base units; clamped to the live position.
    Base(Decimal),
}

/// Outcome of an order request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum OrderStatus {
    /// Order accepted by the exchange.
    Accepted,
    /// Close requested but no position was open.
    NothingToClose,
    /// Order too small for the market's minimum size.
    TooSmall,
    /// Exchange refused the order.
    Rejected(String),
}

/// Result of `open_short`/`close`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResult {
    #[serde(flatten)]
    pub status: OrderStatus,
    pub order_id: Option<String>,
}

impl OrderResult {
    pub fn accepted(order_id: impl Into<String>) -> Self {
        Self {
            status: OrderStatus::Accepted,
            order_id: Some(order_id.into()),
        }
    }

    pub fn with_status(status: OrderStatus) -> Self {
        Self { status, order_id: None }
    }

    /// True if the exchange state now matches what was asked for.
    ///
    /// A close with nothing left to close counts as done.
    pub fn is_done(&self) -> bool {
        matches!(self.status, OrderStatus::Accepted | OrderStatus::NothingToClose)
    }
}

/// Receipt of an exchange withdrawal request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalReceipt {
    pub id: String,
    pub amount: Decimal,
}
