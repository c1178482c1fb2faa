//! # Exchange REST Client
//!
//! [`ExchangeGateway`] over the exchange's JSON REST API.
//!
//! Every response is wrapped in an envelope:
//!
//! ```json
//! { "status": "OK", "data": { ... } }
//! ```
//!
//! Anything other than `OK` is surfaced as [`ExchangeError::Rejected`].
//! Requests authenticate with the `X-Api-Key` header.
//!
//! ## Order Sizing
//!
//! Orders are placed in base units (BTC) as immediate-or-cancel limit
//! orders priced 0.5% through the mark price:
//!
//! ```text
//! open_short($1,000) at mark $50,000
//!   qty   = 1,000 × 0.95 / 50,000 = 0.019 BTC   (5% fee headroom, 5 dp)
//!   price = floor(50,000 × 0.995) = 49,750
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use tracing::{debug, info, warn};

use super::{ExchangeError, ExchangeGateway};
use crate::ledger::LedgerGateway;
use crate::models::{
    AccountBalance, Asset, CloseSize, OrderResult, OrderStatus, Position, PositionSide,
    WithdrawalReceipt,
};
use crate::utils::format_usd;

/// Smallest order size accepted by the exchange, in base units.
const MIN_ORDER_QTY: Decimal = dec!(0.00001);

/// Decimal places of order quantities.
const QTY_DECIMALS: u32 = 5;

/// Share of requested notional actually ordered (fee headroom).
const OPEN_SIZE_FACTOR: Decimal = dec!(0.95);

/// Limit price offset from mark for immediate fills.
const PRICE_SLIPPAGE: Decimal = dec!(0.005);

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    data: Option<T>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarketInfo {
    market_stats: MarketStats,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarketStats {
    #[serde(default)]
    funding_rate: Decimal,
    #[serde(default)]
    mark_price: Decimal,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OrderRequest<'a> {
    market: &'a str,
    side: &'static str,
    qty: Decimal,
    price: Decimal,
    time_in_force: &'static str,
    reduce_only: bool,
}

#[derive(Debug, Deserialize)]
struct OrderAck {
    id: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WithdrawalBody {
    amount: Decimal,
    address: String,
}

/// Quantity for opening a short of `usd_size` at `mark_price`.
///
/// Returns `None` when the order would be below the exchange minimum.
pub fn short_order_qty(usd_size: Decimal, mark_price: Decimal) -> Option<Decimal> {
    if mark_price <= Decimal::ZERO || usd_size <= Decimal::ZERO {
        return None;
    }
    let qty = (usd_size * OPEN_SIZE_FACTOR / mark_price)
        .round_dp_with_strategy(QTY_DECIMALS, RoundingStrategy::ToZero);
    (qty >= MIN_ORDER_QTY).then_some(qty)
}

/// Quantity to buy back, clamped to the open short.
pub fn close_order_qty(size: CloseSize, open_size: Decimal) -> Option<Decimal> {
    let wanted = match size {
        CloseSize::All => open_size,
        CloseSize::Base(qty) => qty.min(open_size),
    };
    let qty = wanted.round_dp_with_strategy(QTY_DECIMALS, RoundingStrategy::ToZero);
    (qty >= MIN_ORDER_QTY).then_some(qty)
}

/// REST implementation of [`ExchangeGateway`].
///
/// ## Usage
///
/// ```rust,ignore
/// let exchange = ExchangeClient::new(&config, ledger.clone())?;
/// let balance = exchange.account_balance().await?;
/// println!("Equity: {}", balance.equity);
/// ```
pub struct ExchangeClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,

    /// On-chain owner of the exchange's deposit token account.
    deposit_address: Option<Pubkey>,

    /// Used for the on-chain leg of deposits.
    ledger: Arc<dyn LedgerGateway>,
}

impl ExchangeClient {
    /// Create a new ExchangeClient.
    ///
    /// ## Arguments
    ///
    /// * `base_url` - REST base URL, e.g. `https://api.exchange.example/api/v1`
    /// * `api_key` - API key sent as `X-Api-Key`
    /// * `deposit_address` - Exchange deposit wallet, `None` disables `deposit`
    /// * `ledger` - Ledger used to transfer deposits on-chain
    pub fn new(
        base_url: &str,
        api_key: &str,
        deposit_address: Option<Pubkey>,
        ledger: Arc<dyn LedgerGateway>,
    ) -> Result<Self, ExchangeError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent("vault-reconciler/0.1")
            .build()
            .map_err(|e| ExchangeError::Http(format!("client build: {}", e)))?;

        if api_key.is_empty() {
            warn!("⚠️  EXCHANGE_API_KEY is empty, private endpoints will be rejected");
        }
        if deposit_address.is_none() {
            warn!("⚠️  EXCHANGE_DEPOSIT_ADDRESS not set, deposits to the exchange are disabled");
        }

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            deposit_address,
            ledger,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    async fn unwrap_envelope<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ExchangeError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExchangeError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: Envelope<T> = response.json().await?;
        if !envelope.status.eq_ignore_ascii_case("ok") {
            let detail = envelope
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| envelope.status.clone());
            return Err(ExchangeError::Rejected(detail));
        }

        envelope
            .data
            .ok_or_else(|| ExchangeError::Decode("missing data field".to_string()))
    }

    async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ExchangeError> {
        debug!("GET {}", endpoint);
        let response = self
            .http
            .get(self.url(endpoint))
            .header("X-Api-Key", &self.api_key)
            .query(query)
            .send()
            .await?;
        Self::unwrap_envelope(response).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T, ExchangeError> {
        debug!("POST {}", endpoint);
        let response = self
            .http
            .post(self.url(endpoint))
            .header("X-Api-Key", &self.api_key)
            .json(body)
            .send()
            .await?;
        Self::unwrap_envelope(response).await
    }

    async fn market_stats(&self, market: &str) -> Result<MarketStats, ExchangeError> {
        let markets: Vec<MarketInfo> = self.get("/info/markets", &[("market", market)]).await?;
        markets
            .into_iter()
            .next()
            .map(|m| m.market_stats)
            .ok_or_else(|| ExchangeError::Decode(format!("unknown market {}", market)))
    }

    async fn place_order(&self, order: &OrderRequest<'_>) -> Result<OrderResult, ExchangeError> {
        match self.post::<_, OrderAck>("/user/order", order).await {
            Ok(ack) => {
                let id = match ack.id {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                Ok(OrderResult::accepted(id))
            }
            Err(ExchangeError::Rejected(reason)) => {
                warn!("❌ Order rejected: {}", reason);
                Ok(OrderResult::with_status(OrderStatus::Rejected(reason)))
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ExchangeGateway for ExchangeClient {
    async fn funding_rate(&self, market: &str) -> Result<Decimal, ExchangeError> {
        Ok(self.market_stats(market).await?.funding_rate)
    }

    async fn mark_price(&self, market: &str) -> Result<Decimal, ExchangeError> {
        Ok(self.market_stats(market).await?.mark_price)
    }

    async fn positions(&self, market: &str) -> Result<Vec<Position>, ExchangeError> {
        let positions: Vec<Position> = self
            .get("/user/positions", &[("market", market), ("side", "SHORT")])
            .await?;
        Ok(positions
            .into_iter()
            .filter(|p| p.side == PositionSide::Short && p.size > Decimal::ZERO)
            .collect())
    }

    async fn account_balance(&self) -> Result<AccountBalance, ExchangeError> {
        self.get("/user/balance", &[]).await
    }

    async fn open_short(&self, market: &str, usd_size: Decimal) -> Result<OrderResult, ExchangeError> {
        let mark = self.mark_price(market).await?;
        let Some(qty) = short_order_qty(usd_size, mark) else {
            warn!("Short of {} too small at mark {}", format_usd(usd_size), mark);
            return Ok(OrderResult::with_status(OrderStatus::TooSmall));
        };

        let price = (mark * (Decimal::ONE - PRICE_SLIPPAGE)).floor();
        info!("📈 Opening SHORT {} {} ({}) @ {}", qty, market, format_usd(usd_size), price);

        self.place_order(&OrderRequest {
            market,
            side: "SELL",
            qty,
            price,
            time_in_force: "IOC",
            reduce_only: false,
        })
        .await
    }

    async fn close(&self, market: &str, size: CloseSize) -> Result<OrderResult, ExchangeError> {
        let open_size: Decimal = self.positions(market).await?.iter().map(|p| p.size).sum();
        if open_size <= Decimal::ZERO {
            info!("ℹ️ No position to close");
            return Ok(OrderResult::with_status(OrderStatus::NothingToClose));
        }

        let Some(qty) = close_order_qty(size, open_size) else {
            return Ok(OrderResult::with_status(OrderStatus::TooSmall));
        };

        let mark = self.mark_price(market).await?;
        let price = (mark * (Decimal::ONE + PRICE_SLIPPAGE)).ceil();
        info!("📉 Closing {} of {} {} @ {}", qty, open_size, market, price);

        self.place_order(&OrderRequest {
            market,
            side: "BUY",
            qty,
            price,
            time_in_force: "IOC",
            reduce_only: true,
        })
        .await
    }

    async fn request_withdrawal(
        &self,
        amount: Decimal,
        recipient: &Pubkey,
    ) -> Result<WithdrawalReceipt, ExchangeError> {
        info!("💸 Requesting exchange withdrawal of {} to {}", format_usd(amount), recipient);
        self.post(
            "/user/withdrawal",
            &WithdrawalBody {
                amount,
                address: recipient.to_string(),
            },
        )
        .await
    }

    async fn deposit(&self, amount: Decimal) -> Result<String, ExchangeError> {
        let address = self
            .deposit_address
            .ok_or_else(|| ExchangeError::NotConfigured("EXCHANGE_DEPOSIT_ADDRESS".to_string()))?;

        info!("🏦 Depositing {} to exchange", format_usd(amount));
        let confirmation = self.ledger.transfer(Asset::Settlement, &address, amount).await?;
        Ok(confirmation.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_order_sizing() {
        assert_eq!(short_order_qty(dec!(1000), dec!(50000)), Some(dec!(0.019)));
        // 0.0000095 BTC rounds below the minimum
        assert_eq!(short_order_qty(dec!(0.5), dec!(50000)), None);
        assert_eq!(short_order_qty(dec!(1000), Decimal::ZERO), None);
    }

    #[test]
    fn test_close_is_clamped_to_open_size() {
        assert_eq!(close_order_qty(CloseSize::All, dec!(0.04)), Some(dec!(0.04)));
        assert_eq!(close_order_qty(CloseSize::Base(dec!(1)), dec!(0.04)), Some(dec!(0.04)));
        assert_eq!(
            close_order_qty(CloseSize::Base(dec!(0.0123456)), dec!(0.04)),
            Some(dec!(0.01234))
        );
        assert_eq!(close_order_qty(CloseSize::Base(dec!(0.000001)), dec!(0.04)), None);
    }

    #[test]
    fn test_market_envelope_decoding() {
        let body = r#"{
            "status": "OK",
            "data": [{ "name": "BTC-USD", "marketStats": { "fundingRate": "0.000013", "markPrice": "64250.5" } }]
        }"#;
        let envelope: Envelope<Vec<MarketInfo>> = serde_json::from_str(body).unwrap();
        let stats = &envelope.data.unwrap()[0].market_stats;
        assert_eq!(stats.funding_rate, dec!(0.000013));
        assert_eq!(stats.mark_price, dec!(64250.5));
    }

    #[test]
    fn test_balance_decoding() {
        let body = r#"{
            "balance": "1000", "equity": "1012.5",
            "availableForTrade": "800", "availableForWithdrawal": "750",
            "unrealisedPnl": "12.5", "marginRatio": "0.12"
        }"#;
        let balance: AccountBalance = serde_json::from_str(body).unwrap();
        assert_eq!(balance.equity, dec!(1012.5));
        assert_eq!(balance.available_for_withdrawal, dec!(750));
    }
}
