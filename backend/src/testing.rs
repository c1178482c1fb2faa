//! In-memory gateways for processor tests.
//!
//! Both fakes record every write so tests can assert on what the engine
//! asked the outside world to do.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use solana_sdk::pubkey::Pubkey;

use crate::config::EngineConfig;
use crate::exchange::{ExchangeError, ExchangeGateway};
use crate::ledger::{LedgerError, LedgerGateway};
use crate::models::{
    AccountBalance, Asset, CloseSize, DepositRequest, OrderResult, OrderStatus, Position,
    PositionSide, QueueKind, TxConfirmation, WithdrawalReceipt, WithdrawalRequest,
    WithdrawalStatus,
};
use crate::utils::{from_fixed, SETTLEMENT_DECIMALS};

/// Engine settings with no waiting.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        settle_delay: Duration::ZERO,
        ..EngineConfig::default()
    }
}

pub fn deposit(request_id: u64, user: Pubkey, amount: Decimal) -> DepositRequest {
    DepositRequest {
        request_id,
        user,
        receiver: user,
        settlement_amount: amount,
        min_shares: 0,
        timestamp: 1_700_000_000,
        processed: false,
    }
}

pub fn withdrawal(request_id: u64, shares: u128, value: Decimal) -> WithdrawalRequest {
    WithdrawalRequest {
        request_id,
        user: Pubkey::new_unique(),
        shares,
        min_assets: 0,
        settlement_value: value,
        timestamp: 1_700_000_000,
        status: WithdrawalStatus::Pending,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub function: String,
    pub args: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub asset: Asset,
    pub recipient: Pubkey,
    pub amount: Decimal,
}

/// Vault program and token balances held in memory.
///
/// `process_deposit` marks the slot processed and pays
/// `amount × payout_ratio` to the operator, like the vault does.
/// `mark_withdrawal_ready` flips the slot to READY.
pub struct FakeLedger {
    pub operator: Pubkey,
    pub vault: Pubkey,
    pub deposits: Mutex<BTreeMap<u64, DepositRequest>>,
    pub withdrawals: Mutex<BTreeMap<u64, WithdrawalRequest>>,
    pub balances: Mutex<HashMap<(Asset, Pubkey), Decimal>>,
    pub value_per_share: Mutex<Decimal>,
    pub risk_held: Mutex<Decimal>,
    pub payout_ratio: Decimal,
    pub signer: bool,

    pub deposit_reads: Mutex<Vec<u64>>,
    pub invocations: Mutex<Vec<Invocation>>,
    pub transfers: Mutex<Vec<Transfer>>,
    pub failing_functions: Mutex<HashSet<String>>,
    pub fail_transfers: AtomicBool,
    /// Runs once, just before the next balance read returns.
    pub on_balance_read: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl FakeLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            operator: Pubkey::new_unique(),
            vault: Pubkey::new_unique(),
            deposits: Mutex::new(BTreeMap::new()),
            withdrawals: Mutex::new(BTreeMap::new()),
            balances: Mutex::new(HashMap::new()),
            value_per_share: Mutex::new(Decimal::ZERO),
            risk_held: Mutex::new(Decimal::ZERO),
            payout_ratio: dec!(0.5),
            signer: true,
            deposit_reads: Mutex::new(Vec::new()),
            invocations: Mutex::new(Vec::new()),
            transfers: Mutex::new(Vec::new()),
            failing_functions: Mutex::new(HashSet::new()),
            fail_transfers: AtomicBool::new(false),
            on_balance_read: Mutex::new(None),
        })
    }

    pub fn read_only() -> Arc<Self> {
        let mut ledger = Arc::try_unwrap(Self::new()).ok().unwrap();
        ledger.signer = false;
        Arc::new(ledger)
    }

    pub fn add_deposit(&self, request: DepositRequest) {
        self.deposits.lock().insert(request.request_id, request);
    }

    pub fn add_withdrawal(&self, request: WithdrawalRequest) {
        self.withdrawals.lock().insert(request.request_id, request);
    }

    pub fn set_operator_balance(&self, amount: Decimal) {
        self.balances.lock().insert((Asset::Settlement, self.operator), amount);
    }

    pub fn operator_balance(&self) -> Decimal {
        self.balance(Asset::Settlement, &self.operator)
    }

    pub fn balance(&self, asset: Asset, owner: &Pubkey) -> Decimal {
        self.balances.lock().get(&(asset, *owner)).copied().unwrap_or_default()
    }

    pub fn fail_function(&self, function: &str) {
        self.failing_functions.lock().insert(function.to_string());
    }

    pub fn heal_function(&self, function: &str) {
        self.failing_functions.lock().remove(function);
    }

    pub fn calls_to(&self, function: &str) -> Vec<Vec<u64>> {
        self.invocations
            .lock()
            .iter()
            .filter(|i| i.function == function)
            .map(|i| i.args.clone())
            .collect()
    }

    fn confirmation(&self) -> TxConfirmation {
        TxConfirmation {
            signature: format!("sig{}", self.invocations.lock().len() + self.transfers.lock().len()),
        }
    }
}

#[async_trait]
impl LedgerGateway for FakeLedger {
    async fn queue_length(&self, kind: QueueKind) -> Result<u64, LedgerError> {
        Ok(match kind {
            QueueKind::Deposit => self.deposits.lock().len() as u64,
            QueueKind::Withdrawal => self.withdrawals.lock().len() as u64,
        })
    }

    async fn read_deposit(&self, request_id: u64) -> Result<Option<DepositRequest>, LedgerError> {
        self.deposit_reads.lock().push(request_id);
        // Unwritten slots read back with a zero user
        Ok(Some(self.deposits.lock().get(&request_id).cloned().unwrap_or(DepositRequest {
            request_id,
            user: Pubkey::default(),
            receiver: Pubkey::default(),
            settlement_amount: Decimal::ZERO,
            min_shares: 0,
            timestamp: 0,
            processed: false,
        })))
    }

    async fn read_withdrawal(
        &self,
        request_id: u64,
    ) -> Result<Option<WithdrawalRequest>, LedgerError> {
        Ok(self.withdrawals.lock().get(&request_id).cloned())
    }

    async fn preview_redeem(&self, shares: u128) -> Result<Decimal, LedgerError> {
        Ok(Decimal::from(shares as u64) * *self.value_per_share.lock())
    }

    async fn risk_asset_held(&self) -> Result<Decimal, LedgerError> {
        Ok(*self.risk_held.lock())
    }

    async fn balance_of(&self, asset: Asset, owner: &Pubkey) -> Result<Decimal, LedgerError> {
        let hook = self.on_balance_read.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        Ok(self.balance(asset, owner))
    }

    async fn invoke(&self, function: &str, args: &[u64]) -> Result<TxConfirmation, LedgerError> {
        if !self.signer {
            return Err(LedgerError::SignerUnavailable);
        }
        if self.failing_functions.lock().contains(function) {
            return Err(LedgerError::Timeout(format!("{} not confirmed", function)));
        }

        match (function, args.first()) {
            ("process_deposit", Some(id)) => {
                let payout = {
                    let mut deposits = self.deposits.lock();
                    match deposits.get_mut(id) {
                        Some(d) if !d.processed => {
                            d.processed = true;
                            d.settlement_amount * self.payout_ratio
                        }
                        _ => Decimal::ZERO,
                    }
                };
                let balance = self.operator_balance();
                self.set_operator_balance(balance + payout);
            }
            ("mark_withdrawal_ready", Some(id)) => {
                if let Some(w) = self.withdrawals.lock().get_mut(id) {
                    w.status = WithdrawalStatus::Ready;
                }
            }
            _ => {}
        }

        let confirmation = self.confirmation();
        self.invocations.lock().push(Invocation {
            function: function.to_string(),
            args: args.to_vec(),
        });
        Ok(confirmation)
    }

    async fn transfer(
        &self,
        asset: Asset,
        recipient: &Pubkey,
        amount: Decimal,
    ) -> Result<TxConfirmation, LedgerError> {
        if !self.signer {
            return Err(LedgerError::SignerUnavailable);
        }
        if self.fail_transfers.load(Ordering::SeqCst) {
            return Err(LedgerError::Rpc("transfer not sent".into()));
        }

        let mut balances = self.balances.lock();
        let source = balances.entry((asset, self.operator)).or_default();
        if *source < amount {
            return Err(LedgerError::Rejected(format!("insufficient funds: {} < {}", source, amount)));
        }
        *source -= amount;
        *balances.entry((asset, *recipient)).or_default() += amount;
        drop(balances);

        let confirmation = self.confirmation();
        self.transfers.lock().push(Transfer {
            asset,
            recipient: *recipient,
            amount,
        });
        Ok(confirmation)
    }

    fn operator(&self) -> Pubkey {
        self.operator
    }

    fn vault(&self) -> Pubkey {
        self.vault
    }

    fn can_sign(&self) -> bool {
        self.signer
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Order {
    OpenShort(Decimal),
    Close(CloseSize),
}

/// Exchange account held in memory with a single short position.
pub struct FakeExchange {
    pub funding_rate: Mutex<Decimal>,
    pub mark_price: Mutex<Decimal>,
    pub balance: Mutex<AccountBalance>,
    /// Open short size in base units.
    pub short_size: Mutex<Decimal>,
    pub orders: Mutex<Vec<Order>>,
    pub withdrawals: Mutex<Vec<(Decimal, Pubkey)>>,
    pub deposits: Mutex<Vec<Decimal>>,
    pub fail_balance: AtomicBool,
    pub fail_withdrawals: AtomicBool,
    pub deposit_address: Pubkey,
    /// When set, deposits move funds out of the operator wallet.
    pub ledger: Option<Arc<FakeLedger>>,
}

impl FakeExchange {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    pub fn linked(ledger: Arc<FakeLedger>) -> Arc<Self> {
        Arc::new(Self::build(Some(ledger)))
    }

    fn build(ledger: Option<Arc<FakeLedger>>) -> Self {
        Self {
            funding_rate: Mutex::new(dec!(0.00001)),
            mark_price: Mutex::new(dec!(50000)),
            balance: Mutex::new(AccountBalance::default()),
            short_size: Mutex::new(Decimal::ZERO),
            orders: Mutex::new(Vec::new()),
            withdrawals: Mutex::new(Vec::new()),
            deposits: Mutex::new(Vec::new()),
            fail_balance: AtomicBool::new(false),
            fail_withdrawals: AtomicBool::new(false),
            deposit_address: Pubkey::new_unique(),
            ledger,
        }
    }

    pub fn set_equity(&self, equity: Decimal) {
        let mut balance = self.balance.lock();
        balance.equity = equity;
        balance.balance = equity;
        balance.available_for_trade = equity;
        balance.available_for_withdrawal = equity;
    }

    /// Set the open short by USD notional at the current mark.
    pub fn set_short_notional(&self, usd: Decimal) {
        let mark = *self.mark_price.lock();
        *self.short_size.lock() = usd / mark;
    }

    pub fn short_notional(&self) -> Decimal {
        *self.short_size.lock() * *self.mark_price.lock()
    }

    pub fn orders(&self) -> Vec<Order> {
        self.orders.lock().clone()
    }
}

#[async_trait]
impl ExchangeGateway for FakeExchange {
    async fn funding_rate(&self, _market: &str) -> Result<Decimal, ExchangeError> {
        Ok(*self.funding_rate.lock())
    }

    async fn mark_price(&self, _market: &str) -> Result<Decimal, ExchangeError> {
        Ok(*self.mark_price.lock())
    }

    async fn positions(&self, market: &str) -> Result<Vec<Position>, ExchangeError> {
        let size = *self.short_size.lock();
        if size <= Decimal::ZERO {
            return Ok(Vec::new());
        }
        let mark = *self.mark_price.lock();
        Ok(vec![Position {
            market: market.to_string(),
            side: PositionSide::Short,
            size,
            value: size * mark,
            open_price: mark,
            mark_price: mark,
            unrealised_pnl: Decimal::ZERO,
        }])
    }

    async fn account_balance(&self) -> Result<AccountBalance, ExchangeError> {
        if self.fail_balance.load(Ordering::SeqCst) {
            return Err(ExchangeError::Http("connection reset".into()));
        }
        Ok(self.balance.lock().clone())
    }

    async fn open_short(&self, _market: &str, usd_size: Decimal) -> Result<OrderResult, ExchangeError> {
        self.orders.lock().push(Order::OpenShort(usd_size));
        let mark = *self.mark_price.lock();
        *self.short_size.lock() += usd_size / mark;
        Ok(OrderResult::accepted("open"))
    }

    async fn close(&self, _market: &str, size: CloseSize) -> Result<OrderResult, ExchangeError> {
        self.orders.lock().push(Order::Close(size));
        let mut short = self.short_size.lock();
        if *short <= Decimal::ZERO {
            return Ok(OrderResult::with_status(OrderStatus::NothingToClose));
        }
        match size {
            CloseSize::All => *short = Decimal::ZERO,
            CloseSize::Base(qty) => *short = (*short - qty).max(Decimal::ZERO),
        }
        Ok(OrderResult::accepted("close"))
    }

    async fn request_withdrawal(
        &self,
        amount: Decimal,
        recipient: &Pubkey,
    ) -> Result<WithdrawalReceipt, ExchangeError> {
        if self.fail_withdrawals.load(Ordering::SeqCst) {
            return Err(ExchangeError::Status {
                status: 503,
                body: "withdrawals paused".into(),
            });
        }
        self.withdrawals.lock().push((amount, *recipient));
        Ok(WithdrawalReceipt {
            id: format!("w{}", self.withdrawals.lock().len()),
            amount,
        })
    }

    async fn deposit(&self, amount: Decimal) -> Result<String, ExchangeError> {
        if let Some(ledger) = &self.ledger {
            ledger.transfer(Asset::Settlement, &self.deposit_address, amount).await?;
        }
        self.deposits.lock().push(amount);
        Ok(format!("deposit{}", self.deposits.lock().len()))
    }
}

/// Raw settlement amount helper for asserting invocation args.
pub fn raw_usd(raw: u64) -> Decimal {
    from_fixed(raw, SETTLEMENT_DECIMALS)
}
