//! # Solana Ledger
//!
//! [`LedgerGateway`] bound to the vault program on Solana.
//!
//! ## Account Layout
//!
//! | Account | Seeds |
//! |---------|-------|
//! | Vault state | `["vault"]` |
//! | Deposit request | `["deposit", request_id (u64 LE)]` |
//! | Withdrawal request | `["withdrawal", request_id (u64 LE)]` |
//!
//! A queue slot whose account does not exist reads back as `None`, which
//! the processors treat as the end of the live queue.
//!
//! ## Invocation Flow
//!
//! ```text
//! 1. invoke("process_deposit", [7])
//!              ↓
//! 2. data = sha256("global:process_deposit")[..8] ++ 7u64.to_le_bytes()
//!              ↓
//! 3. accounts = operator (signer), vault state, deposit #7
//!              ↓
//! 4. sign with operator keypair, send, wait for confirmation
//!              ↓
//! 5. TxConfirmation { signature }
//! ```
//!
//! RPC reads run on the blocking pool and are retried with exponential
//! backoff. Confirmation waits are bounded by the configured transaction
//! timeout.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use solana_client::rpc_client::RpcClient;
use solana_sdk::{
    account::Account,
    commitment_config::CommitmentConfig,
    hash::hashv,
    instruction::{AccountMeta, Instruction},
    pubkey::Pubkey,
    signature::{Keypair, Signer},
    transaction::Transaction,
};
use spl_associated_token_account::{
    get_associated_token_address, instruction::create_associated_token_account_idempotent,
};
use spl_token::solana_program::program_pack::Pack;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{LedgerError, LedgerGateway};
use crate::config::AppConfig;
use crate::models::{
    Asset, DepositRequest, QueueKind, TxConfirmation, WithdrawalRequest, WithdrawalStatus,
};
use crate::utils::{from_fixed, to_fixed, truncate_string, SETTLEMENT_DECIMALS};

/// Length of the account discriminator prefix.
const DISCRIMINATOR_LEN: usize = 8;

/// Decoded vault state account.
///
/// ## Account Structure
///
/// ```text
/// Offset | Size | Field
/// -------|------|------
/// 0      | 8    | discriminator
/// 8      | 32   | authority
/// 40     | 32   | settlement_mint
/// 72     | 32   | risk_mint
/// 104    | 8    | deposit_queue_len
/// 112    | 8    | withdrawal_queue_len
/// 120    | 8    | risk_asset_held
/// 128    | 8    | total_assets
/// 136    | 16   | total_shares (u128)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultState {
    pub authority: Pubkey,
    pub settlement_mint: Pubkey,
    pub risk_mint: Pubkey,
    pub deposit_queue_len: u64,
    pub withdrawal_queue_len: u64,
    pub risk_asset_held: u64,
    pub total_assets: u64,
    pub total_shares: u128,
}

impl VaultState {
    /// Raw settlement value of `shares`, rounded down.
    pub fn preview_redeem_raw(&self, shares: u128) -> Result<u64, LedgerError> {
        if self.total_shares == 0 {
            return Ok(0);
        }
        let value = shares
            .checked_mul(self.total_assets as u128)
            .map(|v| v / self.total_shares)
            .ok_or_else(|| LedgerError::Amount(format!("share value overflows: {}", shares)))?;
        u64::try_from(value)
            .map_err(|_| LedgerError::Amount(format!("share value out of range: {}", value)))
    }
}

/// Sequential reader over account data after the discriminator.
struct AccountReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> AccountReader<'a> {
    fn new(data: &'a [u8], body_len: usize) -> Result<Self, LedgerError> {
        if data.len() < DISCRIMINATOR_LEN + body_len {
            return Err(LedgerError::Decode(format!(
                "account data too short: {} < {}",
                data.len(),
                DISCRIMINATOR_LEN + body_len
            )));
        }
        Ok(Self {
            data: &data[DISCRIMINATOR_LEN..],
            offset: 0,
        })
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.offset..self.offset + N]);
        self.offset += N;
        out
    }

    fn pubkey(&mut self) -> Pubkey {
        Pubkey::new_from_array(self.take::<32>())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take::<8>())
    }

    fn i64(&mut self) -> i64 {
        i64::from_le_bytes(self.take::<8>())
    }

    fn u128(&mut self) -> u128 {
        u128::from_le_bytes(self.take::<16>())
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }
}

/// Decode the vault state account.
pub fn decode_vault_state(data: &[u8]) -> Result<VaultState, LedgerError> {
    let mut r = AccountReader::new(data, 144)?;
    Ok(VaultState {
        authority: r.pubkey(),
        settlement_mint: r.pubkey(),
        risk_mint: r.pubkey(),
        deposit_queue_len: r.u64(),
        withdrawal_queue_len: r.u64(),
        risk_asset_held: r.u64(),
        total_assets: r.u64(),
        total_shares: r.u128(),
    })
}

/// Decode a deposit request account.
///
/// ```text
/// 8   | 32 | user
/// 40  | 32 | receiver
/// 72  | 8  | amount (6 dp)
/// 80  | 16 | min_shares (u128)
/// 96  | 8  | timestamp (i64)
/// 104 | 1  | processed
/// ```
pub fn decode_deposit(request_id: u64, data: &[u8]) -> Result<DepositRequest, LedgerError> {
    let mut r = AccountReader::new(data, 97)?;
    let user = r.pubkey();
    let receiver = r.pubkey();
    let amount = r.u64();
    let min_shares = r.u128();
    let timestamp = r.i64();
    let processed = r.u8() != 0;

    Ok(DepositRequest {
        request_id,
        user,
        receiver,
        settlement_amount: from_fixed(amount, SETTLEMENT_DECIMALS),
        min_shares,
        timestamp: timestamp.max(0) as u64,
        processed,
    })
}

/// Decode a withdrawal request account.
///
/// ```text
/// 8  | 32 | user
/// 40 | 16 | shares (u128)
/// 56 | 16 | min_assets (u128)
/// 72 | 8  | settlement_value (6 dp)
/// 80 | 8  | timestamp (i64)
/// 88 | 1  | status
/// ```
pub fn decode_withdrawal(request_id: u64, data: &[u8]) -> Result<WithdrawalRequest, LedgerError> {
    let mut r = AccountReader::new(data, 81)?;
    let user = r.pubkey();
    let shares = r.u128();
    let min_assets = r.u128();
    let settlement_value = r.u64();
    let timestamp = r.i64();
    let status_byte = r.u8();

    let status = WithdrawalStatus::from_u8(status_byte).ok_or_else(|| {
        LedgerError::Decode(format!(
            "withdrawal {} has unknown status {}",
            request_id, status_byte
        ))
    })?;

    Ok(WithdrawalRequest {
        request_id,
        user,
        shares,
        min_assets,
        settlement_value: from_fixed(settlement_value, SETTLEMENT_DECIMALS),
        timestamp: timestamp.max(0) as u64,
        status,
    })
}

/// Instruction data: 8-byte function selector followed by `u64` LE args.
pub fn instruction_data(function: &str, args: &[u64]) -> Vec<u8> {
    let selector = hashv(&[b"global:", function.as_bytes()]).to_bytes();
    let mut data = Vec::with_capacity(DISCRIMINATOR_LEN + args.len() * 8);
    data.extend_from_slice(&selector[..DISCRIMINATOR_LEN]);
    for arg in args {
        data.extend_from_slice(&arg.to_le_bytes());
    }
    data
}

/// Program-derived address of a queue slot.
pub fn queue_item_address(program_id: &Pubkey, kind: QueueKind, request_id: u64) -> Pubkey {
    let (address, _bump) =
        Pubkey::find_program_address(&[kind.seed(), &request_id.to_le_bytes()], program_id);
    address
}

/// Solana RPC implementation of [`LedgerGateway`].
///
/// ## Usage
///
/// ```rust,ignore
/// let config = AppConfig::from_env()?;
/// let signer = signer::load_keypair(&config.keypair_path).ok();
/// let ledger = SolanaLedger::new(&config, signer)?;
///
/// let pending = ledger.queue_length(QueueKind::Deposit).await?;
/// ```
#[derive(Clone)]
pub struct SolanaLedger {
    /// The RPC endpoint URL.
    rpc_url: String,

    /// The vault program ID.
    program_id: Pubkey,

    /// Vault state PDA.
    vault_state: Pubkey,

    settlement_mint: Pubkey,
    risk_mint: Pubkey,

    /// Operator wallet (keypair pubkey or configured address).
    operator: Pubkey,

    /// `None` when running read-only.
    signer: Option<Arc<Keypair>>,

    /// Upper bound on waiting for confirmation.
    tx_timeout: Duration,
}

impl SolanaLedger {
    /// Create a new SolanaLedger.
    ///
    /// ## Arguments
    ///
    /// * `config` - Application configuration containing RPC URL, program ID and mints
    /// * `signer` - Operator keypair, or `None` for read-only operation
    ///
    /// ## Returns
    ///
    /// * `Ok(SolanaLedger)` - Ledger created
    /// * `Err(LedgerError::InvalidAddress)` - A configured address is malformed,
    ///   or neither a keypair nor `OPERATOR_ADDRESS` is available
    pub fn new(config: &AppConfig, signer: Option<Arc<Keypair>>) -> Result<Self, LedgerError> {
        let program_id = parse_pubkey("program ID", &config.vault_program_id)?;
        let settlement_mint = parse_pubkey("settlement mint", &config.settlement_mint)?;
        let risk_mint = parse_pubkey("risk mint", &config.risk_mint)?;

        let operator = match (&signer, &config.operator_address) {
            (Some(keypair), _) => keypair.pubkey(),
            (None, Some(address)) => parse_pubkey("operator address", address)?,
            (None, None) => {
                return Err(LedgerError::InvalidAddress(
                    "no operator keypair and no OPERATOR_ADDRESS".to_string(),
                ))
            }
        };

        let (vault_state, _bump) = Pubkey::find_program_address(&[b"vault"], &program_id);

        info!("Solana ledger initialized:");
        info!("  RPC: {}", config.solana_rpc_url);
        info!("  Program: {}", program_id);
        info!("  Vault: {}", vault_state);
        info!("  Operator: {}", operator);

        Ok(Self {
            rpc_url: config.solana_rpc_url.clone(),
            program_id,
            vault_state,
            settlement_mint,
            risk_mint,
            operator,
            signer,
            tx_timeout: config.engine.tx_timeout,
        })
    }

    fn rpc_client(&self) -> RpcClient {
        RpcClient::new_with_commitment(self.rpc_url.clone(), CommitmentConfig::confirmed())
    }

    fn mint(&self, asset: Asset) -> Pubkey {
        match asset {
            Asset::Settlement => self.settlement_mint,
            Asset::Risk => self.risk_mint,
        }
    }

    fn signer(&self) -> Result<Arc<Keypair>, LedgerError> {
        self.signer.clone().ok_or(LedgerError::SignerUnavailable)
    }

    /// Execute an RPC read with retry logic.
    ///
    /// Retries up to 4 attempts (initial attempt + 3 retries) with exponential
    /// backoff. Uses a 10-second timeout per attempt.
    async fn retry_rpc_operation<F, Fut, T>(&self, mut operation: F) -> Result<T, LedgerError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, LedgerError>>,
    {
        const MAX_RETRIES: u32 = 3;
        const INITIAL_DELAY_MS: u64 = 200;
        const TIMEOUT_SECS: u64 = 10;

        let mut last_error = LedgerError::Rpc("no attempt made".to_string());

        for attempt in 0..=MAX_RETRIES {
            match timeout(Duration::from_secs(TIMEOUT_SECS), operation()).await {
                Ok(Ok(result)) => {
                    if attempt > 0 {
                        info!("RPC operation succeeded after {} retries", attempt);
                    }
                    return Ok(result);
                }
                Ok(Err(e)) => {
                    debug!("RPC operation failed (attempt {}): {}", attempt + 1, e);
                    last_error = e;
                }
                Err(_) => {
                    debug!("RPC operation timed out (attempt {})", attempt + 1);
                    last_error = LedgerError::Timeout(format!(
                        "RPC read exceeded {}s after {} attempts",
                        TIMEOUT_SECS,
                        attempt + 1
                    ));
                }
            }

            if attempt < MAX_RETRIES {
                // 200ms, 400ms, 800ms
                let delay_ms = INITIAL_DELAY_MS * (1 << attempt);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }

        warn!("RPC operation failed after {} attempts: {}", MAX_RETRIES + 1, last_error);
        Err(last_error)
    }

    /// Fetch an account, `None` if it does not exist.
    async fn get_account(&self, address: Pubkey) -> Result<Option<Account>, LedgerError> {
        self.retry_rpc_operation(|| {
            let client = self.rpc_client();
            async move {
                tokio::task::spawn_blocking(move || {
                    client.get_account_with_commitment(&address, CommitmentConfig::confirmed())
                })
                .await
                .map_err(|e| LedgerError::Task(e.to_string()))?
                .map(|response| response.value)
                .map_err(|e| LedgerError::Rpc(format!("Failed to fetch {}: {}", address, e)))
            }
        })
        .await
    }

    async fn vault_state(&self) -> Result<VaultState, LedgerError> {
        let account = self
            .get_account(self.vault_state)
            .await?
            .ok_or_else(|| LedgerError::Decode(format!("vault state {} missing", self.vault_state)))?;
        decode_vault_state(&account.data)
    }

    /// Sign, send and confirm a transaction built from `instructions`.
    async fn submit(&self, instructions: Vec<Instruction>) -> Result<TxConfirmation, LedgerError> {
        let keypair = self.signer()?;
        let client = self.rpc_client();

        let task = tokio::task::spawn_blocking(move || {
            let blockhash = client
                .get_latest_blockhash()
                .map_err(|e| LedgerError::Rpc(format!("Failed to get blockhash: {}", e)))?;

            let transaction = Transaction::new_signed_with_payer(
                &instructions,
                Some(&keypair.pubkey()),
                &[keypair.as_ref()],
                blockhash,
            );

            client
                .send_and_confirm_transaction(&transaction)
                .map_err(|e| LedgerError::Rejected(e.to_string()))
        });

        let signature = timeout(self.tx_timeout, task)
            .await
            .map_err(|_| {
                LedgerError::Timeout(format!(
                    "confirmation exceeded {}s",
                    self.tx_timeout.as_secs()
                ))
            })?
            .map_err(|e| LedgerError::Task(e.to_string()))??;

        Ok(TxConfirmation {
            signature: signature.to_string(),
        })
    }

    /// Program accounts passed to a vault function.
    ///
    /// Functions addressed at one queue slot take the request id as their
    /// first argument.
    fn invoke_accounts(&self, function: &str, args: &[u64]) -> Vec<AccountMeta> {
        let mut accounts = vec![
            AccountMeta::new(self.operator, true),
            AccountMeta::new(self.vault_state, false),
        ];

        let queue = match function {
            "process_deposit" => Some(QueueKind::Deposit),
            "mark_withdrawal_ready" => Some(QueueKind::Withdrawal),
            _ => None,
        };
        if let (Some(kind), Some(request_id)) = (queue, args.first()) {
            accounts.push(AccountMeta::new(
                queue_item_address(&self.program_id, kind, *request_id),
                false,
            ));
        }

        accounts
    }
}

#[async_trait]
impl LedgerGateway for SolanaLedger {
    async fn queue_length(&self, kind: QueueKind) -> Result<u64, LedgerError> {
        let state = self.vault_state().await?;
        Ok(match kind {
            QueueKind::Deposit => state.deposit_queue_len,
            QueueKind::Withdrawal => state.withdrawal_queue_len,
        })
    }

    async fn read_deposit(&self, request_id: u64) -> Result<Option<DepositRequest>, LedgerError> {
        let address = queue_item_address(&self.program_id, QueueKind::Deposit, request_id);
        match self.get_account(address).await? {
            Some(account) => decode_deposit(request_id, &account.data).map(Some),
            None => Ok(None),
        }
    }

    async fn read_withdrawal(
        &self,
        request_id: u64,
    ) -> Result<Option<WithdrawalRequest>, LedgerError> {
        let address = queue_item_address(&self.program_id, QueueKind::Withdrawal, request_id);
        match self.get_account(address).await? {
            Some(account) => decode_withdrawal(request_id, &account.data).map(Some),
            None => Ok(None),
        }
    }

    async fn preview_redeem(&self, shares: u128) -> Result<Decimal, LedgerError> {
        let state = self.vault_state().await?;
        let raw = state.preview_redeem_raw(shares)?;
        Ok(from_fixed(raw, SETTLEMENT_DECIMALS))
    }

    async fn risk_asset_held(&self) -> Result<Decimal, LedgerError> {
        let state = self.vault_state().await?;
        Ok(from_fixed(state.risk_asset_held, Asset::Risk.decimals()))
    }

    async fn balance_of(&self, asset: Asset, owner: &Pubkey) -> Result<Decimal, LedgerError> {
        let token_account = get_associated_token_address(owner, &self.mint(asset));

        let raw = match self.get_account(token_account).await? {
            Some(account) => {
                spl_token::state::Account::unpack(&account.data)
                    .map_err(|e| LedgerError::Decode(format!("token account {}: {}", token_account, e)))?
                    .amount
            }
            // No token account yet means nothing received yet
            None => 0,
        };

        Ok(from_fixed(raw, asset.decimals()))
    }

    async fn invoke(&self, function: &str, args: &[u64]) -> Result<TxConfirmation, LedgerError> {
        self.signer()?;

        let instruction = Instruction {
            program_id: self.program_id,
            accounts: self.invoke_accounts(function, args),
            data: instruction_data(function, args),
        };

        info!("📤 Invoking {}({:?})", function, args);
        let confirmation = self.submit(vec![instruction]).await?;
        info!(
            "✓ {} confirmed: {}",
            function,
            truncate_string(&confirmation.signature, 20)
        );
        Ok(confirmation)
    }

    async fn transfer(
        &self,
        asset: Asset,
        recipient: &Pubkey,
        amount: Decimal,
    ) -> Result<TxConfirmation, LedgerError> {
        self.signer()?;

        let decimals = asset.decimals();
        let raw = to_fixed(amount, decimals).map_err(LedgerError::Amount)?;
        if raw == 0 {
            return Err(LedgerError::Amount(format!("transfer of {} rounds to zero", amount)));
        }

        let mint = self.mint(asset);
        let source = get_associated_token_address(&self.operator, &mint);
        let destination = get_associated_token_address(recipient, &mint);

        let create_destination = create_associated_token_account_idempotent(
            &self.operator,
            recipient,
            &mint,
            &spl_token::id(),
        );

        let transfer = spl_token::instruction::transfer_checked(
            &spl_token::id(),
            &source,
            &mint,
            &destination,
            &self.operator,
            &[],
            raw,
            decimals as u8,
        )
        .map_err(|e| LedgerError::Amount(format!("Failed to build transfer: {}", e)))?;

        info!("📤 Transferring {} {:?} to {}", amount, asset, recipient);
        self.submit(vec![create_destination, transfer]).await
    }

    fn operator(&self) -> Pubkey {
        self.operator
    }

    fn vault(&self) -> Pubkey {
        self.vault_state
    }

    fn can_sign(&self) -> bool {
        self.signer.is_some()
    }
}

fn parse_pubkey(label: &str, value: &str) -> Result<Pubkey, LedgerError> {
    Pubkey::from_str(value).map_err(|e| LedgerError::InvalidAddress(format!("{} {}: {}", label, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn account_bytes(body: &[u8]) -> Vec<u8> {
        let mut data = vec![0xAA; DISCRIMINATOR_LEN];
        data.extend_from_slice(body);
        data
    }

    #[test]
    fn test_decode_deposit_request() {
        let user = Pubkey::new_unique();
        let receiver = Pubkey::new_unique();

        let mut body = Vec::new();
        body.extend_from_slice(user.as_ref());
        body.extend_from_slice(receiver.as_ref());
        body.extend_from_slice(&1_000_000_000u64.to_le_bytes());
        body.extend_from_slice(&5u128.to_le_bytes());
        body.extend_from_slice(&1_700_000_000i64.to_le_bytes());
        body.push(0);

        let deposit = decode_deposit(3, &account_bytes(&body)).unwrap();
        assert_eq!(deposit.request_id, 3);
        assert_eq!(deposit.user, user);
        assert_eq!(deposit.receiver, receiver);
        assert_eq!(deposit.settlement_amount, dec!(1000));
        assert_eq!(deposit.min_shares, 5);
        assert!(!deposit.processed);
        assert!(!deposit.is_sentinel());
    }

    #[test]
    fn test_decode_withdrawal_request() {
        let user = Pubkey::new_unique();

        let mut body = Vec::new();
        body.extend_from_slice(user.as_ref());
        body.extend_from_slice(&42u128.to_le_bytes());
        body.extend_from_slice(&0u128.to_le_bytes());
        body.extend_from_slice(&500_000_000u64.to_le_bytes());
        body.extend_from_slice(&1_700_000_000i64.to_le_bytes());
        body.push(1);

        let withdrawal = decode_withdrawal(2, &account_bytes(&body)).unwrap();
        assert_eq!(withdrawal.shares, 42);
        assert_eq!(withdrawal.settlement_value, dec!(500));
        assert_eq!(withdrawal.status, WithdrawalStatus::Processing);
    }

    #[test]
    fn test_short_or_unknown_accounts_are_decode_errors() {
        assert!(matches!(
            decode_deposit(0, &[0u8; 20]),
            Err(LedgerError::Decode(_))
        ));

        let mut body = vec![0u8; 80];
        body.push(9);
        assert!(matches!(
            decode_withdrawal(0, &account_bytes(&body)),
            Err(LedgerError::Decode(_))
        ));
    }

    #[test]
    fn test_preview_redeem_is_pro_rata() {
        let state = VaultState {
            authority: Pubkey::default(),
            settlement_mint: Pubkey::default(),
            risk_mint: Pubkey::default(),
            deposit_queue_len: 0,
            withdrawal_queue_len: 0,
            risk_asset_held: 0,
            total_assets: 2_000_000_000,
            total_shares: 1_000,
        };
        assert_eq!(state.preview_redeem_raw(250).unwrap(), 500_000_000);

        let empty = VaultState { total_shares: 0, ..state };
        assert_eq!(empty.preview_redeem_raw(250).unwrap(), 0);
    }

    #[test]
    fn test_instruction_data_layout() {
        let data = instruction_data("mark_withdrawal_ready", &[2, 250_000_000]);
        assert_eq!(data.len(), 8 + 16);
        assert_eq!(&data[8..16], &2u64.to_le_bytes());
        assert_eq!(&data[16..24], &250_000_000u64.to_le_bytes());

        // Selector depends only on the function name
        assert_eq!(
            instruction_data("update_nav", &[1])[..8],
            instruction_data("update_nav", &[2])[..8]
        );
        assert_ne!(
            instruction_data("update_nav", &[])[..8],
            instruction_data("process_deposit", &[])[..8]
        );
    }

    #[test]
    fn test_queue_addresses_are_distinct() {
        let program = Pubkey::new_unique();
        let a = queue_item_address(&program, QueueKind::Deposit, 0);
        let b = queue_item_address(&program, QueueKind::Deposit, 1);
        let c = queue_item_address(&program, QueueKind::Withdrawal, 0);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
