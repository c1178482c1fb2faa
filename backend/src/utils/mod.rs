//! # Utilities Module
//!
//! Fixed-point scaling and formatting helpers shared by the gateways
//! and the processors.
//!
//! Amounts cross the ledger boundary as integers at a per-asset precision
//! (settlement asset: 6 decimals, risk asset: 8 decimals). Inside the engine
//! they are `rust_decimal::Decimal` values.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

/// Decimals of the settlement asset.
pub const SETTLEMENT_DECIMALS: u32 = 6;

/// Decimals of the risk asset.
pub const RISK_DECIMALS: u32 = 8;

/// Convert a raw on-chain integer into a decimal amount.
///
/// ## Examples
///
/// ```rust,ignore
/// assert_eq!(from_fixed(1_500_000, 6), dec!(1.5));
/// ```
pub fn from_fixed(raw: u64, decimals: u32) -> Decimal {
    Decimal::from_i128_with_scale(raw as i128, decimals).normalize()
}

/// Convert a decimal amount into a raw on-chain integer.
///
/// Sub-unit remainders are truncated toward zero, so the engine never
/// moves more than it holds. Negative amounts are rejected.
pub fn to_fixed(amount: Decimal, decimals: u32) -> Result<u64, String> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(format!("Amount cannot be negative: {}", amount));
    }
    let scaled = amount
        .checked_mul(Decimal::from(10u64.pow(decimals)))
        .ok_or_else(|| format!("Amount overflows fixed point: {}", amount))?;
    scaled
        .trunc()
        .to_u64()
        .ok_or_else(|| format!("Amount out of range: {}", amount))
}

/// Format a USD amount for logs, e.g. `$1,234.57`.
pub fn format_usd(amount: Decimal) -> String {
    let rounded = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    let negative = rounded.is_sign_negative() && !rounded.is_zero();
    let text = format!("{:.2}", rounded.abs());
    let (whole, frac) = text.split_once('.').unwrap_or((text.as_str(), "00"));

    // Add commas
    let mut result = String::new();
    for (i, c) in whole.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    let whole: String = result.chars().rev().collect();

    if negative {
        format!("-${}.{}", whole, frac)
    } else {
        format!("${}.{}", whole, frac)
    }
}

/// Relative change between two values as a fraction (0.05 = 5%).
///
/// Returns `None` when the previous value is zero.
pub fn fraction_change(old_value: Decimal, new_value: Decimal) -> Option<Decimal> {
    if old_value.is_zero() {
        return None;
    }
    Some((new_value - old_value).abs() / old_value.abs())
}

/// Truncate a string to a maximum length.
///
/// Useful for logging long public keys and transaction signatures.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        let half = (max_len - 3) / 2;
        format!("{}...{}", &s[..half], &s[s.len() - half..])
    }
}
