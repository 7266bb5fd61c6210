//! Integer accounting primitives
//!
//! All vault arithmetic is done on unsigned integers in the asset's smallest
//! unit. Division always truncates, which rounds in favour of the pool.

use crate::vault::errors::VaultError;

/// Asset or share quantity in base units.
pub type Amount = u128;

/// 10_000 bps = 100%.
pub const BPS_DENOMINATOR: u128 = 10_000;

/// 365 days; leap seconds and leap years are ignored.
pub const SECONDS_PER_YEAR: u128 = 365 * 24 * 60 * 60;

/// Fixed-point scale for quoting price per share (1e18 = 1.0).
pub const SHARE_PRICE_SCALE: u128 = 1_000_000_000_000_000_000;

/// `a * b / denom`, truncating. Fails on overflow or a zero denominator.
#[inline]
pub fn mul_div(a: u128, b: u128, denom: u128) -> Result<u128, VaultError> {
    if denom == 0 {
        return Err(VaultError::MathOverflow);
    }
    a.checked_mul(b)
        .map(|v| v / denom)
        .ok_or(VaultError::MathOverflow)
}

/// Linear accrual: `principal * apy / 10000` per year, pro-rated by
/// `elapsed_secs`. Both divisions truncate, in that order.
pub fn linear_yield(principal: Amount, apy_bps: u32, elapsed_secs: i64) -> Result<Amount, VaultError> {
    if elapsed_secs <= 0 || principal == 0 || apy_bps == 0 {
        return Ok(0);
    }
    let annual = mul_div(principal, apy_bps as u128, BPS_DENOMINATOR)?;
    mul_div(annual, elapsed_secs as u128, SECONDS_PER_YEAR)
}

/// `value * (10000 + bps) / 10000`.
#[inline]
pub fn scale_up_bps(value: Amount, bps: u32) -> Result<Amount, VaultError> {
    mul_div(value, BPS_DENOMINATOR + bps as u128, BPS_DENOMINATOR)
}

/// `value * bps / 10000`.
#[inline]
pub fn apply_bps(value: Amount, bps: u32) -> Result<Amount, VaultError> {
    mul_div(value, bps as u128, BPS_DENOMINATOR)
}

/// `|a - b| * 10000 / base`, saturating at `u32::MAX`. Zero when `base == 0`.
pub fn deviation_bps(a: Amount, b: Amount, base: Amount) -> u32 {
    if base == 0 {
        return 0;
    }
    let diff = a.abs_diff(b);
    match diff.checked_mul(BPS_DENOMINATOR) {
        Some(v) => u32::try_from(v / base).unwrap_or(u32::MAX),
        None => u32::MAX,
    }
}

/// Clamp a u128 ratio into the bps range used for signals.
#[inline]
pub fn clamp_bps(value: u128) -> u32 {
    value.min(BPS_DENOMINATOR) as u32
}
