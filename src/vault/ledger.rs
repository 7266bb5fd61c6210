//! Share Ledger
//!
//! Tracks pooled assets, outstanding shares and each depositor's position.
//! The ledger is pure bookkeeping: it never calls a backing protocol and it
//! never checks deposit limits. `Vault` does both and decides when to mutate.
//!
//! # Invariants
//!
//! 1. `total_shares == sum(position.shares)`
//! 2. `total_shares == 0 <=> total_assets == 0` (the only 1:1 reset point)
//! 3. Conversions truncate, so rounding always favours the pool.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::vault::clock::UnixSecs;
use crate::vault::errors::VaultError;
use crate::vault::math::{mul_div, Amount, SHARE_PRICE_SCALE};

/// Per-depositor position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub shares: Amount,
    pub deposit_timestamp: UnixSecs,
    pub last_yield_calculation_time: UnixSecs,
    /// Side incentives owed to this depositor (utilization-aware vaults).
    pub accrued_incentives: Amount,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShareLedger {
    total_assets: Amount,
    total_shares: Amount,
    positions: HashMap<String, Position>,
}

impl ShareLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_assets(&self) -> Amount {
        self.total_assets
    }

    pub fn total_shares(&self) -> Amount {
        self.total_shares
    }

    pub fn is_empty(&self) -> bool {
        self.total_shares == 0
    }

    pub fn depositor_count(&self) -> usize {
        self.positions.len()
    }

    pub fn position(&self, depositor: &str) -> Option<&Position> {
        self.positions.get(depositor)
    }

    pub fn positions(&self) -> impl Iterator<Item = (&String, &Position)> {
        self.positions.iter()
    }

    pub fn shares_of(&self, depositor: &str) -> Amount {
        self.positions
            .get(depositor)
            .map(|p| p.shares)
            .unwrap_or(0)
    }

    /// Asset value of a depositor's shares at the current price.
    pub fn assets_of(&self, depositor: &str) -> Result<Amount, VaultError> {
        self.convert_to_assets(self.shares_of(depositor))
    }

    /// Shares a deposit of `assets` mints at the current price.
    pub fn convert_to_shares(&self, assets: Amount) -> Result<Amount, VaultError> {
        if self.total_shares == 0 || self.total_assets == 0 {
            return Ok(assets);
        }
        mul_div(assets, self.total_shares, self.total_assets)
    }

    /// Assets redeemable for `shares` at the current price.
    pub fn convert_to_assets(&self, shares: Amount) -> Result<Amount, VaultError> {
        if self.total_shares == 0 {
            return Ok(shares);
        }
        mul_div(shares, self.total_assets, self.total_shares)
    }

    /// Price of one share scaled by `SHARE_PRICE_SCALE`.
    pub fn share_price(&self) -> Amount {
        if self.total_shares == 0 {
            return SHARE_PRICE_SCALE;
        }
        mul_div(self.total_assets, SHARE_PRICE_SCALE, self.total_shares)
            .unwrap_or(Amount::MAX)
    }

    /// Record a deposit. `shares` must have been priced off the state before
    /// this call; assets are added after the shares so the new depositor
    /// cannot dilute existing holders.
    pub fn mint(
        &mut self,
        depositor: &str,
        shares: Amount,
        assets: Amount,
        now: UnixSecs,
    ) -> Result<(), VaultError> {
        let total_shares = self
            .total_shares
            .checked_add(shares)
            .ok_or(VaultError::MathOverflow)?;
        let total_assets = self
            .total_assets
            .checked_add(assets)
            .ok_or(VaultError::MathOverflow)?;

        let position = self
            .positions
            .entry(depositor.to_string())
            .or_insert_with(|| Position {
                deposit_timestamp: now,
                ..Position::default()
            });
        position.shares += shares;
        position.last_yield_calculation_time = now;

        self.total_shares = total_shares;
        self.total_assets = total_assets;
        Ok(())
    }

    /// Burn `shares` from a depositor and release `assets` from the pool.
    /// Removes the position once it holds no shares and no incentives.
    pub fn burn(
        &mut self,
        depositor: &str,
        shares: Amount,
        assets: Amount,
        now: UnixSecs,
    ) -> Result<(), VaultError> {
        let position = self
            .positions
            .get_mut(depositor)
            .ok_or(VaultError::NoPosition)?;
        if position.shares < shares {
            return Err(VaultError::InsufficientBalance {
                required: shares,
                available: position.shares,
            });
        }
        if self.total_assets < assets {
            return Err(VaultError::MathOverflow);
        }

        position.shares -= shares;
        position.last_yield_calculation_time = now;
        if position.shares == 0 && position.accrued_incentives == 0 {
            self.positions.remove(depositor);
        }

        self.total_shares -= shares;
        self.total_assets -= assets;
        if self.total_shares == 0 {
            // Any dust left after the last holder exits belongs to nobody;
            // reset to 1:1 so the next depositor starts clean.
            self.total_assets = 0;
        }
        Ok(())
    }

    /// Delete a position outright and return what it held.
    pub fn remove_position(&mut self, depositor: &str) -> Option<Position> {
        self.positions.remove(depositor)
    }

    /// Add realized yield to the pool. No-op for an empty pool, since there
    /// is nobody to own it.
    pub fn credit_yield(&mut self, amount: Amount) -> Result<Amount, VaultError> {
        if self.total_shares == 0 || amount == 0 {
            return Ok(0);
        }
        self.total_assets = self
            .total_assets
            .checked_add(amount)
            .ok_or(VaultError::MathOverflow)?;
        Ok(amount)
    }

    /// Split `amount` of incentives across positions pro rata by shares.
    /// Returns the total actually credited (truncation dust is dropped).
    pub fn distribute_incentives(&mut self, amount: Amount) -> Result<Amount, VaultError> {
        if self.total_shares == 0 || amount == 0 {
            return Ok(0);
        }
        let total_shares = self.total_shares;
        let mut credited: Amount = 0;
        for position in self.positions.values_mut() {
            let share = mul_div(amount, position.shares, total_shares)?;
            position.accrued_incentives += share;
            credited += share;
        }
        Ok(credited)
    }

    /// Zero a depositor's accrued incentives and return the amount.
    pub fn take_incentives(&mut self, depositor: &str) -> Amount {
        let Some(position) = self.positions.get_mut(depositor) else {
            return 0;
        };
        let owed = std::mem::take(&mut position.accrued_incentives);
        if position.shares == 0 {
            self.positions.remove(depositor);
        }
        owed
    }

    /// Restart a depositor's pending-yield window.
    pub fn touch(&mut self, depositor: &str, now: UnixSecs) {
        if let Some(position) = self.positions.get_mut(depositor) {
            position.last_yield_calculation_time = now;
        }
    }

    /// Verify that totals agree with the positions.
    pub fn check_conservation(&self) -> Result<(), String> {
        let sum_shares: Amount = self.positions.values().map(|p| p.shares).sum();
        if sum_shares != self.total_shares {
            return Err(format!(
                "share mismatch: positions hold {}, total_shares {}",
                sum_shares, self.total_shares
            ));
        }
        if (self.total_shares == 0) != (self.total_assets == 0) {
            return Err(format!(
                "empty-pool mismatch: total_shares {}, total_assets {}",
                self.total_shares, self.total_assets
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with(deposits: &[(&str, Amount)]) -> ShareLedger {
        let mut ledger = ShareLedger::new();
        for (who, amount) in deposits {
            let shares = ledger.convert_to_shares(*amount).unwrap();
            ledger.mint(who, shares, *amount, 0).unwrap();
        }
        ledger
    }

    #[test]
    fn test_empty_pool_is_one_to_one() {
        let ledger = ShareLedger::new();
        assert_eq!(ledger.convert_to_shares(12_345).unwrap(), 12_345);
        assert_eq!(ledger.convert_to_assets(12_345).unwrap(), 12_345);
        assert_eq!(ledger.share_price(), SHARE_PRICE_SCALE);
    }

    #[test]
    fn test_deposit_after_yield_prices_off_pre_deposit_state() {
        let mut ledger = ledger_with(&[("alice", 1_000)]);
        ledger.credit_yield(1_000).unwrap();
        // Price is now 2.0; 500 assets buy 250 shares.
        let shares = ledger.convert_to_shares(500).unwrap();
        assert_eq!(shares, 250);
        ledger.mint("bob", shares, 500, 10).unwrap();
        assert_eq!(ledger.total_assets(), 2_500);
        assert_eq!(ledger.total_shares(), 1_250);
        assert_eq!(ledger.assets_of("alice").unwrap(), 2_000);
        assert_eq!(ledger.assets_of("bob").unwrap(), 500);
    }

    #[test]
    fn test_round_trip_never_exceeds_input() {
        let mut ledger = ledger_with(&[("alice", 1_000_003)]);
        ledger.credit_yield(777_777).unwrap();
        for x in [1u128, 3, 10, 999, 123_457, 5_000_000] {
            let shares = ledger.convert_to_shares(x).unwrap();
            let back = ledger.convert_to_assets(shares).unwrap();
            assert!(back <= x, "round trip {} -> {} exceeds input", x, back);
            // Truncation loses strictly less than one share's worth plus one unit.
            let bound = ledger.total_assets() / ledger.total_shares() + 1;
            assert!(x - back <= bound, "round trip {} -> {}", x, back);
        }
    }

    #[test]
    fn test_burn_last_holder_empties_pool() {
        let mut ledger = ledger_with(&[("alice", 1_000), ("bob", 3_000)]);
        ledger.credit_yield(7).unwrap();

        let bob_shares = ledger.shares_of("bob");
        let bob_assets = ledger.convert_to_assets(bob_shares).unwrap();
        ledger.burn("bob", bob_shares, bob_assets, 1).unwrap();
        assert!(ledger.position("bob").is_none());

        let alice_shares = ledger.shares_of("alice");
        let alice_assets = ledger.convert_to_assets(alice_shares).unwrap();
        ledger.burn("alice", alice_shares, alice_assets, 2).unwrap();

        assert_eq!(ledger.total_shares(), 0);
        assert_eq!(ledger.total_assets(), 0);
        assert!(ledger.check_conservation().is_ok());
    }

    #[test]
    fn test_burn_more_than_owned_fails() {
        let mut ledger = ledger_with(&[("alice", 1_000)]);
        let err = ledger.burn("alice", 1_001, 1_001, 1).unwrap_err();
        assert_eq!(
            err,
            VaultError::InsufficientBalance {
                required: 1_001,
                available: 1_000
            }
        );
        assert_eq!(ledger.burn("carol", 1, 1, 1), Err(VaultError::NoPosition));
    }

    #[test]
    fn test_incentives_split_by_shares() {
        let mut ledger = ledger_with(&[("alice", 1_000), ("bob", 3_000)]);
        let credited = ledger.distribute_incentives(100).unwrap();
        assert_eq!(credited, 100);
        assert_eq!(ledger.position("alice").unwrap().accrued_incentives, 25);
        assert_eq!(ledger.position("bob").unwrap().accrued_incentives, 75);

        assert_eq!(ledger.take_incentives("bob"), 75);
        assert_eq!(ledger.take_incentives("bob"), 0);
    }

    #[test]
    fn test_credit_yield_on_empty_pool_is_dropped() {
        let mut ledger = ShareLedger::new();
        assert_eq!(ledger.credit_yield(500).unwrap(), 0);
        assert_eq!(ledger.total_assets(), 0);
        assert!(ledger.check_conservation().is_ok());
    }
}
