//! Backing protocol clients
//!
//! `BackingClient` is the only boundary toward the real lending, T-bill or
//! hedging protocol behind a strategy. Strategies receive one at construction
//! and never reach the protocol any other way.

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use tokio::time::{sleep, Duration};
use tracing::debug;

use crate::vault::math::{mul_div, Amount, BPS_DENOMINATOR};

#[async_trait::async_trait]
pub trait BackingClient: Send + Sync + std::fmt::Debug {
    /// Protocol label for logs.
    fn protocol(&self) -> &str;

    async fn supply(&self, amount: Amount) -> Result<()>;

    /// Pull `amount` back out. Returns the amount actually received.
    async fn redeem(&self, amount: Amount) -> Result<Amount>;

    /// Exit path used during emergencies; may skip pacing the normal path
    /// applies.
    async fn emergency_redeem(&self, amount: Amount) -> Result<Amount>;

    /// Realize generated yield. `expected` is what the strategy's nominal
    /// model predicts; the return value is what the protocol actually paid.
    async fn collect_yield(&self, expected: Amount) -> Result<Amount>;

    /// Pay out side incentives (reward tokens).
    async fn claim_rewards(&self, _amount: Amount) -> Result<Amount> {
        Err(anyhow!("{} has no reward program", self.protocol()))
    }

    /// Move the hedge to the given long/short leg sizes.
    async fn adjust_hedge(&self, _long: Amount, _short: Amount) -> Result<()> {
        Err(anyhow!("{} does not support hedging", self.protocol()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackingOp {
    Supply,
    Redeem,
    EmergencyRedeem,
    CollectYield,
    ClaimRewards,
    AdjustHedge,
}

/// In-memory backing configuration
#[derive(Debug, Clone)]
pub struct InMemoryBackingConfig {
    pub protocol: String,
    /// Realized yield as a fraction of expected (10000 = exactly as modeled)
    pub realized_yield_bps: u32,
    /// Latency applied to every call, in ms
    pub latency_ms: u64,
    /// Extra latency for hedge adjustments, in ms
    pub hedge_latency_ms: u64,
}

impl Default for InMemoryBackingConfig {
    fn default() -> Self {
        Self {
            protocol: "in-memory".to_string(),
            realized_yield_bps: 10_000,
            latency_ms: 0,
            hedge_latency_ms: 0,
        }
    }
}

impl InMemoryBackingConfig {
    pub fn named(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            ..Self::default()
        }
    }

    pub fn from_env(protocol: impl Into<String>) -> Self {
        let mut config = Self::named(protocol);

        if let Ok(v) = std::env::var("BACKING_REALIZED_YIELD_BPS") {
            if let Ok(bps) = v.parse() {
                config.realized_yield_bps = bps;
            }
        }
        if let Ok(v) = std::env::var("BACKING_LATENCY_MS") {
            if let Ok(ms) = v.parse() {
                config.latency_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("BACKING_HEDGE_LATENCY_MS") {
            if let Ok(ms) = v.parse() {
                config.hedge_latency_ms = ms;
            }
        }

        config
    }
}

/// Protocol-side balances held by the mock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackingBook {
    /// Principal plus realized yield held in the protocol
    pub balance: Amount,
    pub total_supplied: Amount,
    pub total_redeemed: Amount,
    pub total_yield: Amount,
    pub total_rewards: Amount,
    pub hedge_long: Amount,
    pub hedge_short: Amount,
}

#[derive(Debug, Default)]
struct Failures {
    sticky: HashSet<BackingOp>,
    once: HashSet<BackingOp>,
}

/// Deterministic stand-in for a real protocol, with failure injection.
#[derive(Debug)]
pub struct InMemoryBacking {
    config: InMemoryBackingConfig,
    book: Mutex<BackingBook>,
    failures: Mutex<Failures>,
}

impl Default for InMemoryBacking {
    fn default() -> Self {
        Self::new(InMemoryBackingConfig::default())
    }
}

impl InMemoryBacking {
    pub fn new(config: InMemoryBackingConfig) -> Self {
        Self {
            config,
            book: Mutex::new(BackingBook::default()),
            failures: Mutex::new(Failures::default()),
        }
    }

    pub fn named(protocol: impl Into<String>) -> Self {
        Self::new(InMemoryBackingConfig::named(protocol))
    }

    pub fn book(&self) -> BackingBook {
        self.book.lock().clone()
    }

    /// Fail every call to `op` until cleared.
    pub fn set_failing(&self, op: BackingOp, failing: bool) {
        let mut failures = self.failures.lock();
        if failing {
            failures.sticky.insert(op);
        } else {
            failures.sticky.remove(&op);
        }
    }

    /// Fail only the next call to `op`.
    pub fn fail_next(&self, op: BackingOp) {
        self.failures.lock().once.insert(op);
    }

    fn check(&self, op: BackingOp) -> Result<()> {
        let mut failures = self.failures.lock();
        if failures.sticky.contains(&op) || failures.once.remove(&op) {
            return Err(anyhow!("{} rejected {:?} (injected)", self.config.protocol, op));
        }
        Ok(())
    }

    async fn simulate_latency(&self, extra_ms: u64) {
        let total = self.config.latency_ms + extra_ms;
        if total > 0 {
            sleep(Duration::from_millis(total)).await;
        }
    }

    fn take(&self, amount: Amount) -> Result<Amount> {
        let mut book = self.book.lock();
        if book.balance < amount {
            return Err(anyhow!(
                "{} insufficient liquidity: requested {}, available {}",
                self.config.protocol,
                amount,
                book.balance
            ));
        }
        book.balance -= amount;
        book.total_redeemed += amount;
        Ok(amount)
    }
}

#[async_trait::async_trait]
impl BackingClient for InMemoryBacking {
    fn protocol(&self) -> &str {
        &self.config.protocol
    }

    async fn supply(&self, amount: Amount) -> Result<()> {
        self.simulate_latency(0).await;
        self.check(BackingOp::Supply)?;
        let mut book = self.book.lock();
        book.balance += amount;
        book.total_supplied += amount;
        debug!(protocol = %self.config.protocol, amount, "backing supply");
        Ok(())
    }

    async fn redeem(&self, amount: Amount) -> Result<Amount> {
        self.simulate_latency(0).await;
        self.check(BackingOp::Redeem)?;
        self.take(amount)
    }

    async fn emergency_redeem(&self, amount: Amount) -> Result<Amount> {
        self.check(BackingOp::EmergencyRedeem)?;
        self.take(amount)
    }

    async fn collect_yield(&self, expected: Amount) -> Result<Amount> {
        self.simulate_latency(0).await;
        self.check(BackingOp::CollectYield)?;
        let realized = mul_div(
            expected,
            self.config.realized_yield_bps as u128,
            BPS_DENOMINATOR,
        )
        .map_err(|e| anyhow!("{}", e))?;
        let mut book = self.book.lock();
        book.balance += realized;
        book.total_yield += realized;
        Ok(realized)
    }

    async fn claim_rewards(&self, amount: Amount) -> Result<Amount> {
        self.simulate_latency(0).await;
        self.check(BackingOp::ClaimRewards)?;
        self.book.lock().total_rewards += amount;
        Ok(amount)
    }

    async fn adjust_hedge(&self, long: Amount, short: Amount) -> Result<()> {
        self.simulate_latency(self.config.hedge_latency_ms).await;
        self.check(BackingOp::AdjustHedge)?;
        let mut book = self.book.lock();
        book.hedge_long = long;
        book.hedge_short = short;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_supply_redeem_and_liquidity_limit() {
        let backing = InMemoryBacking::named("noble");
        backing.supply(1_000).await.unwrap();
        assert_eq!(backing.redeem(400).await.unwrap(), 400);
        assert!(backing.redeem(601).await.is_err());
        assert_eq!(backing.book().balance, 600);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let backing = InMemoryBacking::named("aave");
        backing.fail_next(BackingOp::Supply);
        assert!(backing.supply(10).await.is_err());
        assert!(backing.supply(10).await.is_ok());

        backing.set_failing(BackingOp::CollectYield, true);
        assert!(backing.collect_yield(5).await.is_err());
        assert!(backing.collect_yield(5).await.is_err());
        backing.set_failing(BackingOp::CollectYield, false);
        assert_eq!(backing.collect_yield(5).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_realized_yield_scaling() {
        let backing = InMemoryBacking::new(InMemoryBackingConfig {
            realized_yield_bps: 12_000,
            ..InMemoryBackingConfig::named("resolv")
        });
        assert_eq!(backing.collect_yield(1_000).await.unwrap(), 1_200);
        assert_eq!(backing.book().total_yield, 1_200);
    }
}
