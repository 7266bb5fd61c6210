//! Delta-neutral strategy (Resolv-style hedged backing)
//!
//! Assets are split into a long leg and a short leg at `hedge_ratio_bps`
//! (the target long fraction). A rebalance moves both legs back to target
//! through the hedging venue; while it runs, every operation that would move
//! assets is refused with `RebalanceInProgress`.
//!
//! After each harvest the gap between realized and modeled yield is folded
//! into a performance buffer that lifts the yield quoted to depositors.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::vault::access::{capabilities, require_any, Caller};
use crate::vault::backing::BackingClient;
use crate::vault::clock::Clock;
use crate::vault::errors::VaultError;
use crate::vault::events::{EventBus, VaultEvent};
use crate::vault::math::{
    apply_bps, deviation_bps, linear_yield, mul_div, scale_up_bps, Amount, BPS_DENOMINATOR,
};
use crate::vault::pool::{Vault, VaultInner};
use crate::vault::strategy::{
    clamp_risk_score, HarvestReport, StrategyAdapter, StrategyContext, StrategyKind,
    StrategyPerformance,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaNeutralConfig {
    #[serde(default = "default_apy_bps")]
    pub apy_bps: u32,
    #[serde(default = "default_max_apy_bps")]
    pub max_apy_bps: u32,
    #[serde(default = "default_risk_score")]
    pub risk_score: u8,
    /// Target long fraction of total assets
    #[serde(default = "default_hedge_ratio_bps")]
    pub hedge_ratio_bps: u32,
    #[serde(default = "default_rebalance_threshold_bps")]
    pub rebalance_threshold_bps: u32,
    #[serde(default = "default_max_buffer_bps")]
    pub max_buffer_bps: u32,
    /// Smoothing divisor applied on every buffer update
    #[serde(default = "default_buffer_divisor")]
    pub buffer_divisor: u32,
}

fn default_apy_bps() -> u32 {
    1200
}
fn default_max_apy_bps() -> u32 {
    3000
}
fn default_risk_score() -> u8 {
    5
}
fn default_hedge_ratio_bps() -> u32 {
    5000
}
fn default_rebalance_threshold_bps() -> u32 {
    500
}
fn default_max_buffer_bps() -> u32 {
    2000
}
fn default_buffer_divisor() -> u32 {
    2
}

impl Default for DeltaNeutralConfig {
    fn default() -> Self {
        Self {
            apy_bps: default_apy_bps(),
            max_apy_bps: default_max_apy_bps(),
            risk_score: default_risk_score(),
            hedge_ratio_bps: default_hedge_ratio_bps(),
            rebalance_threshold_bps: default_rebalance_threshold_bps(),
            max_buffer_bps: default_max_buffer_bps(),
            buffer_divisor: default_buffer_divisor(),
        }
    }
}

/// Hedge ratio must leave both legs non-empty.
pub fn validate_hedge_ratio(ratio_bps: u32) -> Result<(), VaultError> {
    if ratio_bps == 0 || ratio_bps as u128 >= BPS_DENOMINATOR {
        return Err(VaultError::InvalidHedgeRatio { ratio_bps });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DeltaNeutralStrategy {
    config: DeltaNeutralConfig,
    apy_bps: u32,
    hedge_ratio_bps: u32,
    long_position: Amount,
    short_position: Amount,
    performance_buffer_bps: u32,
    is_rebalancing: bool,
    backing: Arc<dyn BackingClient>,
}

impl DeltaNeutralStrategy {
    pub fn new(config: DeltaNeutralConfig, backing: Arc<dyn BackingClient>) -> Result<Self, VaultError> {
        validate_hedge_ratio(config.hedge_ratio_bps)?;
        Ok(Self {
            apy_bps: config.apy_bps.min(config.max_apy_bps),
            hedge_ratio_bps: config.hedge_ratio_bps,
            long_position: 0,
            short_position: 0,
            performance_buffer_bps: 0,
            is_rebalancing: false,
            backing,
            config,
        })
    }

    pub fn hedge_ratio(&self) -> u32 {
        self.hedge_ratio_bps
    }

    pub fn legs(&self) -> (Amount, Amount) {
        (self.long_position, self.short_position)
    }

    pub fn performance_buffer(&self) -> u32 {
        self.performance_buffer_bps
    }

    pub fn is_rebalancing(&self) -> bool {
        self.is_rebalancing
    }

    fn ensure_idle(&self) -> Result<(), VaultError> {
        if self.is_rebalancing {
            return Err(VaultError::RebalanceInProgress);
        }
        Ok(())
    }

    /// Split `amount` at the hedge ratio: `(long, short)`.
    fn split(&self, amount: Amount) -> Result<(Amount, Amount), VaultError> {
        let long = apply_bps(amount, self.hedge_ratio_bps)?;
        Ok((long, amount - long))
    }

    /// Draw `amount` from both legs in proportion to their current sizes.
    fn draw(&mut self, amount: Amount) -> Result<(), VaultError> {
        let total = self.long_position + self.short_position;
        let long_out = if total == 0 {
            0
        } else {
            mul_div(amount, self.long_position, total)?
        };
        let short_out = amount - long_out.min(amount);
        self.long_position = self.long_position.saturating_sub(long_out);
        self.short_position = self.short_position.saturating_sub(short_out);
        Ok(())
    }

    fn targets(&self, total_assets: Amount) -> Result<(Amount, Amount), VaultError> {
        self.split(total_assets)
    }

    /// `|long - target_long| * 10000 / total_assets`.
    pub fn deviation(&self, total_assets: Amount) -> u32 {
        match self.targets(total_assets) {
            Ok((target_long, _)) => deviation_bps(self.long_position, target_long, total_assets),
            Err(_) => u32::MAX,
        }
    }

    /// Fold one harvest's realized-vs-expected gap into the buffer.
    /// Returns the event to publish, or `None` when nothing was expected.
    pub fn update_performance_buffer(&mut self, actual: Amount, expected: Amount) -> Option<VaultEvent> {
        if expected == 0 {
            return None;
        }
        let old = self.performance_buffer_bps;
        let divisor = self.config.buffer_divisor.max(1) as u128;
        let smoothed: u128 = if actual > expected {
            let out = (actual - expected).saturating_mul(BPS_DENOMINATOR) / expected;
            (old as u128).saturating_add(out) / divisor
        } else if actual < expected {
            let under = (expected - actual).saturating_mul(BPS_DENOMINATOR) / expected;
            (old as u128).saturating_sub(under) / divisor
        } else {
            old as u128
        };
        let new = smoothed.min(self.config.max_buffer_bps as u128) as u32;
        self.performance_buffer_bps = new;

        Some(VaultEvent::PerformanceBufferUpdated {
            old_bps: old,
            new_bps: new,
            actual_yield: actual,
            expected_yield: expected,
        })
    }

    fn quoted_apy(&self) -> u32 {
        scale_up_bps(self.apy_bps as u128, self.performance_buffer_bps)
            .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
            .unwrap_or(self.apy_bps)
    }
}

#[async_trait::async_trait]
impl StrategyAdapter for DeltaNeutralStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::DeltaNeutral
    }

    fn risk_score(&self) -> u8 {
        clamp_risk_score(self.config.risk_score)
    }

    fn current_apy(&self) -> u32 {
        self.apy_bps
    }

    fn update_apy(&mut self, apy_bps: u32) -> Result<u32, VaultError> {
        if apy_bps > self.config.max_apy_bps {
            return Err(VaultError::ApyAboveCeiling {
                requested_bps: apy_bps,
                ceiling_bps: self.config.max_apy_bps,
            });
        }
        Ok(std::mem::replace(&mut self.apy_bps, apy_bps))
    }

    fn check_deposit(&self, _ctx: &StrategyContext, _amount: Amount) -> Result<(), VaultError> {
        self.ensure_idle()
    }

    fn check_withdraw(&self, _ctx: &StrategyContext) -> Result<(), VaultError> {
        self.ensure_idle()
    }

    async fn deposit_to_backing(&mut self, amount: Amount) -> Result<(), VaultError> {
        self.ensure_idle()?;
        let (long, short) = self.split(amount)?;
        self.backing
            .supply(amount)
            .await
            .map_err(VaultError::backing)?;
        self.long_position += long;
        self.short_position += short;
        Ok(())
    }

    async fn withdraw_from_backing(&mut self, amount: Amount) -> Result<Amount, VaultError> {
        self.ensure_idle()?;
        let received = self
            .backing
            .redeem(amount)
            .await
            .map_err(VaultError::backing)?;
        self.draw(amount)?;
        Ok(received)
    }

    async fn emergency_withdraw_from_backing(&mut self, amount: Amount) -> Result<Amount, VaultError> {
        self.ensure_idle()?;
        let received = self
            .backing
            .emergency_redeem(amount)
            .await
            .map_err(|e| VaultError::EmergencyWithdrawalFailed {
                reason: e.to_string(),
            })?;
        self.draw(amount)?;
        Ok(received)
    }

    async fn harvest(&mut self, ctx: &StrategyContext) -> Result<HarvestReport, VaultError> {
        self.ensure_idle()?;
        let expected = linear_yield(ctx.total_assets, self.apy_bps, ctx.elapsed_since_harvest())?;
        if expected == 0 {
            return Ok(HarvestReport::default());
        }
        let realized = self
            .backing
            .collect_yield(expected)
            .await
            .map_err(VaultError::backing)?;

        let (long, short) = self.split(realized)?;
        self.long_position += long;
        self.short_position += short;

        let mut events = Vec::new();
        if let Some(event) = self.update_performance_buffer(realized, expected) {
            events.push(event);
        }
        debug!(
            protocol = self.backing.protocol(),
            expected,
            realized,
            buffer_bps = self.performance_buffer_bps,
            "delta-neutral harvest"
        );
        Ok(HarvestReport {
            realized,
            expected,
            incentives: 0,
            events,
        })
    }

    /// Nominal linear yield lifted by the performance buffer.
    fn user_yield(&self, user_assets: Amount, elapsed_secs: i64) -> Result<Amount, VaultError> {
        let nominal = linear_yield(user_assets, self.apy_bps, elapsed_secs)?;
        scale_up_bps(nominal, self.performance_buffer_bps)
    }

    fn performance(&self) -> StrategyPerformance {
        StrategyPerformance {
            quoted_apy_bps: self.quoted_apy(),
            utilization_bps: None,
            performance_buffer_bps: Some(self.performance_buffer_bps),
        }
    }
}

/// Leg sizes before and after a rebalance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceOutcome {
    pub long_before: Amount,
    pub short_before: Amount,
    pub long_after: Amount,
    pub short_after: Amount,
    pub deviation_before_bps: u32,
    pub deviation_after_bps: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaNeutralInfo {
    pub long_position: Amount,
    pub short_position: Amount,
    pub target_long: Amount,
    pub target_short: Amount,
    pub hedge_ratio_bps: u32,
    pub deviation_bps: u32,
    pub rebalance_threshold_bps: u32,
    pub performance_buffer_bps: u32,
    pub is_rebalancing: bool,
}

impl Vault<DeltaNeutralStrategy> {
    /// `ratio_bps` is the long fraction of total assets: 5000 is the fully
    /// hedged 50/50 split. Values of 0 or 10000 would empty a leg and are
    /// rejected with `InvalidHedgeRatio`.
    pub async fn update_hedge_ratio(&self, caller: &Caller, ratio_bps: u32) -> Result<(), VaultError> {
        require_any(caller, capabilities::HEDGE)?;
        validate_hedge_ratio(ratio_bps)?;
        let now = self.now();
        let mut inner = self.inner.lock().await;
        inner.strategy.ensure_idle()?;

        let old_bps = std::mem::replace(&mut inner.strategy.hedge_ratio_bps, ratio_bps);
        let mut events = vec![VaultEvent::HedgeRatioUpdated {
            old_bps,
            new_bps: ratio_bps,
        }];

        let total_assets = inner.ledger.total_assets();
        let deviation = inner.strategy.deviation(total_assets);
        let threshold = inner.strategy.config.rebalance_threshold_bps;
        if deviation > threshold {
            events.push(VaultEvent::DeltaDeviationDetected {
                deviation_bps: deviation,
                threshold_bps: threshold,
            });
        }
        self.publish(now, events);

        info!(
            vault = %self.name(),
            old_bps,
            new_bps = ratio_bps,
            deviation_bps = deviation,
            "hedge ratio updated"
        );
        Ok(())
    }

    /// Move both legs to target. The hedge adjustment is awaited with the
    /// vault unlocked; `is_rebalancing` fences everything that moves assets
    /// until positions are committed.
    ///
    /// The adjustment and the commit run on their own task, so the fence is
    /// lifted once the venue answers even if the caller stops waiting.
    pub async fn rebalance_position(&self, caller: &Caller) -> Result<RebalanceOutcome, VaultError> {
        require_any(caller, capabilities::REBALANCE)?;

        let (backing, plan) = {
            let mut inner = self.inner.lock().await;
            inner.strategy.ensure_idle()?;
            let total_assets = inner.ledger.total_assets();
            let (target_long, target_short) = inner.strategy.targets(total_assets)?;
            let (long_before, short_before) = inner.strategy.legs();
            inner.strategy.is_rebalancing = true;
            let plan = RebalancePlan {
                total_assets,
                target_long,
                target_short,
                long_before,
                short_before,
                deviation_before: deviation_bps(long_before, target_long, total_assets),
            };
            (inner.strategy.backing.clone(), plan)
        };
        debug!(
            vault = %self.name(),
            long_before = plan.long_before,
            short_before = plan.short_before,
            target_long = plan.target_long,
            target_short = plan.target_short,
            "rebalance started"
        );

        let task = tokio::spawn(adjust_and_commit(
            self.inner.clone(),
            backing,
            plan,
            self.name().to_string(),
            self.events().clone(),
            self.clock(),
        ));
        match task.await {
            Ok(result) => result,
            Err(e) => Err(VaultError::backing(format!("rebalance task failed: {}", e))),
        }
    }

    /// Rebalance only when the deviation alarm is up. Returns `None` when the
    /// legs are within threshold.
    pub async fn rebalance_if_needed(&self, caller: &Caller) -> Result<Option<RebalanceOutcome>, VaultError> {
        require_any(caller, capabilities::REBALANCE)?;
        let now = self.now();
        {
            let inner = self.inner.lock().await;
            if inner.strategy.is_rebalancing || inner.ledger.is_empty() {
                return Ok(None);
            }
            let deviation = inner.strategy.deviation(inner.ledger.total_assets());
            let threshold = inner.strategy.config.rebalance_threshold_bps;
            if deviation <= threshold {
                return Ok(None);
            }
            warn!(vault = %self.name(), deviation_bps = deviation, threshold_bps = threshold, "delta deviation detected");
            self.publish(
                now,
                vec![VaultEvent::DeltaDeviationDetected {
                    deviation_bps: deviation,
                    threshold_bps: threshold,
                }],
            );
        }
        self.rebalance_position(caller).await.map(Some)
    }

    /// Mark the legs to the hedging venue's reported values. Returns the
    /// resulting deviation in bps.
    pub async fn sync_leg_values(
        &self,
        caller: &Caller,
        long: Amount,
        short: Amount,
    ) -> Result<u32, VaultError> {
        require_any(caller, capabilities::HEDGE)?;
        let now = self.now();
        let mut inner = self.inner.lock().await;
        inner.strategy.ensure_idle()?;

        inner.strategy.long_position = long;
        inner.strategy.short_position = short;

        let deviation = inner.strategy.deviation(inner.ledger.total_assets());
        let threshold = inner.strategy.config.rebalance_threshold_bps;
        if deviation > threshold {
            warn!(vault = %self.name(), long, short, deviation_bps = deviation, "legs drifted past threshold");
            self.publish(
                now,
                vec![VaultEvent::DeltaDeviationDetected {
                    deviation_bps: deviation,
                    threshold_bps: threshold,
                }],
            );
        }
        Ok(deviation)
    }

    pub async fn delta_neutral_info(&self) -> DeltaNeutralInfo {
        let inner = self.inner.lock().await;
        let total_assets = inner.ledger.total_assets();
        let strategy = &inner.strategy;
        let (target_long, target_short) = strategy.targets(total_assets).unwrap_or((0, 0));
        DeltaNeutralInfo {
            long_position: strategy.long_position,
            short_position: strategy.short_position,
            target_long,
            target_short,
            hedge_ratio_bps: strategy.hedge_ratio_bps,
            deviation_bps: strategy.deviation(total_assets),
            rebalance_threshold_bps: strategy.config.rebalance_threshold_bps,
            performance_buffer_bps: strategy.performance_buffer_bps,
            is_rebalancing: strategy.is_rebalancing,
        }
    }
}

/// Legs and targets captured when a rebalance starts.
#[derive(Debug, Clone, Copy)]
struct RebalancePlan {
    total_assets: Amount,
    target_long: Amount,
    target_short: Amount,
    long_before: Amount,
    short_before: Amount,
    deviation_before: u32,
}

async fn adjust_and_commit(
    inner: Arc<Mutex<VaultInner<DeltaNeutralStrategy>>>,
    backing: Arc<dyn BackingClient>,
    plan: RebalancePlan,
    name: String,
    events: EventBus,
    clock: Arc<dyn Clock>,
) -> Result<RebalanceOutcome, VaultError> {
    let adjusted = backing.adjust_hedge(plan.target_long, plan.target_short).await;

    let now = clock.now();
    let mut inner = inner.lock().await;
    inner.strategy.is_rebalancing = false;

    if let Err(e) = adjusted {
        warn!(vault = %name, error = %e, "hedge adjustment failed, legs unchanged");
        return Err(VaultError::backing(e));
    }

    inner.strategy.long_position = plan.target_long;
    inner.strategy.short_position = plan.target_short;

    let threshold = inner.strategy.config.rebalance_threshold_bps;
    let deviation_after = inner.strategy.deviation(plan.total_assets);
    if deviation_after > threshold {
        inner.strategy.long_position = plan.long_before;
        inner.strategy.short_position = plan.short_before;
        return Err(VaultError::DeltaNeutralityBreach {
            deviation_bps: deviation_after,
            threshold_bps: threshold,
        });
    }

    let mut published = vec![VaultEvent::PositionRebalanced {
        long_before: plan.long_before,
        short_before: plan.short_before,
        long_after: plan.target_long,
        short_after: plan.target_short,
    }];
    if plan.deviation_before > deviation_after {
        published.push(VaultEvent::DeltaNeutralityRestored {
            deviation_before_bps: plan.deviation_before,
            deviation_after_bps: deviation_after,
        });
    }
    events.publish(&name, now, published);

    info!(
        vault = %name,
        long = plan.target_long,
        short = plan.target_short,
        deviation_before_bps = plan.deviation_before,
        "position rebalanced"
    );
    Ok(RebalanceOutcome {
        long_before: plan.long_before,
        short_before: plan.short_before,
        long_after: plan.target_long,
        short_after: plan.target_short,
        deviation_before_bps: plan.deviation_before,
        deviation_after_bps: deviation_after,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::backing::{BackingOp, InMemoryBacking, InMemoryBackingConfig};
    use crate::vault::clock::ManualClock;
    use crate::vault::pool::VaultLimits;
    use tokio::time::{sleep, timeout, Duration};

    fn strategy_with(backing: Arc<InMemoryBacking>) -> DeltaNeutralStrategy {
        DeltaNeutralStrategy::new(DeltaNeutralConfig::default(), backing).unwrap()
    }

    fn vault_with(backing: Arc<InMemoryBacking>) -> Vault<DeltaNeutralStrategy> {
        Vault::new(
            "resolv",
            VaultLimits {
                min_deposit: 10_000,
                max_capacity: 100_000_000,
            },
            strategy_with(backing),
            Arc::new(ManualClock::new(1_700_000_000)),
        )
    }

    #[test]
    fn test_hedge_ratio_bounds() {
        assert!(validate_hedge_ratio(5_000).is_ok());
        assert_eq!(
            validate_hedge_ratio(0),
            Err(VaultError::InvalidHedgeRatio { ratio_bps: 0 })
        );
        assert!(validate_hedge_ratio(10_000).is_err());
    }

    #[test]
    fn test_performance_buffer_smoothing() {
        let mut s = strategy_with(Arc::new(InMemoryBacking::named("resolv")));
        assert!(s.update_performance_buffer(100, 0).is_none());

        // 10% outperformance: (0 + 1000) / 2
        s.update_performance_buffer(1_100, 1_000);
        assert_eq!(s.performance_buffer(), 500);

        // 2% underperformance: (500 - 200) / 2
        s.update_performance_buffer(980, 1_000);
        assert_eq!(s.performance_buffer(), 150);

        // Deep underperformance floors at zero
        s.update_performance_buffer(0, 1_000);
        assert_eq!(s.performance_buffer(), 0);

        // Huge outperformance caps at the ceiling
        s.update_performance_buffer(10_000, 1_000);
        assert_eq!(s.performance_buffer(), 2_000);
    }

    #[test]
    fn test_user_yield_lifted_by_buffer() {
        let mut s = strategy_with(Arc::new(InMemoryBacking::named("resolv")));
        s.update_performance_buffer(1_200, 1_000); // buffer 1000
        let year = 365 * 86_400;
        // nominal 100_000 * 12% = 12_000, lifted by 10%
        assert_eq!(s.user_yield(100_000, year).unwrap(), 13_200);
        assert_eq!(s.performance().quoted_apy_bps, 1_320);
    }

    #[tokio::test]
    async fn test_deposit_splits_and_withdraw_draws_proportionally() {
        let backing = Arc::new(InMemoryBacking::named("resolv"));
        let vault = vault_with(backing.clone());
        vault.deposit("alice", 100_000).await.unwrap();

        let info = vault.delta_neutral_info().await;
        assert_eq!((info.long_position, info.short_position), (50_000, 50_000));

        let strategist = Caller::strategist("desk");
        vault.sync_leg_values(&strategist, 60_000, 40_000).await.unwrap();
        vault.withdraw("alice", 10_000).await.unwrap();

        let info = vault.delta_neutral_info().await;
        assert_eq!((info.long_position, info.short_position), (54_000, 36_000));
    }

    #[tokio::test]
    async fn test_rebalance_restores_target() {
        let backing = Arc::new(InMemoryBacking::named("resolv"));
        let vault = vault_with(backing.clone());
        let strategist = Caller::strategist("desk");
        vault.deposit("alice", 100_000).await.unwrap();

        let deviation = vault.sync_leg_values(&strategist, 70_000, 30_000).await.unwrap();
        assert_eq!(deviation, 2_000);

        let outcome = vault.rebalance_if_needed(&strategist).await.unwrap().unwrap();
        assert_eq!(outcome.long_after, 50_000);
        assert_eq!(outcome.short_after, 50_000);
        assert_eq!(outcome.deviation_before_bps, 2_000);
        assert_eq!(outcome.deviation_after_bps, 0);
        assert_eq!((backing.book().hedge_long, backing.book().hedge_short), (50_000, 50_000));

        let kinds: Vec<_> = vault
            .events()
            .recent(10)
            .into_iter()
            .map(|r| r.event.kind())
            .collect();
        assert!(kinds.contains(&"delta_deviation_detected"));
        assert!(kinds.contains(&"delta_neutrality_restored"));

        // Within threshold now
        assert!(vault.rebalance_if_needed(&strategist).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_hedge_adjustment_leaves_legs() {
        let backing = Arc::new(InMemoryBacking::named("resolv"));
        let vault = vault_with(backing.clone());
        let strategist = Caller::strategist("desk");
        vault.deposit("alice", 100_000).await.unwrap();
        vault.sync_leg_values(&strategist, 70_000, 30_000).await.unwrap();

        backing.fail_next(BackingOp::AdjustHedge);
        assert!(vault.rebalance_position(&strategist).await.is_err());

        let info = vault.delta_neutral_info().await;
        assert_eq!((info.long_position, info.short_position), (70_000, 30_000));
        assert!(!info.is_rebalancing);
    }

    #[tokio::test]
    async fn test_operations_blocked_while_rebalancing() {
        let backing = Arc::new(InMemoryBacking::new(InMemoryBackingConfig {
            hedge_latency_ms: 200,
            ..InMemoryBackingConfig::named("resolv")
        }));
        let vault = Arc::new(vault_with(backing));
        vault.deposit("alice", 100_000).await.unwrap();

        let rebalancing = {
            let vault = vault.clone();
            tokio::spawn(async move { vault.rebalance_position(&Caller::strategist("desk")).await })
        };
        sleep(Duration::from_millis(50)).await;

        assert!(vault.delta_neutral_info().await.is_rebalancing);
        assert_eq!(vault.deposit("bob", 20_000).await, Err(VaultError::RebalanceInProgress));
        assert_eq!(vault.withdraw("alice", 1_000).await, Err(VaultError::RebalanceInProgress));
        assert_eq!(
            vault.emergency_withdraw(&Caller::admin("ops"), "alice").await,
            Err(VaultError::RebalanceInProgress)
        );

        rebalancing.await.unwrap().unwrap();
        assert!(vault.deposit("bob", 20_000).await.is_ok());
    }

    #[tokio::test]
    async fn test_abandoned_rebalance_still_commits() {
        let backing = Arc::new(InMemoryBacking::new(InMemoryBackingConfig {
            hedge_latency_ms: 200,
            ..InMemoryBackingConfig::named("resolv")
        }));
        let vault = vault_with(backing.clone());
        let strategist = Caller::strategist("desk");
        vault.deposit("alice", 100_000).await.unwrap();
        vault.sync_leg_values(&strategist, 70_000, 30_000).await.unwrap();

        let gave_up = timeout(Duration::from_millis(20), vault.rebalance_position(&strategist)).await;
        assert!(gave_up.is_err());
        assert!(vault.inner.lock().await.strategy.is_rebalancing());

        sleep(Duration::from_millis(400)).await;
        assert!(!vault.inner.lock().await.strategy.is_rebalancing());
        let info = vault.delta_neutral_info().await;
        assert_eq!((info.long_position, info.short_position), (50_000, 50_000));
        assert_eq!((backing.book().hedge_long, backing.book().hedge_short), (50_000, 50_000));

        vault.deposit("bob", 20_000).await.unwrap();
        vault.withdraw("alice", 10_000).await.unwrap();
        assert!(vault.rebalance_position(&strategist).await.is_ok());
    }

    #[tokio::test]
    async fn test_update_hedge_ratio_requires_strategist() {
        let vault = vault_with(Arc::new(InMemoryBacking::named("resolv")));
        vault.deposit("alice", 100_000).await.unwrap();

        assert!(matches!(
            vault.update_hedge_ratio(&Caller::harvester("k"), 6_000).await,
            Err(VaultError::Unauthorized { .. })
        ));
        assert_eq!(
            vault.update_hedge_ratio(&Caller::strategist("desk"), 10_000).await,
            Err(VaultError::InvalidHedgeRatio { ratio_bps: 10_000 })
        );
        vault.update_hedge_ratio(&Caller::strategist("desk"), 6_000).await.unwrap();
        assert_eq!(vault.inner.lock().await.strategy.hedge_ratio(), 6_000);

        let info = vault.delta_neutral_info().await;
        assert_eq!(info.hedge_ratio_bps, 6_000);
        assert_eq!(info.target_long, 60_000);
        assert_eq!(info.deviation_bps, 1_000);
    }
}
