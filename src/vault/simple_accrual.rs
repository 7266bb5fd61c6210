//! Simple accrual strategy (Noble-style T-bill backing)
//!
//! Yield accrues linearly against an administrator-set APY. Nothing about the
//! pool feeds back into the rate.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::vault::backing::BackingClient;
use crate::vault::errors::VaultError;
use crate::vault::math::{linear_yield, Amount};
use crate::vault::strategy::{
    clamp_risk_score, HarvestReport, StrategyAdapter, StrategyContext, StrategyKind,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleAccrualConfig {
    #[serde(default = "default_apy_bps")]
    pub apy_bps: u32,
    #[serde(default = "default_max_apy_bps")]
    pub max_apy_bps: u32,
    #[serde(default = "default_risk_score")]
    pub risk_score: u8,
}

fn default_apy_bps() -> u32 {
    500
}

fn default_max_apy_bps() -> u32 {
    2000
}

fn default_risk_score() -> u8 {
    2
}

impl Default for SimpleAccrualConfig {
    fn default() -> Self {
        Self {
            apy_bps: default_apy_bps(),
            max_apy_bps: default_max_apy_bps(),
            risk_score: default_risk_score(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimpleAccrualStrategy {
    config: SimpleAccrualConfig,
    apy_bps: u32,
    backing: Arc<dyn BackingClient>,
}

impl SimpleAccrualStrategy {
    pub fn new(config: SimpleAccrualConfig, backing: Arc<dyn BackingClient>) -> Self {
        let apy_bps = config.apy_bps.min(config.max_apy_bps);
        Self {
            config,
            apy_bps,
            backing,
        }
    }
}

#[async_trait::async_trait]
impl StrategyAdapter for SimpleAccrualStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::SimpleAccrual
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

    async fn deposit_to_backing(&mut self, amount: Amount) -> Result<(), VaultError> {
        self.backing
            .supply(amount)
            .await
            .map_err(VaultError::backing)
    }

    async fn withdraw_from_backing(&mut self, amount: Amount) -> Result<Amount, VaultError> {
        self.backing
            .redeem(amount)
            .await
            .map_err(VaultError::backing)
    }

    async fn emergency_withdraw_from_backing(&mut self, amount: Amount) -> Result<Amount, VaultError> {
        self.backing
            .emergency_redeem(amount)
            .await
            .map_err(|e| VaultError::EmergencyWithdrawalFailed {
                reason: e.to_string(),
            })
    }

    async fn harvest(&mut self, ctx: &StrategyContext) -> Result<HarvestReport, VaultError> {
        let expected = linear_yield(ctx.total_assets, self.apy_bps, ctx.elapsed_since_harvest())?;
        if expected == 0 {
            return Ok(HarvestReport::default());
        }
        let realized = self
            .backing
            .collect_yield(expected)
            .await
            .map_err(VaultError::backing)?;
        debug!(
            protocol = self.backing.protocol(),
            expected,
            realized,
            "simple accrual harvest"
        );
        Ok(HarvestReport {
            realized,
            expected,
            ..HarvestReport::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::backing::{BackingOp, InMemoryBacking};
    use crate::vault::clock::SECS_PER_DAY;

    fn strategy(apy_bps: u32) -> (SimpleAccrualStrategy, Arc<InMemoryBacking>) {
        let backing = Arc::new(InMemoryBacking::named("noble"));
        let strategy = SimpleAccrualStrategy::new(
            SimpleAccrualConfig {
                apy_bps,
                ..SimpleAccrualConfig::default()
            },
            backing.clone(),
        );
        (strategy, backing)
    }

    #[test]
    fn test_user_yield_full_year() {
        let (s, _) = strategy(800);
        assert_eq!(s.user_yield(10_000, 365 * SECS_PER_DAY).unwrap(), 800);
        assert_eq!(s.user_yield(10_000, 0).unwrap(), 0);
    }

    #[test]
    fn test_initial_apy_clamped_to_ceiling() {
        let (s, _) = strategy(5_000);
        assert_eq!(s.current_apy(), 2_000);
        assert_eq!(s.risk_score(), 2);
    }

    #[test]
    fn test_risk_score_kept_in_range() {
        let backing = Arc::new(InMemoryBacking::named("noble"));
        let loud = SimpleAccrualStrategy::new(
            SimpleAccrualConfig {
                risk_score: 42,
                ..SimpleAccrualConfig::default()
            },
            backing.clone(),
        );
        assert_eq!(loud.risk_score(), 10);

        let silent = SimpleAccrualStrategy::new(
            SimpleAccrualConfig {
                risk_score: 0,
                ..SimpleAccrualConfig::default()
            },
            backing,
        );
        assert_eq!(silent.risk_score(), 1);
    }

    #[tokio::test]
    async fn test_harvest_realizes_through_backing() {
        let (mut s, backing) = strategy(1_000);
        s.deposit_to_backing(100_000).await.unwrap();

        let ctx = StrategyContext {
            now: 365 * SECS_PER_DAY,
            total_assets: 100_000,
            total_shares: 100_000,
            max_capacity: 1_000_000,
            last_harvest_time: 0,
        };
        let report = s.harvest(&ctx).await.unwrap();
        assert_eq!(report.expected, 10_000);
        assert_eq!(report.realized, 10_000);
        assert_eq!(backing.book().balance, 110_000);
    }

    #[tokio::test]
    async fn test_emergency_failure_maps_to_emergency_error() {
        let (mut s, backing) = strategy(500);
        s.deposit_to_backing(1_000).await.unwrap();
        backing.set_failing(BackingOp::EmergencyRedeem, true);
        let err = s.emergency_withdraw_from_backing(1_000).await.unwrap_err();
        assert!(matches!(err, VaultError::EmergencyWithdrawalFailed { .. }));
    }
}
