//! Utilization-aware strategy (Aave-style lending backing)
//!
//! The pool's fill level against its capacity drives three things:
//! - deposits are refused once utilization passes the risk threshold
//! - the accrual APY is boosted above the boost threshold
//! - quoted APY is discounted above the discount threshold
//!
//! Each harvest also accrues side incentives, paid out per depositor.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::vault::backing::BackingClient;
use crate::vault::errors::VaultError;
use crate::vault::math::{apply_bps, clamp_bps, linear_yield, mul_div, scale_up_bps, Amount, BPS_DENOMINATOR};
use crate::vault::strategy::{
    clamp_risk_score, HarvestReport, StrategyAdapter, StrategyContext, StrategyKind,
    StrategyPerformance,
};

/// Maps pool size to a utilization signal in `[0, 10000]` bps.
pub trait UtilizationModel: Send + Sync + std::fmt::Debug {
    fn utilization_bps(&self, total_assets: Amount, max_capacity: Amount) -> u32;
}

/// `total_assets * 10000 / max_capacity`, clamped to 100%.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapacityUtilization;

impl UtilizationModel for CapacityUtilization {
    fn utilization_bps(&self, total_assets: Amount, max_capacity: Amount) -> u32 {
        if max_capacity == 0 {
            return BPS_DENOMINATOR as u32;
        }
        match total_assets.checked_mul(BPS_DENOMINATOR) {
            Some(v) => clamp_bps(v / max_capacity),
            None => BPS_DENOMINATOR as u32,
        }
    }
}

/// Incentives generated by one harvest.
pub trait IncentiveRate: Send + Sync + std::fmt::Debug {
    fn incentives(&self, total_assets: Amount, utilization_bps: u32) -> Result<Amount, VaultError>;
}

/// Fixed share of `total_assets` per harvest.
#[derive(Debug, Clone, Copy)]
pub struct FlatIncentiveRate {
    pub bps: u32,
}

impl IncentiveRate for FlatIncentiveRate {
    fn incentives(&self, total_assets: Amount, _utilization_bps: u32) -> Result<Amount, VaultError> {
        apply_bps(total_assets, self.bps)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtilizationAwareConfig {
    #[serde(default = "default_base_apy_bps")]
    pub base_apy_bps: u32,
    #[serde(default = "default_max_apy_bps")]
    pub max_apy_bps: u32,
    #[serde(default = "default_risk_score")]
    pub risk_score: u8,
    /// Deposits are refused above this pre-deposit utilization
    #[serde(default = "default_max_utilization_bps")]
    pub max_utilization_bps: u32,
    /// APY is boosted above this utilization
    #[serde(default = "default_boost_threshold_bps")]
    pub boost_threshold_bps: u32,
    /// Quoted APY is discounted above this utilization
    #[serde(default = "default_discount_threshold_bps")]
    pub discount_threshold_bps: u32,
    #[serde(default = "default_performance_discount_bps")]
    pub performance_discount_bps: u32,
    /// Flat incentive rate per harvest, as bps of total assets
    #[serde(default = "default_incentive_bps")]
    pub incentive_bps: u32,
}

fn default_base_apy_bps() -> u32 {
    350
}
fn default_max_apy_bps() -> u32 {
    2500
}
fn default_risk_score() -> u8 {
    3
}
fn default_max_utilization_bps() -> u32 {
    8500
}
fn default_boost_threshold_bps() -> u32 {
    5000
}
fn default_discount_threshold_bps() -> u32 {
    7000
}
fn default_performance_discount_bps() -> u32 {
    1000
}
fn default_incentive_bps() -> u32 {
    50
}

impl Default for UtilizationAwareConfig {
    fn default() -> Self {
        Self {
            base_apy_bps: default_base_apy_bps(),
            max_apy_bps: default_max_apy_bps(),
            risk_score: default_risk_score(),
            max_utilization_bps: default_max_utilization_bps(),
            boost_threshold_bps: default_boost_threshold_bps(),
            discount_threshold_bps: default_discount_threshold_bps(),
            performance_discount_bps: default_performance_discount_bps(),
            incentive_bps: default_incentive_bps(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UtilizationAwareStrategy {
    config: UtilizationAwareConfig,
    base_apy_bps: u32,
    utilization_bps: u32,
    effective_apy_bps: u32,
    backing: Arc<dyn BackingClient>,
    model: Arc<dyn UtilizationModel>,
    incentive_rate: Arc<dyn IncentiveRate>,
}

impl UtilizationAwareStrategy {
    /// Capacity-based utilization and a flat incentive rate from `config`.
    pub fn new(config: UtilizationAwareConfig, backing: Arc<dyn BackingClient>) -> Self {
        let incentive_rate = Arc::new(FlatIncentiveRate {
            bps: config.incentive_bps,
        });
        Self::with_policy(config, backing, Arc::new(CapacityUtilization), incentive_rate)
    }

    pub fn with_policy(
        config: UtilizationAwareConfig,
        backing: Arc<dyn BackingClient>,
        model: Arc<dyn UtilizationModel>,
        incentive_rate: Arc<dyn IncentiveRate>,
    ) -> Self {
        let base_apy_bps = config.base_apy_bps.min(config.max_apy_bps);
        Self {
            config,
            base_apy_bps,
            utilization_bps: 0,
            effective_apy_bps: base_apy_bps,
            backing,
            model,
            incentive_rate,
        }
    }

    pub fn base_apy(&self) -> u32 {
        self.base_apy_bps
    }

    /// Utilization as of the last refresh.
    pub fn utilization(&self) -> u32 {
        self.utilization_bps
    }

    fn boosted_apy(&self, utilization_bps: u32) -> u32 {
        if utilization_bps <= self.config.boost_threshold_bps {
            return self.base_apy_bps;
        }
        scale_up_bps(self.base_apy_bps as u128, utilization_bps)
            .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
            .unwrap_or(self.base_apy_bps)
    }

    fn recompute(&mut self, utilization_bps: u32) {
        self.utilization_bps = utilization_bps;
        self.effective_apy_bps = self.boosted_apy(utilization_bps);
    }
}

#[async_trait::async_trait]
impl StrategyAdapter for UtilizationAwareStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::UtilizationAware
    }

    fn risk_score(&self) -> u8 {
        clamp_risk_score(self.config.risk_score)
    }

    fn current_apy(&self) -> u32 {
        self.effective_apy_bps
    }

    fn update_apy(&mut self, apy_bps: u32) -> Result<u32, VaultError> {
        if apy_bps > self.config.max_apy_bps {
            return Err(VaultError::ApyAboveCeiling {
                requested_bps: apy_bps,
                ceiling_bps: self.config.max_apy_bps,
            });
        }
        let old = std::mem::replace(&mut self.base_apy_bps, apy_bps);
        self.recompute(self.utilization_bps);
        Ok(old)
    }

    fn refresh(&mut self, ctx: &StrategyContext) {
        let utilization = self.model.utilization_bps(ctx.total_assets, ctx.max_capacity);
        self.recompute(utilization);
    }

    fn check_deposit(&self, ctx: &StrategyContext, amount: Amount) -> Result<(), VaultError> {
        let utilization = self.model.utilization_bps(ctx.total_assets, ctx.max_capacity);
        if utilization > self.config.max_utilization_bps {
            warn!(
                utilization_bps = utilization,
                threshold_bps = self.config.max_utilization_bps,
                amount,
                "deposit refused on utilization"
            );
            return Err(VaultError::HighUtilizationRisk {
                utilization_bps: utilization,
                threshold_bps: self.config.max_utilization_bps,
            });
        }
        Ok(())
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
        self.refresh(ctx);
        let elapsed = ctx.elapsed_since_harvest();
        if elapsed == 0 {
            return Ok(HarvestReport::default());
        }

        let expected = linear_yield(ctx.total_assets, self.effective_apy_bps, elapsed)?;
        let realized = if expected > 0 {
            self.backing
                .collect_yield(expected)
                .await
                .map_err(VaultError::backing)?
        } else {
            0
        };
        let incentives = self
            .incentive_rate
            .incentives(ctx.total_assets, self.utilization_bps)?;

        debug!(
            protocol = self.backing.protocol(),
            utilization_bps = self.utilization_bps,
            effective_apy_bps = self.effective_apy_bps,
            expected,
            realized,
            incentives,
            "utilization-aware harvest"
        );
        Ok(HarvestReport {
            realized,
            expected,
            incentives,
            events: Vec::new(),
        })
    }

    async fn claim_incentives(&mut self, amount: Amount) -> Result<Amount, VaultError> {
        self.backing
            .claim_rewards(amount)
            .await
            .map_err(VaultError::backing)
    }

    fn performance(&self) -> StrategyPerformance {
        let quoted = if self.utilization_bps > self.config.discount_threshold_bps {
            let keep = BPS_DENOMINATOR - self.config.performance_discount_bps.min(10_000) as u128;
            mul_div(self.effective_apy_bps as u128, keep, BPS_DENOMINATOR)
                .map(|v| v as u32)
                .unwrap_or(self.effective_apy_bps)
        } else {
            self.effective_apy_bps
        };
        StrategyPerformance {
            quoted_apy_bps: quoted,
            utilization_bps: Some(self.utilization_bps),
            performance_buffer_bps: None,
        }
    }
}
