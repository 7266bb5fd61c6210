//! Strategy adapter interface
//!
//! A `Vault` owns exactly one strategy and talks to it only through
//! `StrategyAdapter`. The strategy decides how deposited assets are deployed,
//! how much yield they generate and which deposits are too risky to accept;
//! the vault owns the share ledger and all commit/rollback decisions.

use serde::{Deserialize, Serialize};

use crate::vault::clock::UnixSecs;
use crate::vault::errors::VaultError;
use crate::vault::events::VaultEvent;
use crate::vault::math::{linear_yield, Amount};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    SimpleAccrual,
    UtilizationAware,
    DeltaNeutral,
}

impl StrategyKind {
    pub fn as_str(&self) -> &str {
        match self {
            StrategyKind::SimpleAccrual => "simple_accrual",
            StrategyKind::UtilizationAware => "utilization_aware",
            StrategyKind::DeltaNeutral => "delta_neutral",
        }
    }
}

pub const MIN_RISK_SCORE: u8 = 1;
pub const MAX_RISK_SCORE: u8 = 10;

/// Keep a configured risk score inside `MIN_RISK_SCORE..=MAX_RISK_SCORE`.
pub fn clamp_risk_score(score: u8) -> u8 {
    score.clamp(MIN_RISK_SCORE, MAX_RISK_SCORE)
}

/// Read-only view of vault state handed to the strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyContext {
    pub now: UnixSecs,
    pub total_assets: Amount,
    pub total_shares: Amount,
    pub max_capacity: Amount,
    pub last_harvest_time: UnixSecs,
}

impl StrategyContext {
    pub fn elapsed_since_harvest(&self) -> i64 {
        (self.now - self.last_harvest_time).max(0)
    }
}

/// Result of a successful harvest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarvestReport {
    /// Yield actually realized by the backing protocol
    pub realized: Amount,
    /// Yield the nominal APY model predicted
    pub expected: Amount,
    /// Side incentives generated this round, to be split across depositors
    pub incentives: Amount,
    /// Strategy-specific events to publish with the harvest
    pub events: Vec<VaultEvent>,
}

/// Strategy-side performance figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyPerformance {
    /// APY quoted to depositors after strategy adjustments
    pub quoted_apy_bps: u32,
    pub utilization_bps: Option<u32>,
    pub performance_buffer_bps: Option<u32>,
}

#[async_trait::async_trait]
pub trait StrategyAdapter: Clone + Send + Sync + std::fmt::Debug + 'static {
    fn kind(&self) -> StrategyKind;

    /// Nominal risk of the backing protocol, 1 (lowest) to 10.
    fn risk_score(&self) -> u8;

    /// APY currently used for accrual, in bps.
    fn current_apy(&self) -> u32;

    /// Set the administrator-controlled APY. Returns the previous value.
    fn update_apy(&mut self, apy_bps: u32) -> Result<u32, VaultError>;

    /// Recompute any market signal the strategy tracks (utilization, …).
    fn refresh(&mut self, _ctx: &StrategyContext) {}

    /// Strategy-level risk gate for a deposit of `amount`.
    fn check_deposit(&self, _ctx: &StrategyContext, _amount: Amount) -> Result<(), VaultError> {
        Ok(())
    }

    /// Strategy-level gate for withdrawals and emergency exits.
    fn check_withdraw(&self, _ctx: &StrategyContext) -> Result<(), VaultError> {
        Ok(())
    }

    async fn deposit_to_backing(&mut self, amount: Amount) -> Result<(), VaultError>;

    async fn withdraw_from_backing(&mut self, amount: Amount) -> Result<Amount, VaultError>;

    /// Emergency exit. Failures surface as `EmergencyWithdrawalFailed`.
    async fn emergency_withdraw_from_backing(&mut self, amount: Amount)
        -> Result<Amount, VaultError>;

    /// Realize yield accrued since `ctx.last_harvest_time`.
    async fn harvest(&mut self, ctx: &StrategyContext) -> Result<HarvestReport, VaultError>;

    /// Pay out side incentives. Strategies without incentives pay nothing.
    async fn claim_incentives(&mut self, _amount: Amount) -> Result<Amount, VaultError> {
        Ok(0)
    }

    /// Pending yield on `user_assets` over `elapsed_secs`.
    fn user_yield(&self, user_assets: Amount, elapsed_secs: i64) -> Result<Amount, VaultError> {
        linear_yield(user_assets, self.current_apy(), elapsed_secs)
    }

    fn performance(&self) -> StrategyPerformance {
        StrategyPerformance {
            quoted_apy_bps: self.current_apy(),
            utilization_bps: None,
            performance_buffer_bps: None,
        }
    }
}

/// Vault-wide summary returned by `get_strategy_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyInfo {
    pub name: String,
    pub kind: StrategyKind,
    pub total_assets: Amount,
    pub total_shares: Amount,
    pub apy_bps: u32,
    pub risk_score: u8,
    pub last_harvest: UnixSecs,
    pub active: bool,
    pub paused: bool,
    pub emergency_mode: bool,
    pub total_yield_generated: Amount,
    /// Price per share scaled by 1e18
    pub share_price: Amount,
    pub depositors: usize,
}

/// Performance summary returned by `get_performance_data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceData {
    pub name: String,
    pub quoted_apy_bps: u32,
    pub nominal_apy_bps: u32,
    pub total_yield_generated: Amount,
    pub total_assets: Amount,
    pub utilization_bps: Option<u32>,
    pub performance_buffer_bps: Option<u32>,
    pub risk_score: u8,
}

/// Depositor view returned by `user_position`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPosition {
    pub depositor: String,
    pub shares: Amount,
    pub assets: Amount,
    pub pending_yield: Amount,
    pub accrued_incentives: Amount,
    pub deposit_timestamp: UnixSecs,
    pub last_yield_calculation_time: UnixSecs,
}
