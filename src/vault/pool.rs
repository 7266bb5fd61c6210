//! Pooled vault
//!
//! `Vault<S>` couples a `ShareLedger` with one strategy. Every public
//! operation runs inside the vault mutex from validation through the backing
//! call to commit: state is checkpointed on entry and restored on any error,
//! and events are published only after the operation commits.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::vault::access::{capabilities, require_any, Caller};
use crate::vault::clock::{Clock, UnixSecs};
use crate::vault::errors::{ErrorClass, VaultError};
use crate::vault::events::{EventBus, VaultEvent};
use crate::vault::ledger::ShareLedger;
use crate::vault::math::Amount;
use crate::vault::strategy::{
    PerformanceData, StrategyAdapter, StrategyContext, StrategyInfo, UserPosition,
};

/// Deposit bounds for one vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultLimits {
    pub min_deposit: Amount,
    pub max_capacity: Amount,
}

/// Vault-level flags and counters (the ledger holds assets and shares).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultState {
    pub last_harvest_time: UnixSecs,
    pub total_yield_generated: Amount,
    pub paused: bool,
    pub emergency_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositReceipt {
    pub depositor: String,
    pub amount: Amount,
    pub shares: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawReceipt {
    pub depositor: String,
    pub shares: Amount,
    pub assets: Amount,
    /// Side incentives settled in the same call
    pub incentives: Amount,
}

/// Everything a single operation may mutate; cloned as the rollback point.
#[derive(Debug, Clone)]
pub(crate) struct VaultInner<S> {
    pub(crate) ledger: ShareLedger,
    pub(crate) state: VaultState,
    pub(crate) strategy: S,
}

impl<S> VaultInner<S> {
    pub(crate) fn context(&self, now: UnixSecs, limits: &VaultLimits) -> StrategyContext {
        StrategyContext {
            now,
            total_assets: self.ledger.total_assets(),
            total_shares: self.ledger.total_shares(),
            max_capacity: limits.max_capacity,
            last_harvest_time: self.state.last_harvest_time,
        }
    }
}

pub struct Vault<S: StrategyAdapter> {
    name: String,
    limits: VaultLimits,
    clock: Arc<dyn Clock>,
    events: EventBus,
    pub(crate) inner: Arc<Mutex<VaultInner<S>>>,
}

/// Depositor ids are case-insensitive wallet addresses.
pub fn normalize_depositor(depositor: &str) -> Result<String, VaultError> {
    let id = depositor.trim().to_lowercase();
    if id.is_empty() || id.chars().any(char::is_whitespace) {
        return Err(VaultError::InvalidAddress);
    }
    Ok(id)
}

impl<S: StrategyAdapter> Vault<S> {
    pub fn new(
        name: impl Into<String>,
        limits: VaultLimits,
        strategy: S,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            name: name.into(),
            limits,
            clock,
            events: EventBus::default(),
            inner: Arc::new(Mutex::new(VaultInner {
                ledger: ShareLedger::new(),
                state: VaultState {
                    last_harvest_time: now,
                    ..VaultState::default()
                },
                strategy,
            })),
        }
    }

    /// Publish into a shared bus instead of a private one.
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limits(&self) -> VaultLimits {
        self.limits
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn now(&self) -> UnixSecs {
        self.clock.now()
    }

    pub(crate) fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub(crate) fn publish(&self, now: UnixSecs, events: Vec<VaultEvent>) {
        self.events.publish(&self.name, now, events);
    }

    /// Commit or roll back one operation.
    fn finish<T>(
        &self,
        inner: &mut VaultInner<S>,
        checkpoint: VaultInner<S>,
        result: Result<T, VaultError>,
        now: UnixSecs,
        events: Vec<VaultEvent>,
        op: &'static str,
    ) -> Result<T, VaultError> {
        match result {
            Ok(value) => {
                self.publish(now, events);
                Ok(value)
            }
            Err(err) => {
                *inner = checkpoint;
                debug!(vault = %self.name, op, error = %err, "operation rolled back");
                Err(err)
            }
        }
    }

    // =========================================================================
    // Depositor operations
    // =========================================================================

    pub async fn deposit(&self, depositor: &str, amount: Amount) -> Result<DepositReceipt, VaultError> {
        let depositor = normalize_depositor(depositor)?;
        let now = self.now();
        let mut inner = self.inner.lock().await;
        let checkpoint = inner.clone();
        let mut events = Vec::new();

        let result = self
            .deposit_locked(&mut inner, &depositor, amount, now, &mut events)
            .await;
        let receipt = self.finish(&mut inner, checkpoint, result, now, events, "deposit")?;

        info!(
            vault = %self.name,
            depositor = %receipt.depositor,
            amount = receipt.amount,
            shares = receipt.shares,
            total_assets = inner.ledger.total_assets(),
            "deposit"
        );
        Ok(receipt)
    }

    async fn deposit_locked(
        &self,
        inner: &mut VaultInner<S>,
        depositor: &str,
        amount: Amount,
        now: UnixSecs,
        events: &mut Vec<VaultEvent>,
    ) -> Result<DepositReceipt, VaultError> {
        if amount == 0 {
            return Err(VaultError::InsufficientAmount);
        }
        if amount < self.limits.min_deposit {
            return Err(VaultError::BelowMinimumDeposit {
                minimum: self.limits.min_deposit,
                actual: amount,
            });
        }
        let requested_total = inner
            .ledger
            .total_assets()
            .checked_add(amount)
            .ok_or(VaultError::MathOverflow)?;
        if requested_total > self.limits.max_capacity {
            return Err(VaultError::ExceedsMaxCapacity {
                capacity: self.limits.max_capacity,
                requested_total,
            });
        }
        if inner.state.emergency_mode {
            return Err(VaultError::EmergencyModeActive);
        }
        if inner.state.paused {
            return Err(VaultError::VaultPaused);
        }

        let ctx = inner.context(now, &self.limits);
        inner.strategy.refresh(&ctx);
        inner.strategy.check_deposit(&ctx, amount)?;

        // Priced off pre-deposit state
        let shares = inner.ledger.convert_to_shares(amount)?;
        if shares == 0 {
            return Err(VaultError::InsufficientAmount);
        }
        inner.ledger.mint(depositor, shares, amount, now)?;
        inner.strategy.deposit_to_backing(amount).await?;

        events.push(VaultEvent::Deposited {
            depositor: depositor.to_string(),
            amount,
            shares,
        });
        Ok(DepositReceipt {
            depositor: depositor.to_string(),
            amount,
            shares,
        })
    }

    pub async fn withdraw(&self, depositor: &str, shares: Amount) -> Result<WithdrawReceipt, VaultError> {
        let depositor = normalize_depositor(depositor)?;
        let now = self.now();
        let mut inner = self.inner.lock().await;
        let checkpoint = inner.clone();
        let mut events = Vec::new();

        let result = self
            .withdraw_locked(&mut inner, &depositor, shares, now, &mut events)
            .await;
        let receipt = self.finish(&mut inner, checkpoint, result, now, events, "withdraw")?;

        info!(
            vault = %self.name,
            depositor = %receipt.depositor,
            shares = receipt.shares,
            assets = receipt.assets,
            incentives = receipt.incentives,
            total_assets = inner.ledger.total_assets(),
            "withdraw"
        );
        Ok(receipt)
    }

    async fn withdraw_locked(
        &self,
        inner: &mut VaultInner<S>,
        depositor: &str,
        shares: Amount,
        now: UnixSecs,
        events: &mut Vec<VaultEvent>,
    ) -> Result<WithdrawReceipt, VaultError> {
        if shares == 0 {
            return Err(VaultError::InsufficientShares);
        }
        let available = inner.ledger.shares_of(depositor);
        if available < shares {
            return Err(VaultError::InsufficientBalance {
                required: shares,
                available,
            });
        }
        if inner.state.paused {
            return Err(VaultError::VaultPaused);
        }
        let ctx = inner.context(now, &self.limits);
        inner.strategy.check_withdraw(&ctx)?;

        // Priced off pre-withdrawal state
        let assets = inner.ledger.convert_to_assets(shares)?;
        let owed_incentives = inner
            .ledger
            .position(depositor)
            .map(|p| p.accrued_incentives)
            .unwrap_or(0);

        inner.ledger.burn(depositor, shares, assets, now)?;
        let received = if assets > 0 {
            inner.strategy.withdraw_from_backing(assets).await?
        } else {
            0
        };

        if owed_incentives > 0 {
            inner.ledger.take_incentives(depositor);
        }
        let incentives = self
            .settle_incentives_after_exit(inner, owed_incentives, received)
            .await?;

        events.push(VaultEvent::Withdrawn {
            depositor: depositor.to_string(),
            shares,
            amount: assets,
            incentives,
        });
        Ok(WithdrawReceipt {
            depositor: depositor.to_string(),
            shares,
            assets,
            incentives,
        })
    }

    /// Pay `owed` incentives once `principal` has already left the backing
    /// protocol. If the claim fails the principal is supplied back, so the
    /// protocol balance matches the ledger after the checkpoint is restored.
    async fn settle_incentives_after_exit(
        &self,
        inner: &mut VaultInner<S>,
        owed: Amount,
        principal: Amount,
    ) -> Result<Amount, VaultError> {
        if owed == 0 {
            return Ok(0);
        }
        match inner.strategy.claim_incentives(owed).await {
            Ok(paid) => Ok(paid),
            Err(err) => {
                if principal > 0 {
                    if let Err(resupply) = inner.strategy.deposit_to_backing(principal).await {
                        error!(
                            vault = %self.name,
                            principal,
                            claim_error = %err,
                            error = %resupply,
                            "principal not returned to backing after failed incentive claim"
                        );
                    } else {
                        debug!(vault = %self.name, principal, "principal returned to backing");
                    }
                }
                Err(err)
            }
        }
    }

    /// Pay out a depositor's accrued side incentives without touching shares.
    pub async fn claim_incentives(&self, depositor: &str) -> Result<Amount, VaultError> {
        let depositor = normalize_depositor(depositor)?;
        let now = self.now();
        let mut inner = self.inner.lock().await;
        let checkpoint = inner.clone();
        let mut events = Vec::new();

        let result = self
            .claim_incentives_locked(&mut inner, &depositor, now, &mut events)
            .await;
        let paid = self.finish(&mut inner, checkpoint, result, now, events, "claim_incentives")?;

        info!(vault = %self.name, depositor = %depositor, amount = paid, "incentives claimed");
        Ok(paid)
    }

    async fn claim_incentives_locked(
        &self,
        inner: &mut VaultInner<S>,
        depositor: &str,
        now: UnixSecs,
        events: &mut Vec<VaultEvent>,
    ) -> Result<Amount, VaultError> {
        let owed = inner
            .ledger
            .position(depositor)
            .map(|p| p.accrued_incentives)
            .unwrap_or(0);
        if owed == 0 {
            return Err(VaultError::NothingToClaim);
        }
        inner.ledger.take_incentives(depositor);
        inner.ledger.touch(depositor, now);
        let paid = inner.strategy.claim_incentives(owed).await?;
        events.push(VaultEvent::IncentivesClaimed {
            depositor: depositor.to_string(),
            amount: paid,
        });
        Ok(paid)
    }

    // =========================================================================
    // Privileged operations
    // =========================================================================

    /// Force a depositor's full position out of the vault, regardless of the
    /// pause flag. Either the backing exit succeeds and the position is gone,
    /// or nothing changes.
    pub async fn emergency_withdraw(
        &self,
        caller: &Caller,
        depositor: &str,
    ) -> Result<WithdrawReceipt, VaultError> {
        require_any(caller, capabilities::EMERGENCY)?;
        let depositor = normalize_depositor(depositor)?;
        let now = self.now();
        let mut inner = self.inner.lock().await;
        let checkpoint = inner.clone();
        let mut events = Vec::new();

        let result = self
            .emergency_withdraw_locked(&mut inner, &depositor, now, &mut events)
            .await;
        let receipt =
            self.finish(&mut inner, checkpoint, result, now, events, "emergency_withdraw")?;

        warn!(
            vault = %self.name,
            admin = %caller.id,
            depositor = %receipt.depositor,
            shares = receipt.shares,
            assets = receipt.assets,
            "emergency withdrawal"
        );
        Ok(receipt)
    }

    async fn emergency_withdraw_locked(
        &self,
        inner: &mut VaultInner<S>,
        depositor: &str,
        now: UnixSecs,
        events: &mut Vec<VaultEvent>,
    ) -> Result<WithdrawReceipt, VaultError> {
        let position = inner
            .ledger
            .position(depositor)
            .cloned()
            .ok_or(VaultError::NoPosition)?;
        let ctx = inner.context(now, &self.limits);
        inner.strategy.check_withdraw(&ctx)?;

        let assets = inner.ledger.convert_to_assets(position.shares)?;
        if position.shares > 0 {
            inner.ledger.burn(depositor, position.shares, assets, now)?;
        }
        inner.ledger.remove_position(depositor);

        let received = if assets > 0 {
            inner.strategy.emergency_withdraw_from_backing(assets).await?
        } else {
            0
        };
        let incentives = self
            .settle_incentives_after_exit(inner, position.accrued_incentives, received)
            .await
            .map_err(|e| match e {
                VaultError::EmergencyWithdrawalFailed { .. } => e,
                other => VaultError::EmergencyWithdrawalFailed {
                    reason: other.to_string(),
                },
            })?;

        events.push(VaultEvent::EmergencyWithdrawal {
            depositor: depositor.to_string(),
            shares: position.shares,
            amount: assets,
        });
        Ok(WithdrawReceipt {
            depositor: depositor.to_string(),
            shares: position.shares,
            assets,
            incentives,
        })
    }

    /// Realize accrued yield into `total_assets`. A backing failure is not an
    /// error for the harvester: the call returns 0 and nothing changes.
    pub async fn harvest_yield(&self, caller: &Caller) -> Result<Amount, VaultError> {
        require_any(caller, capabilities::HARVEST)?;
        let now = self.now();
        let mut inner = self.inner.lock().await;
        let checkpoint = inner.clone();
        let mut events = Vec::new();

        let result = self.harvest_locked(&mut inner, now, &mut events).await;
        match result {
            Err(err) if err.class() == ErrorClass::Backing => {
                *inner = checkpoint;
                warn!(vault = %self.name, error = %err, "harvest skipped: backing call failed");
                Ok(0)
            }
            result => {
                let harvested = self.finish(&mut inner, checkpoint, result, now, events, "harvest")?;
                if harvested > 0 {
                    info!(
                        vault = %self.name,
                        amount = harvested,
                        total_assets = inner.ledger.total_assets(),
                        apy_bps = inner.strategy.current_apy(),
                        "yield harvested"
                    );
                }
                Ok(harvested)
            }
        }
    }

    async fn harvest_locked(
        &self,
        inner: &mut VaultInner<S>,
        now: UnixSecs,
        events: &mut Vec<VaultEvent>,
    ) -> Result<Amount, VaultError> {
        if inner.state.paused {
            return Err(VaultError::VaultPaused);
        }
        if inner.ledger.is_empty() {
            inner.state.last_harvest_time = now;
            return Ok(0);
        }

        let ctx = inner.context(now, &self.limits);
        let report = inner.strategy.harvest(&ctx).await?;

        let credited = inner.ledger.credit_yield(report.realized)?;
        let incentives = inner.ledger.distribute_incentives(report.incentives)?;
        inner.state.total_yield_generated += credited;
        inner.state.last_harvest_time = now;

        if credited > 0 || incentives > 0 {
            events.push(VaultEvent::YieldHarvested {
                amount: credited,
                incentives,
                total_assets: inner.ledger.total_assets(),
                apy_bps: inner.strategy.current_apy(),
            });
        }
        events.extend(report.events);
        Ok(credited)
    }

    pub async fn update_apy(&self, caller: &Caller, apy_bps: u32) -> Result<(), VaultError> {
        require_any(caller, capabilities::UPDATE_APY)?;
        let now = self.now();
        let mut inner = self.inner.lock().await;
        let old_bps = inner.strategy.update_apy(apy_bps)?;
        self.publish(
            now,
            vec![VaultEvent::ApyUpdated {
                old_bps,
                new_bps: apy_bps,
            }],
        );
        info!(
            vault = %self.name,
            old_bps,
            new_bps = apy_bps,
            effective_bps = inner.strategy.current_apy(),
            "APY updated"
        );
        Ok(())
    }

    pub async fn pause(&self, caller: &Caller) -> Result<(), VaultError> {
        self.set_paused(caller, true).await
    }

    pub async fn unpause(&self, caller: &Caller) -> Result<(), VaultError> {
        self.set_paused(caller, false).await
    }

    async fn set_paused(&self, caller: &Caller, paused: bool) -> Result<(), VaultError> {
        require_any(caller, capabilities::PAUSE)?;
        let now = self.now();
        let mut inner = self.inner.lock().await;
        if inner.state.paused == paused {
            return Ok(());
        }
        inner.state.paused = paused;
        let event = if paused {
            VaultEvent::Paused
        } else {
            VaultEvent::Unpaused
        };
        self.publish(now, vec![event]);
        info!(vault = %self.name, paused, admin = %caller.id, "pause flag changed");
        Ok(())
    }

    /// Emergency mode blocks new deposits; withdrawals and emergency exits
    /// stay open.
    pub async fn set_emergency_mode(&self, caller: &Caller, enabled: bool) -> Result<(), VaultError> {
        require_any(caller, capabilities::EMERGENCY)?;
        let now = self.now();
        let mut inner = self.inner.lock().await;
        if inner.state.emergency_mode == enabled {
            return Ok(());
        }
        inner.state.emergency_mode = enabled;
        self.publish(now, vec![VaultEvent::EmergencyModeChanged { enabled }]);
        warn!(vault = %self.name, enabled, admin = %caller.id, "emergency mode changed");
        Ok(())
    }

    // =========================================================================
    // Views
    // =========================================================================

    pub async fn calculate_user_yield(&self, depositor: &str) -> Amount {
        let Ok(depositor) = normalize_depositor(depositor) else {
            return 0;
        };
        let now = self.now();
        let inner = self.inner.lock().await;
        Self::pending_yield(&inner, &depositor, now)
    }

    fn pending_yield(inner: &VaultInner<S>, depositor: &str, now: UnixSecs) -> Amount {
        let Some(position) = inner.ledger.position(depositor) else {
            return 0;
        };
        let elapsed = now - position.last_yield_calculation_time;
        inner
            .ledger
            .convert_to_assets(position.shares)
            .and_then(|assets| inner.strategy.user_yield(assets, elapsed))
            .unwrap_or(0)
    }

    pub async fn user_position(&self, depositor: &str) -> Option<UserPosition> {
        let depositor = normalize_depositor(depositor).ok()?;
        let now = self.now();
        let inner = self.inner.lock().await;
        let position = inner.ledger.position(&depositor)?;
        Some(UserPosition {
            depositor: depositor.clone(),
            shares: position.shares,
            assets: inner.ledger.convert_to_assets(position.shares).unwrap_or(0),
            pending_yield: Self::pending_yield(&inner, &depositor, now),
            accrued_incentives: position.accrued_incentives,
            deposit_timestamp: position.deposit_timestamp,
            last_yield_calculation_time: position.last_yield_calculation_time,
        })
    }

    pub async fn get_strategy_info(&self) -> StrategyInfo {
        let inner = self.inner.lock().await;
        StrategyInfo {
            name: self.name.clone(),
            kind: inner.strategy.kind(),
            total_assets: inner.ledger.total_assets(),
            total_shares: inner.ledger.total_shares(),
            apy_bps: inner.strategy.current_apy(),
            risk_score: inner.strategy.risk_score(),
            last_harvest: inner.state.last_harvest_time,
            active: !inner.state.paused && !inner.state.emergency_mode,
            paused: inner.state.paused,
            emergency_mode: inner.state.emergency_mode,
            total_yield_generated: inner.state.total_yield_generated,
            share_price: inner.ledger.share_price(),
            depositors: inner.ledger.depositor_count(),
        }
    }

    pub async fn get_performance_data(&self) -> PerformanceData {
        let inner = self.inner.lock().await;
        let perf = inner.strategy.performance();
        PerformanceData {
            name: self.name.clone(),
            quoted_apy_bps: perf.quoted_apy_bps,
            nominal_apy_bps: inner.strategy.current_apy(),
            total_yield_generated: inner.state.total_yield_generated,
            total_assets: inner.ledger.total_assets(),
            utilization_bps: perf.utilization_bps,
            performance_buffer_bps: perf.performance_buffer_bps,
            risk_score: inner.strategy.risk_score(),
        }
    }

    pub async fn preview_deposit(&self, amount: Amount) -> Result<Amount, VaultError> {
        self.inner.lock().await.ledger.convert_to_shares(amount)
    }

    pub async fn preview_withdraw(&self, shares: Amount) -> Result<Amount, VaultError> {
        self.inner.lock().await.ledger.convert_to_assets(shares)
    }

    /// Capacity headroom; zero while deposits are blocked.
    pub async fn max_deposit(&self) -> Amount {
        let inner = self.inner.lock().await;
        if inner.state.paused || inner.state.emergency_mode {
            return 0;
        }
        self.limits
            .max_capacity
            .saturating_sub(inner.ledger.total_assets())
    }

    pub async fn shares_of(&self, depositor: &str) -> Amount {
        let Ok(depositor) = normalize_depositor(depositor) else {
            return 0;
        };
        self.inner.lock().await.ledger.shares_of(&depositor)
    }

    pub async fn total_assets(&self) -> Amount {
        self.inner.lock().await.ledger.total_assets()
    }

    pub async fn total_shares(&self) -> Amount {
        self.inner.lock().await.ledger.total_shares()
    }

    /// Sum of every depositor's redeemable assets.
    pub async fn sum_of_position_assets(&self) -> Result<Amount, VaultError> {
        let inner = self.inner.lock().await;
        let mut sum: Amount = 0;
        for (_, position) in inner.ledger.positions() {
            sum += inner.ledger.convert_to_assets(position.shares)?;
        }
        Ok(sum)
    }

    pub async fn check_invariants(&self) -> Result<(), String> {
        self.inner.lock().await.ledger.check_conservation()
    }

    pub async fn state(&self) -> VaultState {
        self.inner.lock().await.state.clone()
    }
}
