//! Vault registry and harvest keeper
//!
//! Vaults with different strategies sit behind one object-safe trait so the
//! binary and the keeper loop can drive them uniformly. Delta-neutral vaults
//! are also tracked by concrete type so the keeper can rebalance them.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::vault::access::Caller;
use crate::vault::backing::{InMemoryBacking, InMemoryBackingConfig};
use crate::vault::clock::Clock;
use crate::vault::delta_neutral::{DeltaNeutralStrategy, RebalanceOutcome};
use crate::vault::errors::VaultError;
use crate::vault::events::EventBus;
use crate::vault::math::Amount;
use crate::vault::pool::{DepositReceipt, Vault, WithdrawReceipt};
use crate::vault::simple_accrual::SimpleAccrualStrategy;
use crate::vault::strategy::{PerformanceData, StrategyAdapter, StrategyInfo, UserPosition};
use crate::vault::utilization::UtilizationAwareStrategy;
use crate::vault::vault_db::VaultDb;

#[async_trait::async_trait]
pub trait ManagedVault: Send + Sync {
    fn name(&self) -> &str;

    async fn deposit(&self, depositor: &str, amount: Amount) -> Result<DepositReceipt, VaultError>;

    async fn withdraw(&self, depositor: &str, shares: Amount) -> Result<WithdrawReceipt, VaultError>;

    async fn claim_incentives(&self, depositor: &str) -> Result<Amount, VaultError>;

    async fn emergency_withdraw(&self, caller: &Caller, depositor: &str) -> Result<WithdrawReceipt, VaultError>;

    async fn harvest_yield(&self, caller: &Caller) -> Result<Amount, VaultError>;

    async fn update_apy(&self, caller: &Caller, apy_bps: u32) -> Result<(), VaultError>;

    async fn pause(&self, caller: &Caller) -> Result<(), VaultError>;

    async fn unpause(&self, caller: &Caller) -> Result<(), VaultError>;

    async fn set_emergency_mode(&self, caller: &Caller, enabled: bool) -> Result<(), VaultError>;

    async fn calculate_user_yield(&self, depositor: &str) -> Amount;

    async fn user_position(&self, depositor: &str) -> Option<UserPosition>;

    async fn strategy_info(&self) -> StrategyInfo;

    async fn performance_data(&self) -> PerformanceData;

    async fn check_invariants(&self) -> Result<(), String>;
}

#[async_trait::async_trait]
impl<S: StrategyAdapter> ManagedVault for Vault<S> {
    fn name(&self) -> &str {
        Vault::name(self)
    }

    async fn deposit(&self, depositor: &str, amount: Amount) -> Result<DepositReceipt, VaultError> {
        Vault::deposit(self, depositor, amount).await
    }

    async fn withdraw(&self, depositor: &str, shares: Amount) -> Result<WithdrawReceipt, VaultError> {
        Vault::withdraw(self, depositor, shares).await
    }

    async fn claim_incentives(&self, depositor: &str) -> Result<Amount, VaultError> {
        Vault::claim_incentives(self, depositor).await
    }

    async fn emergency_withdraw(&self, caller: &Caller, depositor: &str) -> Result<WithdrawReceipt, VaultError> {
        Vault::emergency_withdraw(self, caller, depositor).await
    }

    async fn harvest_yield(&self, caller: &Caller) -> Result<Amount, VaultError> {
        Vault::harvest_yield(self, caller).await
    }

    async fn update_apy(&self, caller: &Caller, apy_bps: u32) -> Result<(), VaultError> {
        Vault::update_apy(self, caller, apy_bps).await
    }

    async fn pause(&self, caller: &Caller) -> Result<(), VaultError> {
        Vault::pause(self, caller).await
    }

    async fn unpause(&self, caller: &Caller) -> Result<(), VaultError> {
        Vault::unpause(self, caller).await
    }

    async fn set_emergency_mode(&self, caller: &Caller, enabled: bool) -> Result<(), VaultError> {
        Vault::set_emergency_mode(self, caller, enabled).await
    }

    async fn calculate_user_yield(&self, depositor: &str) -> Amount {
        Vault::calculate_user_yield(self, depositor).await
    }

    async fn user_position(&self, depositor: &str) -> Option<UserPosition> {
        Vault::user_position(self, depositor).await
    }

    async fn strategy_info(&self) -> StrategyInfo {
        self.get_strategy_info().await
    }

    async fn performance_data(&self) -> PerformanceData {
        self.get_performance_data().await
    }

    async fn check_invariants(&self) -> Result<(), String> {
        Vault::check_invariants(self).await
    }
}

#[derive(Default)]
pub struct VaultRegistry {
    vaults: BTreeMap<String, Arc<dyn ManagedVault>>,
    hedged: BTreeMap<String, Arc<Vault<DeltaNeutralStrategy>>>,
}

impl VaultRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a vault under its name. A later vault with the same name
    /// replaces the earlier one.
    pub fn register(&mut self, vault: Arc<dyn ManagedVault>) {
        let name = vault.name().to_string();
        if self.vaults.insert(name.clone(), vault).is_some() {
            warn!(vault = %name, "vault re-registered, previous instance dropped");
        }
    }

    /// Register a delta-neutral vault; the keeper also rebalances it.
    pub fn register_delta_neutral(&mut self, vault: Arc<Vault<DeltaNeutralStrategy>>) {
        let name = vault.name().to_string();
        self.hedged.insert(name, vault.clone());
        self.register(vault);
    }

    /// Build every enabled vault from `cfg`, each backed by an in-memory
    /// protocol client and publishing into `events`.
    pub fn from_config(cfg: &EngineConfig, clock: Arc<dyn Clock>, events: EventBus) -> Result<Self> {
        cfg.validate()?;
        let mut registry = Self::new();

        if cfg.noble.enabled {
            let backing = Arc::new(InMemoryBacking::new(InMemoryBackingConfig::from_env(&cfg.noble.name)));
            let strategy = SimpleAccrualStrategy::new(cfg.noble.strategy.clone(), backing);
            let vault = Vault::new(&cfg.noble.name, cfg.noble.limits(), strategy, clock.clone())
                .with_event_bus(events.clone());
            registry.register(Arc::new(vault));
        }
        if cfg.aave.enabled {
            let backing = Arc::new(InMemoryBacking::new(InMemoryBackingConfig::from_env(&cfg.aave.name)));
            let strategy = UtilizationAwareStrategy::new(cfg.aave.strategy.clone(), backing);
            let vault = Vault::new(&cfg.aave.name, cfg.aave.limits(), strategy, clock.clone())
                .with_event_bus(events.clone());
            registry.register(Arc::new(vault));
        }
        if cfg.resolv.enabled {
            let backing = Arc::new(InMemoryBacking::new(InMemoryBackingConfig::from_env(&cfg.resolv.name)));
            let strategy = DeltaNeutralStrategy::new(cfg.resolv.strategy.clone(), backing)?;
            let vault = Vault::new(&cfg.resolv.name, cfg.resolv.limits(), strategy, clock.clone())
                .with_event_bus(events.clone());
            registry.register_delta_neutral(Arc::new(vault));
        }

        info!(vaults = ?registry.names(), "vault registry built");
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ManagedVault>> {
        self.vaults.get(name).cloned()
    }

    pub fn delta_neutral(&self, name: &str) -> Option<Arc<Vault<DeltaNeutralStrategy>>> {
        self.hedged.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.vaults.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.vaults.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vaults.is_empty()
    }

    pub async fn strategy_infos(&self) -> Vec<StrategyInfo> {
        let mut out = Vec::with_capacity(self.vaults.len());
        for vault in self.vaults.values() {
            out.push(vault.strategy_info().await);
        }
        out
    }

    /// One keeper round: harvest every vault, then rebalance any
    /// delta-neutral vault whose legs drifted past threshold.
    pub async fn run_keeper_pass(&self, keeper: &Caller) -> KeeperReport {
        let mut report = KeeperReport::default();

        for (name, vault) in &self.vaults {
            match vault.harvest_yield(keeper).await {
                Ok(amount) => {
                    if amount > 0 {
                        report.harvested.push((name.clone(), amount));
                    }
                }
                Err(e) => {
                    warn!(vault = %name, error = %e, "keeper harvest failed");
                    report.errors.push((name.clone(), e.to_string()));
                }
            }
        }

        for (name, vault) in &self.hedged {
            match vault.rebalance_if_needed(keeper).await {
                Ok(Some(outcome)) => report.rebalanced.push((name.clone(), outcome)),
                Ok(None) => {}
                Err(e) => {
                    warn!(vault = %name, error = %e, "keeper rebalance failed");
                    report.errors.push((name.clone(), e.to_string()));
                }
            }
        }

        debug!(
            harvested = report.harvested.len(),
            rebalanced = report.rebalanced.len(),
            errors = report.errors.len(),
            "keeper pass complete"
        );
        report
    }

    /// Write one snapshot row per vault.
    pub async fn snapshot_all(&self, db: &VaultDb, clock: &dyn Clock) -> Result<()> {
        let now = clock.now();
        for vault in self.vaults.values() {
            db.upsert_snapshot(now, &vault.strategy_info().await).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeeperReport {
    pub harvested: Vec<(String, Amount)>,
    pub rebalanced: Vec<(String, RebalanceOutcome)>,
    pub errors: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeeperConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Persist vault snapshots every N passes (0 disables)
    #[serde(default = "default_snapshot_every")]
    pub snapshot_every: u64,
}

fn default_interval_secs() -> u64 {
    3600
}

fn default_snapshot_every() -> u64 {
    1
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            snapshot_every: default_snapshot_every(),
        }
    }
}

/// Periodic harvest/rebalance loop. Runs until the task is aborted.
pub fn spawn_harvest_keeper(
    registry: Arc<VaultRegistry>,
    keeper: Caller,
    cfg: KeeperConfig,
    db: Option<VaultDb>,
    clock: Arc<dyn Clock>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(cfg.interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(
            vaults = registry.len(),
            interval_secs = cfg.interval_secs,
            keeper = %keeper.id,
            "harvest keeper started"
        );

        let mut passes: u64 = 0;
        loop {
            interval.tick().await;
            let report = registry.run_keeper_pass(&keeper).await;
            passes += 1;

            let total: Amount = report.harvested.iter().map(|(_, a)| *a).sum();
            if total > 0 || !report.rebalanced.is_empty() {
                info!(
                    harvested = total,
                    rebalanced = report.rebalanced.len(),
                    "keeper pass"
                );
            }

            if let Some(db) = &db {
                if cfg.snapshot_every > 0 && passes % cfg.snapshot_every == 0 {
                    if let Err(e) = registry.snapshot_all(db, clock.as_ref()).await {
                        warn!(error = %e, "vault snapshot failed");
                    }
                }
            }
        }
    })
}
