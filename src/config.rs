//! Engine configuration
//!
//! One TOML section per vault plus keeper and storage settings. Every field
//! has a default, so an empty file (or no file) yields a runnable engine.

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::vault::delta_neutral::{validate_hedge_ratio, DeltaNeutralConfig};
use crate::vault::pool::VaultLimits;
use crate::vault::registry::KeeperConfig;
use crate::vault::simple_accrual::SimpleAccrualConfig;
use crate::vault::strategy::{MAX_RISK_SCORE, MIN_RISK_SCORE};
use crate::vault::utilization::UtilizationAwareConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite path for the event log and snapshots
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Capacity of the event broadcast channel
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    #[serde(default)]
    pub keeper: KeeperConfig,

    #[serde(default)]
    pub noble: NobleSection,

    #[serde(default)]
    pub aave: AaveSection,

    #[serde(default)]
    pub resolv: ResolvSection,
}

fn default_db_path() -> String {
    "multivault.db".to_string()
}

fn default_event_channel_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            event_channel_capacity: default_event_channel_capacity(),
            keeper: KeeperConfig::default(),
            noble: NobleSection::default(),
            aave: AaveSection::default(),
            resolv: ResolvSection::default(),
        }
    }
}

/// Simple accrual vault
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NobleSection {
    pub enabled: bool,
    pub name: String,
    pub min_deposit: u64,
    pub max_capacity: u64,
    pub strategy: SimpleAccrualConfig,
}

impl Default for NobleSection {
    fn default() -> Self {
        Self {
            enabled: true,
            name: "noble".to_string(),
            min_deposit: 1_000,
            max_capacity: 10_000_000,
            strategy: SimpleAccrualConfig::default(),
        }
    }
}

/// Utilization-aware vault
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AaveSection {
    pub enabled: bool,
    pub name: String,
    pub min_deposit: u64,
    pub max_capacity: u64,
    pub strategy: UtilizationAwareConfig,
}

impl Default for AaveSection {
    fn default() -> Self {
        Self {
            enabled: true,
            name: "aave".to_string(),
            min_deposit: 1_000,
            max_capacity: 50_000_000,
            strategy: UtilizationAwareConfig::default(),
        }
    }
}

/// Delta-neutral vault
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolvSection {
    pub enabled: bool,
    pub name: String,
    pub min_deposit: u64,
    pub max_capacity: u64,
    pub strategy: DeltaNeutralConfig,
}

impl Default for ResolvSection {
    fn default() -> Self {
        Self {
            enabled: true,
            name: "resolv".to_string(),
            min_deposit: 10_000,
            max_capacity: 100_000_000,
            strategy: DeltaNeutralConfig::default(),
        }
    }
}

fn limits(min_deposit: u64, max_capacity: u64) -> VaultLimits {
    VaultLimits {
        min_deposit: min_deposit as u128,
        max_capacity: max_capacity as u128,
    }
}

impl NobleSection {
    pub fn limits(&self) -> VaultLimits {
        limits(self.min_deposit, self.max_capacity)
    }
}

impl AaveSection {
    pub fn limits(&self) -> VaultLimits {
        limits(self.min_deposit, self.max_capacity)
    }
}

impl ResolvSection {
    pub fn limits(&self) -> VaultLimits {
        limits(self.min_deposit, self.max_capacity)
    }
}

fn check_risk_score(name: &str, score: u8) -> anyhow::Result<()> {
    if !(MIN_RISK_SCORE..=MAX_RISK_SCORE).contains(&score) {
        bail!(
            "{}: risk_score {} outside {}..={}",
            name,
            score,
            MIN_RISK_SCORE,
            MAX_RISK_SCORE
        );
    }
    Ok(())
}

fn check_limits(name: &str, min_deposit: u64, max_capacity: u64) -> anyhow::Result<()> {
    if name.trim().is_empty() {
        bail!("vault name must not be empty");
    }
    if max_capacity == 0 {
        bail!("{}: max_capacity must be positive", name);
    }
    if min_deposit > max_capacity {
        bail!(
            "{}: min_deposit {} exceeds max_capacity {}",
            name,
            min_deposit,
            max_capacity
        );
    }
    Ok(())
}

impl EngineConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Self = toml::from_str(&contents).context("parse engine config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `MULTIVAULT_CONFIG_PATH` (or `multivault.toml`), falling back
    /// to defaults. `MULTIVAULT_DB_PATH` overrides the database path.
    pub fn from_env() -> Self {
        let path = std::env::var("MULTIVAULT_CONFIG_PATH")
            .unwrap_or_else(|_| "multivault.toml".to_string());

        let mut config = Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default engine config ({}): {}", path, e);
            Self::default()
        });
        if let Ok(db_path) = std::env::var("MULTIVAULT_DB_PATH") {
            if !db_path.trim().is_empty() {
                config.db_path = db_path;
            }
        }
        config
    }

    /// Save to TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        check_limits(&self.noble.name, self.noble.min_deposit, self.noble.max_capacity)?;
        check_limits(&self.aave.name, self.aave.min_deposit, self.aave.max_capacity)?;
        check_limits(&self.resolv.name, self.resolv.min_deposit, self.resolv.max_capacity)?;
        check_risk_score(&self.noble.name, self.noble.strategy.risk_score)?;
        check_risk_score(&self.aave.name, self.aave.strategy.risk_score)?;
        check_risk_score(&self.resolv.name, self.resolv.strategy.risk_score)?;

        let names = [&self.noble.name, &self.aave.name, &self.resolv.name];
        for (i, a) in names.iter().enumerate() {
            if names[i + 1..].contains(a) {
                bail!("duplicate vault name {}", a);
            }
        }

        if self.aave.strategy.max_utilization_bps > 10_000 {
            bail!(
                "aave: max_utilization_bps {} above 10000",
                self.aave.strategy.max_utilization_bps
            );
        }
        validate_hedge_ratio(self.resolv.strategy.hedge_ratio_bps)
            .map_err(|e| anyhow::anyhow!("resolv: {}", e))?;
        if self.resolv.strategy.buffer_divisor == 0 {
            bail!("resolv: buffer_divisor must be at least 1");
        }
        Ok(())
    }
}
