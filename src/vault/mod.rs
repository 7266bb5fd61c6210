//! Multi-strategy yield vaults
//!
//! This module handles:
//! 1. Share accounting for pooled deposits (`ledger`, `pool`)
//! 2. Strategy variants behind one adapter interface
//! 3. Role checks, events, persistence and the harvest keeper
//!
//! Architecture:
//! - Each `Vault<S>` owns one `ShareLedger` and one strategy `S`
//! - Strategies reach their protocol only through a `BackingClient`
//! - Committed state changes are published on an `EventBus`

pub mod access;
pub mod backing;
pub mod clock;
pub mod delta_neutral;
pub mod errors;
pub mod events;
pub mod ledger;
pub mod math;
pub mod pool;
pub mod registry;
pub mod simple_accrual;
pub mod strategy;
pub mod utilization;
pub mod vault_db;

pub use access::{capabilities, require_any, Caller, Role};
pub use backing::{BackingClient, BackingOp, InMemoryBacking, InMemoryBackingConfig};
pub use clock::{Clock, ManualClock, SystemClock, UnixSecs};
pub use delta_neutral::{DeltaNeutralConfig, DeltaNeutralInfo, DeltaNeutralStrategy, RebalanceOutcome};
pub use errors::{ErrorClass, VaultError};
pub use events::{EventBus, VaultEvent, VaultEventRecord};
pub use ledger::{Position, ShareLedger};
pub use math::Amount;
pub use pool::*;
pub use registry::*;
pub use simple_accrual::{SimpleAccrualConfig, SimpleAccrualStrategy};
pub use strategy::*;
pub use utilization::{
    CapacityUtilization, FlatIncentiveRate, IncentiveRate, UtilizationAwareConfig,
    UtilizationAwareStrategy, UtilizationModel,
};
pub use vault_db::*;
