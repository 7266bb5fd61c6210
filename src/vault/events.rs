//! Vault events
//!
//! Every committed state change produces one or more `VaultEvent`s. Events are
//! buffered while an operation runs and only published once it commits, so
//! subscribers never observe a change that was later rolled back.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::vault::clock::UnixSecs;
use crate::vault::math::Amount;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultEvent {
    Deposited {
        depositor: String,
        amount: Amount,
        shares: Amount,
    },
    Withdrawn {
        depositor: String,
        shares: Amount,
        amount: Amount,
        incentives: Amount,
    },
    YieldHarvested {
        amount: Amount,
        incentives: Amount,
        total_assets: Amount,
        apy_bps: u32,
    },
    IncentivesClaimed {
        depositor: String,
        amount: Amount,
    },
    ApyUpdated {
        old_bps: u32,
        new_bps: u32,
    },
    Paused,
    Unpaused,
    EmergencyModeChanged {
        enabled: bool,
    },
    EmergencyWithdrawal {
        depositor: String,
        shares: Amount,
        amount: Amount,
    },
    HedgeRatioUpdated {
        old_bps: u32,
        new_bps: u32,
    },
    PositionRebalanced {
        long_before: Amount,
        short_before: Amount,
        long_after: Amount,
        short_after: Amount,
    },
    DeltaNeutralityRestored {
        deviation_before_bps: u32,
        deviation_after_bps: u32,
    },
    DeltaDeviationDetected {
        deviation_bps: u32,
        threshold_bps: u32,
    },
    PerformanceBufferUpdated {
        old_bps: u32,
        new_bps: u32,
        actual_yield: Amount,
        expected_yield: Amount,
    },
}

impl VaultEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            VaultEvent::Deposited { .. } => "deposited",
            VaultEvent::Withdrawn { .. } => "withdrawn",
            VaultEvent::YieldHarvested { .. } => "yield_harvested",
            VaultEvent::IncentivesClaimed { .. } => "incentives_claimed",
            VaultEvent::ApyUpdated { .. } => "apy_updated",
            VaultEvent::Paused => "paused",
            VaultEvent::Unpaused => "unpaused",
            VaultEvent::EmergencyModeChanged { .. } => "emergency_mode_changed",
            VaultEvent::EmergencyWithdrawal { .. } => "emergency_withdrawal",
            VaultEvent::HedgeRatioUpdated { .. } => "hedge_ratio_updated",
            VaultEvent::PositionRebalanced { .. } => "position_rebalanced",
            VaultEvent::DeltaNeutralityRestored { .. } => "delta_neutrality_restored",
            VaultEvent::DeltaDeviationDetected { .. } => "delta_deviation_detected",
            VaultEvent::PerformanceBufferUpdated { .. } => "performance_buffer_updated",
        }
    }

    /// Depositor this event concerns, if any.
    pub fn depositor(&self) -> Option<&str> {
        match self {
            VaultEvent::Deposited { depositor, .. }
            | VaultEvent::Withdrawn { depositor, .. }
            | VaultEvent::IncentivesClaimed { depositor, .. }
            | VaultEvent::EmergencyWithdrawal { depositor, .. } => Some(depositor),
            _ => None,
        }
    }

    /// Headline asset amount, if the event moves assets.
    pub fn amount(&self) -> Option<Amount> {
        match self {
            VaultEvent::Deposited { amount, .. }
            | VaultEvent::Withdrawn { amount, .. }
            | VaultEvent::YieldHarvested { amount, .. }
            | VaultEvent::IncentivesClaimed { amount, .. }
            | VaultEvent::EmergencyWithdrawal { amount, .. } => Some(*amount),
            _ => None,
        }
    }
}

/// A published event with its origin and commit time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultEventRecord {
    pub id: String,
    pub ts: UnixSecs,
    pub vault: String,
    pub event: VaultEvent,
}

/// Fan-out of committed events. Keeps a bounded history for late readers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<VaultEventRecord>,
    history: Arc<RwLock<VecDeque<VaultEventRecord>>>,
    history_limit: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self::with_limits(capacity, capacity)
    }

    pub fn with_limits(channel_capacity: usize, history_limit: usize) -> Self {
        let (tx, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            tx,
            history: Arc::new(RwLock::new(VecDeque::with_capacity(history_limit.min(4096)))),
            history_limit: history_limit.max(1),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VaultEventRecord> {
        self.tx.subscribe()
    }

    /// Publish a batch of events that committed together.
    pub fn publish(&self, vault: &str, ts: UnixSecs, events: Vec<VaultEvent>) {
        if events.is_empty() {
            return;
        }
        let mut history = self.history.write();
        for event in events {
            let record = VaultEventRecord {
                id: Uuid::new_v4().to_string(),
                ts,
                vault: vault.to_string(),
                event,
            };
            if history.len() == self.history_limit {
                history.pop_front();
            }
            history.push_back(record.clone());
            // No subscribers is fine
            let _ = self.tx.send(record);
        }
    }

    /// Most recent events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<VaultEventRecord> {
        let history = self.history.read();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// Recent events for one vault, oldest first.
    pub fn recent_for(&self, vault: &str, limit: usize) -> Vec<VaultEventRecord> {
        let history = self.history.read();
        let matching: Vec<_> = history.iter().filter(|r| r.vault == vault).collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).cloned().collect()
    }
}
