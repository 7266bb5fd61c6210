//! Role-based access for privileged vault operations
//!
//! Each privileged entry point names the set of roles allowed to call it and
//! checks the caller against that set before touching any state.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::vault::errors::VaultError;

/// Vault roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "admin")]
    Admin, // APY, pause, emergency controls
    #[serde(rename = "harvester")]
    Harvester, // Periodic yield realization
    #[serde(rename = "strategist")]
    Strategist, // Hedge ratio and rebalancing
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::Admin => "admin",
            Role::Harvester => "harvester",
            Role::Strategist => "strategist",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "harvester" => Some(Role::Harvester),
            "strategist" => Some(Role::Strategist),
            _ => None,
        }
    }
}

/// Capability sets for each privileged operation.
pub mod capabilities {
    use super::Role;

    pub const HARVEST: &[Role] = &[Role::Harvester, Role::Admin];
    pub const UPDATE_APY: &[Role] = &[Role::Admin];
    pub const PAUSE: &[Role] = &[Role::Admin];
    pub const EMERGENCY: &[Role] = &[Role::Admin];
    pub const HEDGE: &[Role] = &[Role::Strategist, Role::Admin];
    pub const REBALANCE: &[Role] = &[Role::Strategist, Role::Admin];
}

/// Identity of whoever invokes a vault operation, with granted roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub id: String,
    roles: HashSet<Role>,
}

impl Caller {
    /// A caller with no privileged roles (plain depositor).
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            roles: HashSet::new(),
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.roles.insert(role);
        self
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self::new(id).with_role(Role::Admin)
    }

    pub fn harvester(id: impl Into<String>) -> Self {
        Self::new(id).with_role(Role::Harvester)
    }

    pub fn strategist(id: impl Into<String>) -> Self {
        Self::new(id).with_role(Role::Strategist)
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn roles(&self) -> impl Iterator<Item = &Role> {
        self.roles.iter()
    }
}

/// Passes when the caller holds at least one of `allowed`.
pub fn require_any(caller: &Caller, allowed: &[Role]) -> Result<(), VaultError> {
    if allowed.iter().any(|r| caller.has_role(*r)) {
        return Ok(());
    }
    Err(VaultError::Unauthorized {
        caller: caller.id.clone(),
        required: allowed.to_vec(),
    })
}
