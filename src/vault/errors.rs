//! Vault error taxonomy
//!
//! Every rejected vault operation returns one of these. Validation errors are
//! raised before any state is touched; risk-control errors are transient and
//! safe to retry once conditions change; backing errors come from the
//! protocol client and never leave the ledger half-updated.

use crate::vault::access::Role;
use crate::vault::math::Amount;

/// Coarse classification used by callers to decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    RiskControl,
    State,
    Access,
    Backing,
    Arithmetic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultError {
    /// Zero amount, or an amount too small to mint a single share.
    InsufficientAmount,
    /// Zero shares requested.
    InsufficientShares,
    InsufficientBalance {
        required: Amount,
        available: Amount,
    },
    BelowMinimumDeposit {
        minimum: Amount,
        actual: Amount,
    },
    ExceedsMaxCapacity {
        capacity: Amount,
        requested_total: Amount,
    },
    /// Empty or malformed depositor identifier.
    InvalidAddress,
    ApyAboveCeiling {
        requested_bps: u32,
        ceiling_bps: u32,
    },
    InvalidHedgeRatio {
        ratio_bps: u32,
    },
    /// The depositor has no open position.
    NoPosition,
    NothingToClaim,
    HighUtilizationRisk {
        utilization_bps: u32,
        threshold_bps: u32,
    },
    RebalanceInProgress,
    DeltaNeutralityBreach {
        deviation_bps: u32,
        threshold_bps: u32,
    },
    VaultPaused,
    EmergencyModeActive,
    Unauthorized {
        caller: String,
        required: Vec<Role>,
    },
    /// Backing protocol call failed on a regular path.
    Backing {
        reason: String,
    },
    EmergencyWithdrawalFailed {
        reason: String,
    },
    MathOverflow,
}

impl VaultError {
    pub fn backing(err: impl std::fmt::Display) -> Self {
        Self::Backing {
            reason: err.to_string(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InsufficientAmount
            | Self::InsufficientShares
            | Self::InsufficientBalance { .. }
            | Self::BelowMinimumDeposit { .. }
            | Self::ExceedsMaxCapacity { .. }
            | Self::InvalidAddress
            | Self::ApyAboveCeiling { .. }
            | Self::InvalidHedgeRatio { .. }
            | Self::NoPosition
            | Self::NothingToClaim => ErrorClass::Validation,
            Self::HighUtilizationRisk { .. }
            | Self::RebalanceInProgress
            | Self::DeltaNeutralityBreach { .. } => ErrorClass::RiskControl,
            Self::VaultPaused | Self::EmergencyModeActive => ErrorClass::State,
            Self::Unauthorized { .. } => ErrorClass::Access,
            Self::Backing { .. } | Self::EmergencyWithdrawalFailed { .. } => ErrorClass::Backing,
            Self::MathOverflow => ErrorClass::Arithmetic,
        }
    }

    /// Risk-control rejections clear on their own; everything else needs
    /// different inputs or an operator.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::RiskControl
    }
}

impl std::fmt::Display for VaultError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientAmount => write!(f, "Insufficient amount"),
            Self::InsufficientShares => write!(f, "Insufficient shares"),
            Self::InsufficientBalance {
                required,
                available,
            } => {
                write!(
                    f,
                    "Insufficient balance: required {} shares, available {}",
                    required, available
                )
            }
            Self::BelowMinimumDeposit { minimum, actual } => {
                write!(f, "Deposit {} below minimum {}", actual, minimum)
            }
            Self::ExceedsMaxCapacity {
                capacity,
                requested_total,
            } => {
                write!(
                    f,
                    "Deposit would raise total assets to {} (capacity {})",
                    requested_total, capacity
                )
            }
            Self::InvalidAddress => write!(f, "Invalid depositor address"),
            Self::ApyAboveCeiling {
                requested_bps,
                ceiling_bps,
            } => {
                write!(
                    f,
                    "APY {} bps above ceiling {} bps",
                    requested_bps, ceiling_bps
                )
            }
            Self::InvalidHedgeRatio { ratio_bps } => {
                write!(f, "Invalid hedge ratio: {} bps", ratio_bps)
            }
            Self::NoPosition => write!(f, "No open position"),
            Self::NothingToClaim => write!(f, "No incentives to claim"),
            Self::HighUtilizationRisk {
                utilization_bps,
                threshold_bps,
            } => {
                write!(
                    f,
                    "Utilization {} bps exceeds threshold {} bps",
                    utilization_bps, threshold_bps
                )
            }
            Self::RebalanceInProgress => write!(f, "Rebalance in progress"),
            Self::DeltaNeutralityBreach {
                deviation_bps,
                threshold_bps,
            } => {
                write!(
                    f,
                    "Delta deviation {} bps exceeds threshold {} bps",
                    deviation_bps, threshold_bps
                )
            }
            Self::VaultPaused => write!(f, "Vault is paused"),
            Self::EmergencyModeActive => write!(f, "Emergency mode active"),
            Self::Unauthorized { caller, required } => {
                write!(f, "{} lacks any of roles {:?}", caller, required)
            }
            Self::Backing { reason } => write!(f, "Backing protocol error: {}", reason),
            Self::EmergencyWithdrawalFailed { reason } => {
                write!(f, "Emergency withdrawal failed: {}", reason)
            }
            Self::MathOverflow => write!(f, "Arithmetic overflow"),
        }
    }
}

impl std::error::Error for VaultError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_errors_are_retryable() {
        assert!(VaultError::RebalanceInProgress.is_retryable());
        assert!(VaultError::HighUtilizationRisk {
            utilization_bps: 9000,
            threshold_bps: 8500
        }
        .is_retryable());
        assert!(!VaultError::InsufficientAmount.is_retryable());
        assert!(!VaultError::backing("pool frozen").is_retryable());
    }

    #[test]
    fn test_display_carries_fields() {
        let err = VaultError::BelowMinimumDeposit {
            minimum: 10_000,
            actual: 1_000,
        };
        assert_eq!(err.to_string(), "Deposit 1000 below minimum 10000");
        assert_eq!(err.class(), ErrorClass::Validation);
    }
}
