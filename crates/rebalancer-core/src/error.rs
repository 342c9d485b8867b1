use thiserror::Error;

use crate::types::{ChainId, Identity, OperationType, TokenId};

/// Coarse failure class every [`RebalancerError`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input: bad percentages, length mismatches, empty identities.
    Validation,
    /// Caller is not the owner, delegate, admin, feed or authorized agent.
    Authorization,
    /// Session or action in the wrong lifecycle state, cooldown unmet.
    State,
    /// Slippage exceeded, non-positive or out-of-bounds value.
    Economic,
    /// Signature reused or nonce out of sequence.
    Replay,
    /// Poisoned lock or serialization failure.
    Internal,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Authorization => "authorization",
            Self::State => "state",
            Self::Economic => "economic",
            Self::Replay => "replay",
            Self::Internal => "internal",
        }
    }
}

/// Errors raised by the policy store, session authority and orchestrator.
///
/// Every error aborts the triggering call with no partial effect.
#[derive(Error, Debug)]
pub enum RebalancerError {
    // --- Validation ---
    #[error("{field} must not be empty")]
    EmptyIdentity { field: &'static str },

    #[error("portfolio requires at least one asset")]
    EmptyAssets,

    #[error("asset {token} on chain {chain_id} has non-positive target {target_bps} bps")]
    InvalidTargetBps {
        token: TokenId,
        chain_id: ChainId,
        target_bps: u32,
    },

    #[error("target allocations sum to {sum} bps, expected 10000")]
    AllocationSum { sum: u64 },

    #[error("asset {token} on chain {chain_id} is listed twice")]
    DuplicateAsset { token: TokenId, chain_id: ChainId },

    #[error("asset {token} on chain {chain_id} is not in the portfolio")]
    AssetNotFound { token: TokenId, chain_id: ChainId },

    #[error("{field} of {value} exceeds the maximum of {max}")]
    BoundExceeded {
        field: &'static str,
        value: u64,
        max: u64,
    },

    #[error("cooldown of {value}s is below the minimum of {min}s")]
    CooldownTooShort { value: u64, min: u64 },

    #[error("length mismatch: expected {expected} entries, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("operation of type {actual:?} cannot authorize a {expected:?}")]
    OperationTypeMismatch {
        expected: OperationType,
        actual: OperationType,
    },

    // --- Authorization ---
    #[error("caller {caller} is not {role}")]
    Unauthorized { caller: Identity, role: &'static str },

    #[error("signature does not resolve to owner {owner}")]
    InvalidSignature { owner: Identity },

    // --- State ---
    #[error("owner {0} already has an active portfolio")]
    PortfolioExists(Identity),

    #[error("no active portfolio for owner {0}")]
    PortfolioNotFound(Identity),

    #[error("no active delegation policy for owner {0}")]
    PolicyInactive(Identity),

    #[error("cooldown active for owner {owner}: next rebalance allowed at {ready_at}")]
    CooldownActive {
        owner: Identity,
        ready_at: chrono::DateTime<chrono::Utc>,
    },

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("session {id} is not valid: {reason}")]
    SessionInvalid { id: String, reason: &'static str },

    #[error("batch of {requested} operations exceeds remaining capacity {remaining} of session {id}")]
    OperationCapExceeded {
        id: String,
        requested: usize,
        remaining: u32,
    },

    #[error("reentrant call while {0} is in flight")]
    ReentrantCall(String),

    #[error("rebalance action {0} not found")]
    ActionNotFound(String),

    #[error("rebalance action {0} is already terminal")]
    ActionTerminal(String),

    #[error("{kind} leg {index} of action {action_id} already executed")]
    LegAlreadyExecuted {
        action_id: String,
        kind: &'static str,
        index: usize,
    },

    #[error("{kind} leg index {index} out of range for action {action_id} ({len} legs)")]
    LegIndexOutOfRange {
        action_id: String,
        kind: &'static str,
        index: usize,
        len: usize,
    },

    // --- Economic ---
    #[error("slippage exceeded: received {actual}, minimum {minimum}")]
    SlippageExceeded { minimum: u128, actual: u128 },

    #[error("swap leg {index} allows {allowed_bps} bps of slippage, policy maximum is {max_bps} bps")]
    SlippageBoundExceeded {
        index: usize,
        allowed_bps: u64,
        max_bps: u32,
    },

    #[error("{field} must be positive")]
    NonPositiveAmount { field: &'static str },

    #[error("rebalance of {requested} USD exceeds the policy maximum of {max} USD")]
    RebalanceValueExceeded { requested: u128, max: u128 },

    #[error("value overflow while computing {0}")]
    ValueOverflow(&'static str),

    // --- Replay ---
    #[error("signature already consumed")]
    SignatureReused,

    #[error("nonce mismatch: expected {expected}, got {actual}")]
    NonceMismatch { expected: u64, actual: u64 },

    // --- Internal ---
    #[error("lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl RebalancerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyIdentity { .. }
            | Self::EmptyAssets
            | Self::InvalidTargetBps { .. }
            | Self::AllocationSum { .. }
            | Self::DuplicateAsset { .. }
            | Self::AssetNotFound { .. }
            | Self::BoundExceeded { .. }
            | Self::CooldownTooShort { .. }
            | Self::LengthMismatch { .. }
            | Self::InvalidInput(_)
            | Self::OperationTypeMismatch { .. } => ErrorKind::Validation,

            Self::Unauthorized { .. } | Self::InvalidSignature { .. } => ErrorKind::Authorization,

            Self::PortfolioExists(_)
            | Self::PortfolioNotFound(_)
            | Self::PolicyInactive(_)
            | Self::CooldownActive { .. }
            | Self::SessionNotFound(_)
            | Self::SessionInvalid { .. }
            | Self::OperationCapExceeded { .. }
            | Self::ReentrantCall(_)
            | Self::ActionNotFound(_)
            | Self::ActionTerminal(_)
            | Self::LegAlreadyExecuted { .. }
            | Self::LegIndexOutOfRange { .. } => ErrorKind::State,

            Self::SlippageExceeded { .. }
            | Self::SlippageBoundExceeded { .. }
            | Self::NonPositiveAmount { .. }
            | Self::RebalanceValueExceeded { .. }
            | Self::ValueOverflow(_) => ErrorKind::Economic,

            Self::SignatureReused | Self::NonceMismatch { .. } => ErrorKind::Replay,

            Self::LockPoisoned(_) | Self::Serialization(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn unauthorized(caller: &Identity, role: &'static str) -> Self {
        Self::Unauthorized {
            caller: caller.clone(),
            role,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(RebalancerError::EmptyAssets.kind(), ErrorKind::Validation);
        assert_eq!(
            RebalancerError::unauthorized(&Identity::new("mallory"), "an admin").kind(),
            ErrorKind::Authorization
        );
        assert_eq!(
            RebalancerError::ActionTerminal("a-1".into()).kind(),
            ErrorKind::State
        );
        assert_eq!(
            RebalancerError::SlippageExceeded {
                minimum: 10,
                actual: 9
            }
            .kind(),
            ErrorKind::Economic
        );
        assert_eq!(RebalancerError::SignatureReused.kind(), ErrorKind::Replay);
        assert_eq!(
            RebalancerError::NonceMismatch {
                expected: 1,
                actual: 0
            }
            .kind(),
            ErrorKind::Replay
        );
    }

    #[test]
    fn error_display_carries_values() {
        let err = RebalancerError::AllocationSum { sum: 9_999 };
        assert!(err.to_string().contains("9999"));

        let err = RebalancerError::NonceMismatch {
            expected: 3,
            actual: 5,
        };
        let s = err.to_string();
        assert!(s.contains("expected 3"));
        assert!(s.contains("got 5"));
    }
}
