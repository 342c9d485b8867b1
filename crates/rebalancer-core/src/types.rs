use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Total allocation every active portfolio must sum to.
pub const TOTAL_BPS: u32 = 10_000;
/// Upper bound for a policy's tolerated slippage.
pub const MAX_SLIPPAGE_BPS: u32 = 1_000;
/// Upper bound for a policy's drift threshold.
pub const MAX_THRESHOLD_BPS: u32 = 1_000;
/// Minimum time between two completed rebalances of one owner.
pub const MIN_COOLDOWN_SECS: u64 = 3_600;

pub type ChainId = u64;

/// Owner, delegate, admin, feed or agent identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity(pub String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenId(pub String);

impl TokenId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One target allocation inside a portfolio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub token_id: TokenId,
    pub chain_id: ChainId,
    pub target_bps: u32,
    pub is_active: bool,
}

impl Asset {
    pub fn new(token_id: impl Into<String>, chain_id: ChainId, target_bps: u32) -> Self {
        Self {
            token_id: TokenId::new(token_id),
            chain_id,
            target_bps,
            is_active: true,
        }
    }

    pub fn matches(&self, token_id: &TokenId, chain_id: ChainId) -> bool {
        &self.token_id == token_id && self.chain_id == chain_id
    }
}

/// Target allocation of one owner.
///
/// While `is_active`, target bps sum to exactly [`TOTAL_BPS`] and each is positive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Portfolio {
    pub owner: Identity,
    pub assets: Vec<Asset>,
    pub total_value_usd: u128,
    /// `None` until the first completed rebalance.
    pub last_rebalance_ts: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Numeric bounds a delegate must stay within.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyBounds {
    pub max_slippage_bps: u32,
    pub max_rebalance_usd: u128,
    pub threshold_bps: u32,
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationPolicy {
    pub owner: Identity,
    pub delegate: Identity,
    pub max_slippage_bps: u32,
    pub max_rebalance_usd: u128,
    pub threshold_bps: u32,
    pub cooldown_secs: u64,
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

impl DelegationPolicy {
    pub fn bounds(&self) -> PolicyBounds {
        PolicyBounds {
            max_slippage_bps: self.max_slippage_bps,
            max_rebalance_usd: self.max_rebalance_usd,
            threshold_bps: self.threshold_bps,
            cooldown_secs: self.cooldown_secs,
        }
    }

    /// Hash binding a session to the exact bounds it was issued under.
    pub fn policy_hash(&self) -> String {
        let material = serde_json::json!({
            "owner": self.owner,
            "delegate": self.delegate,
            "max_slippage_bps": self.max_slippage_bps,
            "max_rebalance_usd": self.max_rebalance_usd.to_string(),
            "threshold_bps": self.threshold_bps,
            "cooldown_secs": self.cooldown_secs,
        });
        blake3::hash(material.to_string().as_bytes())
            .to_hex()
            .to_string()
    }
}

/// Observable lifecycle of a session. Every state but `Active` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Revoked,
    Expired,
    Exhausted,
}

impl SessionStatus {
    pub fn name(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Revoked => "revoked",
            Self::Expired => "expired",
            Self::Exhausted => "exhausted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationSession {
    pub id: String,
    pub owner: Identity,
    pub delegate: Identity,
    pub nonce: u64,
    pub expiry: DateTime<Utc>,
    pub policy_hash: String,
    pub is_active: bool,
    pub max_ops: u32,
    pub used_ops: u32,
    pub created_at: DateTime<Utc>,
}

impl DelegationSession {
    /// Status evaluated lazily against `now`; nothing sweeps expired sessions.
    pub fn status_at(&self, now: DateTime<Utc>) -> SessionStatus {
        if !self.is_active {
            SessionStatus::Revoked
        } else if now >= self.expiry {
            SessionStatus::Expired
        } else if self.used_ops >= self.max_ops {
            SessionStatus::Exhausted
        } else {
            SessionStatus::Active
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.status_at(now) == SessionStatus::Active
    }

    pub fn remaining_ops(&self) -> u32 {
        self.max_ops.saturating_sub(self.used_ops)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Swap,
    Bridge,
    Rebalance,
    UpdateBalance,
}

/// Instruction signed by the owner's key and submitted by the delegate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedOperation {
    pub owner: Identity,
    pub delegate: Identity,
    pub nonce: u64,
    pub op_type: OperationType,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapLeg {
    pub token_in: TokenId,
    pub token_out: TokenId,
    pub amount_in: u128,
    pub min_amount_out: u128,
    pub chain_id: ChainId,
    pub route_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeLeg {
    pub token: TokenId,
    pub amount: u128,
    pub from_chain: ChainId,
    pub to_chain: ChainId,
    pub bridge_ref: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Created,
    InProgress,
    Completed,
    Paused,
}

impl ActionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Paused)
    }
}

/// Multi-leg rebalance. `executed` flips to true exactly once, on completion or pause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceAction {
    pub id: String,
    pub owner: Identity,
    pub created_by: Identity,
    pub swap_legs: Vec<SwapLeg>,
    pub bridge_legs: Vec<BridgeLeg>,
    pub total_value_usd: u128,
    pub created_at: DateTime<Utc>,
    pub executed: bool,
    pub status: ActionStatus,
    pub swap_legs_done: Vec<bool>,
    pub bridge_legs_done: Vec<bool>,
}

impl RebalanceAction {
    pub fn legs_remaining(&self) -> usize {
        self.swap_legs_done.iter().filter(|done| !**done).count()
            + self.bridge_legs_done.iter().filter(|done| !**done).count()
    }
}
