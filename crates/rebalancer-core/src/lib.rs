//! Delegated portfolio rebalancing core.
//!
//! Owners declare target allocations and numeric policy bounds, then grant an
//! automated delegate a time-boxed, operation-capped session. Every signed
//! instruction is checked against the session's strict nonce sequence and a
//! global used-signature set, and every multi-leg rebalance is booked through
//! the orchestrator until it completes or an admin pauses it.

#![deny(unsafe_code)]

pub mod access;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod locks;
pub mod orchestrator;
pub mod policy;
pub mod price;
pub mod session;
pub mod signer;
pub mod types;

pub use access::{AccessControl, RoleSets};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::{DelegationGrant, EngineSnapshot, RebalanceEngine, SNAPSHOT_VERSION};
pub use error::{ErrorKind, RebalancerError};
pub use ledger::{AuditEvent, AuditLog, LedgerEntry};
pub use orchestrator::{DriftReport, RebalanceOrchestrator};
pub use policy::PolicyStore;
pub use price::{PriceEntry, PriceRegistry};
pub use session::SessionAuthority;
pub use signer::{operation_digest, Ed25519KeyRing, OperationDigest, SignatureVerifier};
pub use types::{
    ActionStatus, Asset, BridgeLeg, ChainId, DelegationPolicy, DelegationSession, Identity,
    OperationType, PolicyBounds, Portfolio, RebalanceAction, SessionStatus, SignedOperation,
    SwapLeg, TokenId, MAX_SLIPPAGE_BPS, MAX_THRESHOLD_BPS, MIN_COOLDOWN_SECS, TOTAL_BPS,
};
