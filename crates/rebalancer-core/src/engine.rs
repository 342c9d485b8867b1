use crate::access::{AccessControl, RoleSets};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::RebalancerError;
use crate::ledger::{AuditLog, LedgerEntry};
use crate::locks::KeyedLocks;
use crate::orchestrator::{DriftReport, OrchestratorSnapshot, RebalanceOrchestrator};
use crate::policy::{PolicyStore, PolicyStoreSnapshot};
use crate::price::{PriceEntry, PriceRegistry};
use crate::session::{SessionAuthority, SessionAuthoritySnapshot};
use crate::signer::{OperationDigest, SignatureVerifier};
use crate::types::{
    Asset, BridgeLeg, ChainId, DelegationPolicy, DelegationSession, Identity, OperationType,
    PolicyBounds, Portfolio, RebalanceAction, SignedOperation, SwapLeg, TokenId,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Serializable image of the whole engine: every registry plus the audit log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub version: u32,
    pub roles: RoleSets,
    pub policies: PolicyStoreSnapshot,
    pub sessions: SessionAuthoritySnapshot,
    pub actions: OrchestratorSnapshot,
    pub prices: Vec<PriceEntry>,
    pub audit: Vec<LedgerEntry>,
}

/// Session issued alongside a policy by [`RebalanceEngine::enable_delegation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationGrant {
    pub policy: DelegationPolicy,
    pub session: DelegationSession,
}

/// Single coordinating instance owning every registry.
///
/// Components share one clock and one audit log. Cross-component flows
/// (delegation grants, rebalance triggers) live here.
pub struct RebalanceEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    access: Arc<AccessControl>,
    audit: Arc<AuditLog>,
    policies: Arc<PolicyStore>,
    prices: Arc<PriceRegistry>,
    sessions: SessionAuthority,
    orchestrator: RebalanceOrchestrator,
    triggers: KeyedLocks,
}

impl RebalanceEngine {
    pub fn new(
        config: EngineConfig,
        verifier: Arc<dyn SignatureVerifier>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RebalancerError> {
        config.validate()?;

        let access = Arc::new(AccessControl::new(config.roles()));
        let audit = Arc::new(AuditLog::new());
        let policies = Arc::new(PolicyStore::new(clock.clone(), audit.clone()));
        let prices = Arc::new(PriceRegistry::new(access.clone()));
        let sessions =
            SessionAuthority::new(verifier, access.clone(), clock.clone(), audit.clone());
        let orchestrator = RebalanceOrchestrator::new(
            policies.clone(),
            prices.clone(),
            access.clone(),
            clock.clone(),
            audit.clone(),
            config.enforce_slippage_bounds,
        );

        info!(
            admins = config.admins.len(),
            agents = config.authorized_agents.len(),
            feeds = config.price_feeds.len(),
            "Rebalance engine initialized"
        );

        Ok(Self {
            config,
            clock,
            access,
            audit,
            policies,
            prices,
            sessions,
            orchestrator,
            triggers: KeyedLocks::new(),
        })
    }

    pub fn with_system_clock(
        config: EngineConfig,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Result<Self, RebalancerError> {
        Self::new(config, verifier, Arc::new(SystemClock))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // --- Roles -------------------------------------------------------------

    pub fn add_authorized_agent(
        &self,
        caller: &Identity,
        agent: Identity,
    ) -> Result<(), RebalancerError> {
        self.access.add_authorized_agent(caller, agent)
    }

    pub fn remove_authorized_agent(
        &self,
        caller: &Identity,
        agent: &Identity,
    ) -> Result<bool, RebalancerError> {
        self.access.remove_authorized_agent(caller, agent)
    }

    pub fn grant_price_feed(&self, caller: &Identity, feed: Identity) -> Result<(), RebalancerError> {
        self.access.grant_price_feed(caller, feed)
    }

    pub fn revoke_price_feed(
        &self,
        caller: &Identity,
        feed: &Identity,
    ) -> Result<bool, RebalancerError> {
        self.access.revoke_price_feed(caller, feed)
    }

    // --- Portfolio and policy ------------------------------------------------

    pub fn create_portfolio(
        &self,
        owner: &Identity,
        assets: Vec<Asset>,
    ) -> Result<Portfolio, RebalancerError> {
        self.policies.create_portfolio(owner, assets)
    }

    pub fn update_portfolio(
        &self,
        owner: &Identity,
        assets: Vec<Asset>,
    ) -> Result<Portfolio, RebalancerError> {
        self.policies.update_portfolio(owner, assets)
    }

    pub fn add_asset(&self, owner: &Identity, asset: Asset) -> Result<Portfolio, RebalancerError> {
        self.policies.add_asset(owner, asset)
    }

    pub fn remove_asset(
        &self,
        owner: &Identity,
        token: &TokenId,
        chain_id: ChainId,
    ) -> Result<Portfolio, RebalancerError> {
        self.policies.remove_asset(owner, token, chain_id)
    }

    pub fn deactivate_portfolio(&self, owner: &Identity) -> Result<(), RebalancerError> {
        self.policies.deactivate_portfolio(owner)
    }

    pub fn set_delegation_policy(
        &self,
        owner: &Identity,
        delegate: &Identity,
        bounds: PolicyBounds,
    ) -> Result<DelegationPolicy, RebalancerError> {
        self.policies.set_delegation_policy(owner, delegate, bounds)
    }

    pub fn revoke_delegation(&self, owner: &Identity) -> Result<(), RebalancerError> {
        self.policies.revoke_delegation(owner)
    }

    pub fn update_balance(
        &self,
        caller: &Identity,
        owner: &Identity,
        token: &TokenId,
        new_balance: u128,
    ) -> Result<(), RebalancerError> {
        self.policies.update_balance(caller, owner, token, new_balance)
    }

    pub fn balance(&self, owner: &Identity, token: &TokenId) -> u128 {
        self.policies.balance(owner, token)
    }

    pub fn needs_rebalancing(
        &self,
        owner: &Identity,
        current_bps: &[u32],
    ) -> Result<bool, RebalancerError> {
        self.policies.needs_rebalancing(owner, current_bps)
    }

    pub fn execute_rebalance(
        &self,
        caller: &Identity,
        owner: &Identity,
        total_value_usd: u128,
    ) -> Result<Portfolio, RebalancerError> {
        self.policies.execute_rebalance(caller, owner, total_value_usd)
    }

    // --- Delegation grants -----------------------------------------------------

    /// Set the policy, then issue a session bound to its hash.
    ///
    /// `ttl_secs` and `max_ops` fall back to the configured defaults.
    pub fn enable_delegation(
        &self,
        owner: &Identity,
        delegate: &Identity,
        bounds: PolicyBounds,
        ttl_secs: Option<u64>,
        max_ops: Option<u32>,
    ) -> Result<DelegationGrant, RebalancerError> {
        let ttl_secs = ttl_secs.unwrap_or(self.config.default_session_ttl_secs);
        let max_ops = max_ops.unwrap_or(self.config.default_max_ops);
        if ttl_secs == 0 || max_ops == 0 {
            return Err(RebalancerError::InvalidInput(
                "session ttl and max_ops must be positive".to_string(),
            ));
        }
        let ttl = i64::try_from(ttl_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .ok_or_else(|| RebalancerError::InvalidInput(format!("session ttl {ttl_secs}s")))?;
        let expiry = self
            .clock
            .now()
            .checked_add_signed(ttl)
            .ok_or_else(|| RebalancerError::InvalidInput(format!("session ttl {ttl_secs}s")))?;

        let policy = self.policies.set_delegation_policy(owner, delegate, bounds)?;
        let session = self.sessions.create_session(
            owner,
            delegate,
            expiry,
            &policy.policy_hash(),
            max_ops,
        )?;

        info!(owner = %owner, delegate = %delegate, session_id = %session.id, "Delegation enabled");
        Ok(DelegationGrant { policy, session })
    }

    /// Revoke the policy and every session of the owner; returns sessions revoked.
    pub fn disable_delegation(&self, owner: &Identity) -> Result<usize, RebalancerError> {
        self.policies.revoke_delegation(owner)?;
        let revoked = self.sessions.revoke_all_sessions(owner, owner)?;
        info!(owner = %owner, revoked, "Delegation disabled");
        Ok(revoked)
    }

    // --- Sessions ----------------------------------------------------------------

    pub fn create_session(
        &self,
        owner: &Identity,
        delegate: &Identity,
        expiry: DateTime<Utc>,
        policy_hash: &str,
        max_ops: u32,
    ) -> Result<DelegationSession, RebalancerError> {
        self.sessions
            .create_session(owner, delegate, expiry, policy_hash, max_ops)
    }

    pub fn revoke_session(&self, caller: &Identity, id: &str) -> Result<(), RebalancerError> {
        self.sessions.revoke_session(caller, id)
    }

    pub fn revoke_all_sessions(
        &self,
        caller: &Identity,
        owner: &Identity,
    ) -> Result<usize, RebalancerError> {
        self.sessions.revoke_all_sessions(caller, owner)
    }

    pub fn verify_operation(
        &self,
        session_id: &str,
        op: &SignedOperation,
    ) -> Result<OperationDigest, RebalancerError> {
        self.sessions.verify_operation(session_id, op)
    }

    pub fn execute_operation(
        &self,
        caller: &Identity,
        session_id: &str,
        op: &SignedOperation,
        reference: &str,
    ) -> Result<DelegationSession, RebalancerError> {
        self.sessions
            .execute_operation(caller, session_id, op, reference)
    }

    pub fn batch_execute_operations(
        &self,
        caller: &Identity,
        session_id: &str,
        ops: &[SignedOperation],
        references: &[String],
    ) -> Result<DelegationSession, RebalancerError> {
        self.sessions
            .batch_execute_operations(caller, session_id, ops, references)
    }

    pub fn is_session_valid(&self, id: &str) -> bool {
        self.sessions.is_session_valid(id)
    }

    pub fn get_nonce(&self, owner: &Identity) -> u64 {
        self.sessions.get_nonce(owner)
    }

    pub fn session_nonce(&self, id: &str) -> Option<u64> {
        self.sessions.session_nonce(id)
    }

    pub fn sessions_for(&self, owner: &Identity) -> Result<Vec<DelegationSession>, RebalancerError> {
        self.sessions.sessions_for(owner)
    }

    // --- Rebalance actions ---------------------------------------------------------

    /// Consume one signed `Rebalance` operation on the session and open a
    /// rebalance action.
    ///
    /// Runs under the owner's trigger lock. The action is validated before the
    /// operation is executed and then stored without re-checking, so either
    /// both the operation and the action land or neither does.
    pub fn trigger_rebalance(
        &self,
        agent: &Identity,
        session_id: &str,
        op: &SignedOperation,
        swap_legs: Vec<SwapLeg>,
        bridge_legs: Vec<BridgeLeg>,
        total_value_usd: u128,
    ) -> Result<RebalanceAction, RebalancerError> {
        if op.op_type != OperationType::Rebalance {
            return Err(RebalancerError::OperationTypeMismatch {
                expected: OperationType::Rebalance,
                actual: op.op_type,
            });
        }
        let session = self
            .sessions
            .get_session(session_id)?
            .ok_or_else(|| RebalancerError::SessionNotFound(session_id.to_string()))?;
        let owner = session.owner;

        self.triggers.with_lock(owner.as_str(), || {
            self.orchestrator.validate_action(
                agent,
                &owner,
                &swap_legs,
                &bridge_legs,
                total_value_usd,
            )?;
            self.sessions
                .execute_operation(agent, session_id, op, "trigger_rebalance")?;
            self.orchestrator.insert_action(
                agent,
                &owner,
                swap_legs,
                bridge_legs,
                total_value_usd,
            )
        })
    }

    pub fn create_action(
        &self,
        agent: &Identity,
        owner: &Identity,
        swap_legs: Vec<SwapLeg>,
        bridge_legs: Vec<BridgeLeg>,
        total_value_usd: u128,
    ) -> Result<RebalanceAction, RebalancerError> {
        self.orchestrator
            .create_action(agent, owner, swap_legs, bridge_legs, total_value_usd)
    }

    pub fn execute_swap_leg(
        &self,
        agent: &Identity,
        action_id: &str,
        index: usize,
        actual_amount_out: u128,
    ) -> Result<RebalanceAction, RebalancerError> {
        self.orchestrator
            .execute_swap_leg(agent, action_id, index, actual_amount_out)
    }

    pub fn execute_bridge_leg(
        &self,
        agent: &Identity,
        action_id: &str,
        index: usize,
        actual_amount: u128,
    ) -> Result<RebalanceAction, RebalancerError> {
        self.orchestrator
            .execute_bridge_leg(agent, action_id, index, actual_amount)
    }

    pub fn complete_action(
        &self,
        agent: &Identity,
        action_id: &str,
    ) -> Result<RebalanceAction, RebalancerError> {
        self.orchestrator.complete_action(agent, action_id)
    }

    pub fn pause_action(
        &self,
        admin: &Identity,
        action_id: &str,
    ) -> Result<RebalanceAction, RebalancerError> {
        self.orchestrator.pause_action(admin, action_id)
    }

    pub fn calculate_drift(
        &self,
        owner: &Identity,
        tokens: &[TokenId],
        balances: &[u128],
    ) -> Result<DriftReport, RebalancerError> {
        self.orchestrator.calculate_drift(owner, tokens, balances)
    }

    pub fn actions_for(&self, owner: &Identity) -> Result<Vec<RebalanceAction>, RebalancerError> {
        self.orchestrator.actions_for(owner)
    }

    // --- Prices --------------------------------------------------------------------

    pub fn set_price(
        &self,
        caller: &Identity,
        chain_id: ChainId,
        token: TokenId,
        price_usd: u128,
    ) -> Result<(), RebalancerError> {
        self.prices.set_price(caller, chain_id, token, price_usd)
    }

    pub fn get_price(&self, chain_id: ChainId, token: &TokenId) -> u128 {
        self.prices.get_price(chain_id, token)
    }

    // --- Read API ----------------------------------------------------------------------

    pub fn get_portfolio(&self, owner: &Identity) -> Result<Option<Portfolio>, RebalancerError> {
        self.policies.get_portfolio(owner)
    }

    pub fn get_delegation_policy(
        &self,
        owner: &Identity,
    ) -> Result<Option<DelegationPolicy>, RebalancerError> {
        self.policies.get_delegation_policy(owner)
    }

    pub fn get_session(&self, id: &str) -> Result<Option<DelegationSession>, RebalancerError> {
        self.sessions.get_session(id)
    }

    pub fn get_rebalance_action(
        &self,
        id: &str,
    ) -> Result<Option<RebalanceAction>, RebalancerError> {
        self.orchestrator.get_action(id)
    }

    pub fn audit_entries(&self, subject: Option<&str>) -> Result<Vec<LedgerEntry>, RebalancerError> {
        match subject {
            Some(subject) => self.audit.entries_for(subject),
            None => self.audit.entries(),
        }
    }

    pub fn verify_audit_chain(&self) -> bool {
        self.audit.verify_chain()
    }

    // --- Persistence -----------------------------------------------------------------

    pub fn snapshot(&self) -> Result<EngineSnapshot, RebalancerError> {
        Ok(EngineSnapshot {
            version: SNAPSHOT_VERSION,
            roles: self.access.snapshot()?,
            policies: self.policies.snapshot()?,
            sessions: self.sessions.snapshot()?,
            actions: self.orchestrator.snapshot()?,
            prices: self.prices.snapshot()?,
            audit: self.audit.entries()?,
        })
    }

    /// Replace all state with `snapshot`.
    ///
    /// The audit chain is verified first; a tampered snapshot leaves the engine
    /// unchanged.
    pub fn restore(&self, snapshot: EngineSnapshot) -> Result<(), RebalancerError> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(RebalancerError::Serialization(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        self.audit.replace(snapshot.audit)?;
        self.access.restore(snapshot.roles)?;
        self.policies.restore(snapshot.policies)?;
        self.sessions.restore(snapshot.sessions)?;
        self.orchestrator.restore(snapshot.actions)?;
        self.prices.restore(snapshot.prices)?;
        info!(entries = self.audit.len(), "Engine state restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ErrorKind;
    use crate::signer::{operation_digest, Ed25519KeyRing};
    use crate::types::OperationType;
    use ed25519_dalek::{Signer, SigningKey};

    struct Fixture {
        engine: RebalanceEngine,
        key: SigningKey,
        owner: Identity,
        agent: Identity,
    }

    fn fixture() -> Fixture {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let owner = Identity::new("owner-1");
        let agent = Identity::new("agent-1");
        let ring = Ed25519KeyRing::new();
        ring.register_key(owner.clone(), key.verifying_key()).unwrap();

        let config = EngineConfig {
            admins: vec![Identity::new("admin")],
            authorized_agents: vec![agent.clone()],
            ..EngineConfig::default()
        };
        let engine = RebalanceEngine::new(
            config,
            Arc::new(ring),
            Arc::new(ManualClock::new(Utc::now())),
        )
        .unwrap();
        engine
            .create_portfolio(
                &owner,
                vec![Asset::new("USDC", 1, 5_000), Asset::new("ETH", 1, 5_000)],
            )
            .unwrap();
        Fixture {
            engine,
            key,
            owner,
            agent,
        }
    }

    fn bounds() -> PolicyBounds {
        PolicyBounds {
            max_slippage_bps: 50,
            max_rebalance_usd: 1_000_000,
            threshold_bps: 100,
            cooldown_secs: 3_600,
        }
    }

    impl Fixture {
        fn signed(&self, session: &DelegationSession, nonce: u64) -> SignedOperation {
            let mut op = SignedOperation {
                owner: self.owner.clone(),
                delegate: self.agent.clone(),
                nonce,
                op_type: OperationType::Rebalance,
                payload: serde_json::json!({"reason": "drift"}),
                timestamp: self.engine.now(),
                signature: Vec::new(),
            };
            let digest = operation_digest(&op, &session.policy_hash).unwrap();
            op.signature = self.key.sign(digest.as_bytes()).to_bytes().to_vec();
            op
        }
    }

    fn swap() -> SwapLeg {
        SwapLeg {
            token_in: TokenId::new("USDC"),
            token_out: TokenId::new("ETH"),
            amount_in: 1_000,
            min_amount_out: 995,
            chain_id: 1,
            route_ref: "route-1".to_string(),
        }
    }

    #[test]
    fn enable_delegation_binds_session_to_policy() {
        let f = fixture();
        let grant = f
            .engine
            .enable_delegation(&f.owner, &f.agent, bounds(), None, Some(2))
            .unwrap();
        assert_eq!(grant.session.policy_hash, grant.policy.policy_hash());
        assert_eq!(grant.session.max_ops, 2);
        assert_eq!(
            grant.session.expiry,
            grant.session.created_at + Duration::seconds(86_400)
        );

        assert_eq!(f.engine.disable_delegation(&f.owner).unwrap(), 1);
        assert!(!f.engine.is_session_valid(&grant.session.id));
        assert!(!f
            .engine
            .get_delegation_policy(&f.owner)
            .unwrap()
            .unwrap()
            .is_active);
    }

    #[test]
    fn rejected_trigger_keeps_operation_unconsumed() {
        let f = fixture();
        let grant = f
            .engine
            .enable_delegation(&f.owner, &f.agent, bounds(), None, None)
            .unwrap();
        let op = f.signed(&grant.session, 0);

        let err = f
            .engine
            .trigger_rebalance(&f.agent, &grant.session.id, &op, vec![swap()], vec![], 2_000_000)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Economic);
        assert_eq!(f.engine.session_nonce(&grant.session.id), Some(0));

        let action = f
            .engine
            .trigger_rebalance(&f.agent, &grant.session.id, &op, vec![swap()], vec![], 1_000)
            .unwrap();
        assert_eq!(action.owner, f.owner);
        assert_eq!(f.engine.session_nonce(&grant.session.id), Some(1));
        assert_eq!(f.engine.actions_for(&f.owner).unwrap().len(), 1);
    }

    #[test]
    fn trigger_requires_rebalance_operation() {
        let f = fixture();
        let grant = f
            .engine
            .enable_delegation(&f.owner, &f.agent, bounds(), None, None)
            .unwrap();
        let mut op = f.signed(&grant.session, 0);
        op.op_type = OperationType::UpdateBalance;
        let digest = operation_digest(&op, &grant.session.policy_hash).unwrap();
        op.signature = f.key.sign(digest.as_bytes()).to_bytes().to_vec();

        let err = f
            .engine
            .trigger_rebalance(&f.agent, &grant.session.id, &op, vec![swap()], vec![], 1_000)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(f.engine.session_nonce(&grant.session.id), Some(0));
        assert!(f.engine.actions_for(&f.owner).unwrap().is_empty());
    }

    #[test]
    fn trigger_racing_agent_removal_is_all_or_nothing() {
        for _ in 0..32 {
            let f = fixture();
            let grant = f
                .engine
                .enable_delegation(&f.owner, &f.agent, bounds(), None, None)
                .unwrap();
            let op = f.signed(&grant.session, 0);
            let barrier = std::sync::Barrier::new(2);

            std::thread::scope(|scope| {
                scope.spawn(|| {
                    barrier.wait();
                    let _ = f.engine.trigger_rebalance(
                        &f.agent,
                        &grant.session.id,
                        &op,
                        vec![swap()],
                        vec![],
                        1_000,
                    );
                });
                scope.spawn(|| {
                    barrier.wait();
                    f.engine
                        .remove_authorized_agent(&Identity::new("admin"), &f.agent)
                        .unwrap();
                });
            });

            let actions = f.engine.actions_for(&f.owner).unwrap().len() as u64;
            assert_eq!(f.engine.session_nonce(&grant.session.id), Some(actions));
        }
    }

    #[test]
    fn snapshot_restores_into_fresh_engine() {
        let f = fixture();
        let grant = f
            .engine
            .enable_delegation(&f.owner, &f.agent, bounds(), None, None)
            .unwrap();
        let op = f.signed(&grant.session, 0);
        let action = f
            .engine
            .trigger_rebalance(&f.agent, &grant.session.id, &op, vec![swap()], vec![], 1_000)
            .unwrap();

        let snapshot = f.engine.snapshot().unwrap();
        let encoded = serde_json::to_string(&snapshot).unwrap();
        let decoded: EngineSnapshot = serde_json::from_str(&encoded).unwrap();

        let fresh = fixture();
        fresh.engine.restore(decoded).unwrap();
        assert!(fresh.engine.verify_audit_chain());
        assert_eq!(
            fresh.engine.get_rebalance_action(&action.id).unwrap(),
            Some(action)
        );
        assert_eq!(fresh.engine.session_nonce(&grant.session.id), Some(1));
        assert_eq!(fresh.engine.snapshot().unwrap(), snapshot);
    }

    #[test]
    fn tampered_snapshot_is_rejected() {
        let f = fixture();
        let mut snapshot = f.engine.snapshot().unwrap();
        snapshot.audit[0].event.detail = "assets=9".to_string();

        let fresh = fixture();
        let before = fresh.engine.snapshot().unwrap();
        assert!(fresh.engine.restore(snapshot).is_err());
        assert_eq!(fresh.engine.snapshot().unwrap(), before);
    }
}
