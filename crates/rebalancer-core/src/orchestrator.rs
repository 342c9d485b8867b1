use crate::access::AccessControl;
use crate::clock::Clock;
use crate::error::RebalancerError;
use crate::ledger::{AuditEvent, AuditLog};
use crate::locks::KeyedLocks;
use crate::policy::PolicyStore;
use crate::price::PriceRegistry;
use crate::types::{
    ActionStatus, BridgeLeg, Identity, RebalanceAction, SwapLeg, TokenId, TOTAL_BPS,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Current allocation of an owner's holdings against its targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftReport {
    pub owner: Identity,
    pub total_value_usd: u128,
    pub current_bps: Vec<u32>,
    pub drift_bps: Vec<u32>,
}

impl DriftReport {
    pub fn max_drift_bps(&self) -> u32 {
        self.drift_bps.iter().copied().max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorSnapshot {
    pub actions: Vec<RebalanceAction>,
    pub sequence: u64,
}

/// Tracks multi-leg rebalance actions from creation to a terminal state.
///
/// Legs are executed by an off-core router; the orchestrator only books the
/// realized amounts. `Completed` and `Paused` are terminal.
pub struct RebalanceOrchestrator {
    actions: RwLock<HashMap<String, RebalanceAction>>,
    sequence: AtomicU64,
    locks: KeyedLocks,
    policies: Arc<PolicyStore>,
    prices: Arc<PriceRegistry>,
    access: Arc<AccessControl>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
    enforce_slippage_bounds: bool,
}

impl RebalanceOrchestrator {
    pub fn new(
        policies: Arc<PolicyStore>,
        prices: Arc<PriceRegistry>,
        access: Arc<AccessControl>,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditLog>,
        enforce_slippage_bounds: bool,
    ) -> Self {
        Self {
            actions: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            locks: KeyedLocks::new(),
            policies,
            prices,
            access,
            clock,
            audit,
            enforce_slippage_bounds,
        }
    }

    /// Every check `create_action` runs, without creating anything.
    pub fn validate_action(
        &self,
        agent: &Identity,
        owner: &Identity,
        swap_legs: &[SwapLeg],
        bridge_legs: &[BridgeLeg],
        total_value_usd: u128,
    ) -> Result<(), RebalancerError> {
        self.access.require_authorized_agent(agent)?;
        if owner.is_empty() {
            return Err(RebalancerError::EmptyIdentity { field: "owner" });
        }
        if total_value_usd == 0 {
            return Err(RebalancerError::NonPositiveAmount {
                field: "total_value_usd",
            });
        }
        if swap_legs.is_empty() && bridge_legs.is_empty() {
            return Err(RebalancerError::InvalidInput(
                "rebalance action needs at least one leg".to_string(),
            ));
        }
        for leg in swap_legs {
            validate_swap_leg(leg)?;
        }
        for leg in bridge_legs {
            validate_bridge_leg(leg)?;
        }

        let policy = self.policies.active_policy(owner)?;
        if total_value_usd > policy.max_rebalance_usd {
            return Err(RebalancerError::RebalanceValueExceeded {
                requested: total_value_usd,
                max: policy.max_rebalance_usd,
            });
        }

        if self.enforce_slippage_bounds {
            for (index, leg) in swap_legs.iter().enumerate() {
                self.check_slippage_bound(index, leg, policy.max_slippage_bps)?;
            }
        }
        Ok(())
    }

    pub fn create_action(
        &self,
        agent: &Identity,
        owner: &Identity,
        swap_legs: Vec<SwapLeg>,
        bridge_legs: Vec<BridgeLeg>,
        total_value_usd: u128,
    ) -> Result<RebalanceAction, RebalancerError> {
        self.validate_action(agent, owner, &swap_legs, &bridge_legs, total_value_usd)?;
        self.insert_action(agent, owner, swap_legs, bridge_legs, total_value_usd)
    }

    /// Store an action whose legs already passed [`Self::validate_action`].
    ///
    /// Runs no domain checks, so it can only fail on a poisoned lock.
    pub(crate) fn insert_action(
        &self,
        agent: &Identity,
        owner: &Identity,
        swap_legs: Vec<SwapLeg>,
        bridge_legs: Vec<BridgeLeg>,
        total_value_usd: u128,
    ) -> Result<RebalanceAction, RebalancerError> {
        let now = self.clock.now();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let id = action_id(owner, now, sequence, swap_legs.len(), bridge_legs.len());
        let action = RebalanceAction {
            id: id.clone(),
            owner: owner.clone(),
            created_by: agent.clone(),
            swap_legs_done: vec![false; swap_legs.len()],
            bridge_legs_done: vec![false; bridge_legs.len()],
            swap_legs,
            bridge_legs,
            total_value_usd,
            created_at: now,
            executed: false,
            status: ActionStatus::Created,
        };
        self.write_actions()?.insert(id.clone(), action.clone());

        info!(
            action_id = %id,
            owner = %owner,
            agent = %agent,
            swaps = action.swap_legs.len(),
            bridges = action.bridge_legs.len(),
            total_value_usd = %total_value_usd,
            "Rebalance action created"
        );
        self.audit.record(
            &id,
            now,
            AuditEvent::new(
                "action_created",
                format!(
                    "owner={owner} swaps={} bridges={} total_value_usd={total_value_usd}",
                    action.swap_legs.len(),
                    action.bridge_legs.len()
                ),
            ),
        )?;
        Ok(action)
    }

    /// Book a realized swap: input balance to zero, `actual_amount_out` credited to the output.
    pub fn execute_swap_leg(
        &self,
        agent: &Identity,
        action_id: &str,
        index: usize,
        actual_amount_out: u128,
    ) -> Result<RebalanceAction, RebalancerError> {
        self.access.require_authorized_agent(agent)?;
        self.locks.with_lock(action_id, || {
            let mut action = self.open_action(action_id)?;
            let leg = action
                .swap_legs
                .get(index)
                .cloned()
                .ok_or_else(|| RebalancerError::LegIndexOutOfRange {
                    action_id: action_id.to_string(),
                    kind: "swap",
                    index,
                    len: action.swap_legs.len(),
                })?;
            if action.swap_legs_done[index] {
                return Err(RebalancerError::LegAlreadyExecuted {
                    action_id: action_id.to_string(),
                    kind: "swap",
                    index,
                });
            }
            if actual_amount_out < leg.min_amount_out {
                warn!(
                    action_id = %action_id,
                    index,
                    minimum = %leg.min_amount_out,
                    actual = %actual_amount_out,
                    "Swap leg rejected: slippage exceeded"
                );
                return Err(RebalancerError::SlippageExceeded {
                    minimum: leg.min_amount_out,
                    actual: actual_amount_out,
                });
            }

            self.policies.settle_swap(
                &action.owner,
                &leg.token_in,
                &leg.token_out,
                actual_amount_out,
            )?;

            action.swap_legs_done[index] = true;
            action.status = ActionStatus::InProgress;
            self.write_actions()?
                .insert(action_id.to_string(), action.clone());

            info!(action_id = %action_id, index, actual = %actual_amount_out, "Swap leg executed");
            self.audit.record(
                action_id,
                self.clock.now(),
                AuditEvent::new(
                    "swap_leg_executed",
                    format!(
                        "index={index} {}->{} out={actual_amount_out} route={}",
                        leg.token_in, leg.token_out, leg.route_ref
                    ),
                ),
            )?;
            Ok(action)
        })
    }

    /// Book a realized bridge transfer: `actual_amount` credited to the token.
    pub fn execute_bridge_leg(
        &self,
        agent: &Identity,
        action_id: &str,
        index: usize,
        actual_amount: u128,
    ) -> Result<RebalanceAction, RebalancerError> {
        self.access.require_authorized_agent(agent)?;
        self.locks.with_lock(action_id, || {
            let mut action = self.open_action(action_id)?;
            let leg = action
                .bridge_legs
                .get(index)
                .cloned()
                .ok_or_else(|| RebalancerError::LegIndexOutOfRange {
                    action_id: action_id.to_string(),
                    kind: "bridge",
                    index,
                    len: action.bridge_legs.len(),
                })?;
            if action.bridge_legs_done[index] {
                return Err(RebalancerError::LegAlreadyExecuted {
                    action_id: action_id.to_string(),
                    kind: "bridge",
                    index,
                });
            }
            if actual_amount == 0 {
                return Err(RebalancerError::NonPositiveAmount {
                    field: "actual_amount",
                });
            }

            self.policies
                .credit_balance(&action.owner, &leg.token, actual_amount)?;

            action.bridge_legs_done[index] = true;
            action.status = ActionStatus::InProgress;
            self.write_actions()?
                .insert(action_id.to_string(), action.clone());

            info!(action_id = %action_id, index, actual = %actual_amount, "Bridge leg executed");
            self.audit.record(
                action_id,
                self.clock.now(),
                AuditEvent::new(
                    "bridge_leg_executed",
                    format!(
                        "index={index} token={} {}->{} amount={actual_amount} bridge={}",
                        leg.token, leg.from_chain, leg.to_chain, leg.bridge_ref
                    ),
                ),
            )?;
            Ok(action)
        })
    }

    /// Stamp the owner's portfolio, re-arming its cooldown, and close the action.
    pub fn complete_action(
        &self,
        agent: &Identity,
        action_id: &str,
    ) -> Result<RebalanceAction, RebalancerError> {
        self.access.require_authorized_agent(agent)?;
        self.locks.with_lock(action_id, || {
            let mut action = self.open_action(action_id)?;
            self.policies
                .stamp_rebalance(&action.owner, action.total_value_usd)?;

            action.executed = true;
            action.status = ActionStatus::Completed;
            self.write_actions()?
                .insert(action_id.to_string(), action.clone());

            info!(
                action_id = %action_id,
                owner = %action.owner,
                legs_remaining = action.legs_remaining(),
                "Rebalance action completed"
            );
            self.audit.record(
                action_id,
                self.clock.now(),
                AuditEvent::new(
                    "action_completed",
                    format!("legs_remaining={}", action.legs_remaining()),
                ),
            )?;
            Ok(action)
        })
    }

    /// Admin escape hatch: terminal without crediting balances or stamping.
    pub fn pause_action(
        &self,
        admin: &Identity,
        action_id: &str,
    ) -> Result<RebalanceAction, RebalancerError> {
        self.access.require_admin(admin)?;
        self.locks.with_lock(action_id, || {
            let mut action = self.open_action(action_id)?;
            action.executed = true;
            action.status = ActionStatus::Paused;
            self.write_actions()?
                .insert(action_id.to_string(), action.clone());

            warn!(action_id = %action_id, by = %admin, "Rebalance action paused");
            self.audit.record(
                action_id,
                self.clock.now(),
                AuditEvent::new("action_paused", format!("by={admin}")),
            )?;
            Ok(action)
        })
    }

    /// Value each balance at its chain's price and compare to the targets.
    ///
    /// Unpriced tokens contribute zero value. With zero total value every
    /// current allocation reads as 0 bps.
    pub fn calculate_drift(
        &self,
        owner: &Identity,
        tokens: &[TokenId],
        balances: &[u128],
    ) -> Result<DriftReport, RebalancerError> {
        let portfolio = self
            .policies
            .get_portfolio(owner)?
            .filter(|p| p.is_active)
            .ok_or_else(|| RebalancerError::PortfolioNotFound(owner.clone()))?;
        let assets = &portfolio.assets;
        for len in [tokens.len(), balances.len()] {
            if len != assets.len() {
                return Err(RebalancerError::LengthMismatch {
                    expected: assets.len(),
                    actual: len,
                });
            }
        }

        let values = assets
            .iter()
            .zip(tokens.iter().zip(balances))
            .map(|(asset, (token, balance))| {
                balance
                    .checked_mul(self.prices.get_price(asset.chain_id, token))
                    .ok_or(RebalancerError::ValueOverflow("asset value"))
            })
            .collect::<Result<Vec<u128>, _>>()?;
        let total = values.iter().try_fold(0u128, |acc, value| {
            acc.checked_add(*value)
                .ok_or(RebalancerError::ValueOverflow("total value"))
        })?;

        let mut current_bps = Vec::with_capacity(values.len());
        for value in &values {
            let bps = if total == 0 {
                0
            } else {
                let scaled = value
                    .checked_mul(u128::from(TOTAL_BPS))
                    .ok_or(RebalancerError::ValueOverflow("allocation"))?;
                // value <= total, so the quotient fits in 10000.
                u32::try_from(scaled / total).unwrap_or(TOTAL_BPS)
            };
            current_bps.push(bps);
        }
        let drift_bps = assets
            .iter()
            .zip(&current_bps)
            .map(|(asset, current)| asset.target_bps.abs_diff(*current))
            .collect();

        let report = DriftReport {
            owner: owner.clone(),
            total_value_usd: total,
            current_bps,
            drift_bps,
        };
        debug!(owner = %owner, total = %total, max_drift = report.max_drift_bps(), "Drift calculated");
        Ok(report)
    }

    pub fn get_action(&self, id: &str) -> Result<Option<RebalanceAction>, RebalancerError> {
        Ok(self
            .actions
            .read()
            .map_err(|_| RebalancerError::LockPoisoned("actions"))?
            .get(id)
            .cloned())
    }

    pub fn actions_for(&self, owner: &Identity) -> Result<Vec<RebalanceAction>, RebalancerError> {
        let mut actions: Vec<RebalanceAction> = self
            .actions
            .read()
            .map_err(|_| RebalancerError::LockPoisoned("actions"))?
            .values()
            .filter(|action| &action.owner == owner)
            .cloned()
            .collect();
        actions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(actions)
    }

    pub fn snapshot(&self) -> Result<OrchestratorSnapshot, RebalancerError> {
        let mut actions: Vec<RebalanceAction> = self
            .actions
            .read()
            .map_err(|_| RebalancerError::LockPoisoned("actions"))?
            .values()
            .cloned()
            .collect();
        actions.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(OrchestratorSnapshot {
            actions,
            sequence: self.sequence.load(Ordering::SeqCst),
        })
    }

    pub fn restore(&self, snapshot: OrchestratorSnapshot) -> Result<(), RebalancerError> {
        *self.write_actions()? = snapshot
            .actions
            .into_iter()
            .map(|action| (action.id.clone(), action))
            .collect();
        self.sequence.store(snapshot.sequence, Ordering::SeqCst);
        Ok(())
    }

    fn check_slippage_bound(
        &self,
        index: usize,
        leg: &SwapLeg,
        max_slippage_bps: u32,
    ) -> Result<(), RebalancerError> {
        let price_in = self.prices.get_price(leg.chain_id, &leg.token_in);
        let price_out = self.prices.get_price(leg.chain_id, &leg.token_out);
        if price_in == 0 || price_out == 0 {
            debug!(index, "Swap leg unpriced; slippage bound not checked");
            return Ok(());
        }

        let value_in = leg
            .amount_in
            .checked_mul(price_in)
            .ok_or(RebalancerError::ValueOverflow("swap input value"))?;
        let min_value_out = leg
            .min_amount_out
            .checked_mul(price_out)
            .ok_or(RebalancerError::ValueOverflow("swap output value"))?;

        let floor = value_in
            .checked_mul(u128::from(TOTAL_BPS - max_slippage_bps))
            .ok_or(RebalancerError::ValueOverflow("slippage floor"))?;
        let offered = min_value_out
            .checked_mul(u128::from(TOTAL_BPS))
            .ok_or(RebalancerError::ValueOverflow("slippage floor"))?;
        if offered >= floor {
            return Ok(());
        }

        let allowed = value_in.saturating_sub(min_value_out).saturating_mul(u128::from(TOTAL_BPS))
            / value_in;
        Err(RebalancerError::SlippageBoundExceeded {
            index,
            allowed_bps: u64::try_from(allowed).unwrap_or(u64::MAX),
            max_bps: max_slippage_bps,
        })
    }

    fn open_action(&self, id: &str) -> Result<RebalanceAction, RebalancerError> {
        let action = self
            .get_action(id)?
            .ok_or_else(|| RebalancerError::ActionNotFound(id.to_string()))?;
        if action.executed || action.status.is_terminal() {
            return Err(RebalancerError::ActionTerminal(id.to_string()));
        }
        Ok(action)
    }

    fn write_actions(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, RebalanceAction>>, RebalancerError>
    {
        self.actions
            .write()
            .map_err(|_| RebalancerError::LockPoisoned("actions"))
    }
}

fn validate_swap_leg(leg: &SwapLeg) -> Result<(), RebalancerError> {
    if leg.token_in.is_empty() || leg.token_out.is_empty() {
        return Err(RebalancerError::EmptyIdentity { field: "swap token" });
    }
    if leg.amount_in == 0 {
        return Err(RebalancerError::NonPositiveAmount { field: "amount_in" });
    }
    Ok(())
}

fn validate_bridge_leg(leg: &BridgeLeg) -> Result<(), RebalancerError> {
    if leg.token.is_empty() {
        return Err(RebalancerError::EmptyIdentity {
            field: "bridge token",
        });
    }
    if leg.amount == 0 {
        return Err(RebalancerError::NonPositiveAmount { field: "amount" });
    }
    if leg.from_chain == leg.to_chain {
        return Err(RebalancerError::InvalidInput(format!(
            "bridge leg for {} starts and ends on chain {}",
            leg.token, leg.from_chain
        )));
    }
    Ok(())
}

fn action_id(
    owner: &Identity,
    created_at: DateTime<Utc>,
    sequence: u64,
    swaps: usize,
    bridges: usize,
) -> String {
    let material = serde_json::json!({
        "owner": owner,
        "created_at": created_at.to_rfc3339(),
        "sequence": sequence,
        "swaps": swaps,
        "bridges": bridges,
    });
    format!(
        "act-{}",
        blake3::hash(material.to_string().as_bytes()).to_hex()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::RoleSets;
    use crate::clock::ManualClock;
    use crate::error::ErrorKind;
    use crate::types::{Asset, PolicyBounds};

    struct Fixture {
        orchestrator: RebalanceOrchestrator,
        policies: Arc<PolicyStore>,
        prices: Arc<PriceRegistry>,
        owner: Identity,
        agent: Identity,
        admin: Identity,
        oracle: Identity,
    }

    fn fixture() -> Fixture {
        let owner = Identity::new("owner-1");
        let agent = Identity::new("agent-1");
        let admin = Identity::new("admin");
        let oracle = Identity::new("oracle");

        let mut roles = RoleSets::default();
        roles.admins.insert(admin.clone());
        roles.price_feeds.insert(oracle.clone());
        roles.authorized_agents.insert(agent.clone());
        let access = Arc::new(AccessControl::new(roles));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let audit = Arc::new(AuditLog::new());

        let policies = Arc::new(PolicyStore::new(clock.clone(), audit.clone()));
        policies
            .create_portfolio(
                &owner,
                vec![Asset::new("USDC", 1, 5_000), Asset::new("ETH", 1, 5_000)],
            )
            .unwrap();
        policies
            .set_delegation_policy(
                &owner,
                &agent,
                PolicyBounds {
                    max_slippage_bps: 50,
                    max_rebalance_usd: 1_000_000,
                    threshold_bps: 100,
                    cooldown_secs: 3_600,
                },
            )
            .unwrap();

        let prices = Arc::new(PriceRegistry::new(access.clone()));
        let orchestrator = RebalanceOrchestrator::new(
            policies.clone(),
            prices.clone(),
            access,
            clock,
            audit,
            true,
        );
        Fixture {
            orchestrator,
            policies,
            prices,
            owner,
            agent,
            admin,
            oracle,
        }
    }

    fn swap(min_out: u128) -> SwapLeg {
        SwapLeg {
            token_in: TokenId::new("USDC"),
            token_out: TokenId::new("ETH"),
            amount_in: 1_000,
            min_amount_out: min_out,
            chain_id: 1,
            route_ref: "route-1".to_string(),
        }
    }

    fn bridge() -> BridgeLeg {
        BridgeLeg {
            token: TokenId::new("ETH"),
            amount: 10,
            from_chain: 1,
            to_chain: 10,
            bridge_ref: "bridge-1".to_string(),
        }
    }

    impl Fixture {
        fn action(&self) -> RebalanceAction {
            self.orchestrator
                .create_action(&self.agent, &self.owner, vec![swap(995)], vec![bridge()], 1_000)
                .unwrap()
        }
    }

    #[test]
    fn create_action_checks_agent_and_value() {
        let f = fixture();
        let err = f
            .orchestrator
            .create_action(&f.owner, &f.owner, vec![swap(1)], vec![], 1_000)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);

        let err = f
            .orchestrator
            .create_action(&f.agent, &f.owner, vec![swap(1)], vec![], 0)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Economic);

        let err = f
            .orchestrator
            .create_action(&f.agent, &f.owner, vec![swap(1)], vec![], 1_000_001)
            .unwrap_err();
        assert!(matches!(err, RebalancerError::RebalanceValueExceeded { .. }));

        let err = f
            .orchestrator
            .create_action(&f.agent, &f.owner, vec![], vec![], 1_000)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        f.policies.revoke_delegation(&f.owner).unwrap();
        let err = f
            .orchestrator
            .create_action(&f.agent, &f.owner, vec![swap(1)], vec![], 1_000)
            .unwrap_err();
        assert!(matches!(err, RebalancerError::PolicyInactive(_)));
    }

    #[test]
    fn action_ids_are_unique_at_the_same_instant() {
        let f = fixture();
        assert_ne!(f.action().id, f.action().id);
    }

    #[test]
    fn priced_swap_legs_respect_policy_slippage() {
        let f = fixture();
        f.prices
            .set_price(&f.oracle, 1, TokenId::new("USDC"), 1)
            .unwrap();
        f.prices
            .set_price(&f.oracle, 1, TokenId::new("ETH"), 1)
            .unwrap();

        // 1% below input value against a 50 bps policy.
        let err = f
            .orchestrator
            .create_action(&f.agent, &f.owner, vec![swap(990)], vec![], 1_000)
            .unwrap_err();
        assert!(matches!(
            err,
            RebalancerError::SlippageBoundExceeded {
                allowed_bps: 100,
                max_bps: 50,
                ..
            }
        ));
        assert!(f
            .orchestrator
            .create_action(&f.agent, &f.owner, vec![swap(995)], vec![], 1_000)
            .is_ok());
    }

    #[test]
    fn slippage_failure_leaves_action_untouched() {
        let f = fixture();
        let action = f.action();

        let err = f
            .orchestrator
            .execute_swap_leg(&f.agent, &action.id, 0, 994)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Economic);
        let stored = f.orchestrator.get_action(&action.id).unwrap().unwrap();
        assert!(!stored.executed);
        assert!(!stored.swap_legs_done[0]);
        assert_eq!(f.policies.balance(&f.owner, &TokenId::new("ETH")), 0);

        // A corrected outcome may be resubmitted.
        let stored = f
            .orchestrator
            .execute_swap_leg(&f.agent, &action.id, 0, 995)
            .unwrap();
        assert_eq!(stored.status, ActionStatus::InProgress);
        assert_eq!(f.policies.balance(&f.owner, &TokenId::new("ETH")), 995);
        assert_eq!(f.policies.balance(&f.owner, &TokenId::new("USDC")), 0);
    }

    #[test]
    fn legs_credit_onto_existing_balances() {
        let f = fixture();
        let eth = TokenId::new("ETH");
        let usdc = TokenId::new("USDC");
        f.policies.update_balance(&f.agent, &f.owner, &eth, 500).unwrap();
        f.policies.update_balance(&f.agent, &f.owner, &usdc, 1_000).unwrap();

        let action = f.action();
        f.orchestrator
            .execute_swap_leg(&f.agent, &action.id, 0, 995)
            .unwrap();
        assert_eq!(f.policies.balance(&f.owner, &eth), 1_495);
        assert_eq!(f.policies.balance(&f.owner, &usdc), 0);

        f.orchestrator
            .execute_bridge_leg(&f.agent, &action.id, 0, 9)
            .unwrap();
        assert_eq!(f.policies.balance(&f.owner, &eth), 1_504);
    }

    #[test]
    fn overflowing_credit_leaves_balances_and_leg_untouched() {
        let f = fixture();
        let eth = TokenId::new("ETH");
        let usdc = TokenId::new("USDC");
        f.policies
            .update_balance(&f.agent, &f.owner, &eth, u128::MAX)
            .unwrap();
        f.policies.update_balance(&f.agent, &f.owner, &usdc, 1_000).unwrap();

        let action = f.action();
        let err = f
            .orchestrator
            .execute_swap_leg(&f.agent, &action.id, 0, 995)
            .unwrap_err();
        assert!(matches!(err, RebalancerError::ValueOverflow(_)));
        assert_eq!(f.policies.balance(&f.owner, &usdc), 1_000);
        assert_eq!(f.policies.balance(&f.owner, &eth), u128::MAX);
        let stored = f.orchestrator.get_action(&action.id).unwrap().unwrap();
        assert!(!stored.swap_legs_done[0]);
    }

    #[test]
    fn legs_execute_at_most_once() {
        let f = fixture();
        let action = f.action();
        f.orchestrator
            .execute_swap_leg(&f.agent, &action.id, 0, 1_000)
            .unwrap();
        let err = f
            .orchestrator
            .execute_swap_leg(&f.agent, &action.id, 0, 1_000)
            .unwrap_err();
        assert!(matches!(err, RebalancerError::LegAlreadyExecuted { .. }));

        let err = f
            .orchestrator
            .execute_swap_leg(&f.agent, &action.id, 1, 1_000)
            .unwrap_err();
        assert!(matches!(err, RebalancerError::LegIndexOutOfRange { .. }));
    }

    #[test]
    fn bridge_leg_rejects_zero_and_credits_amount() {
        let f = fixture();
        let action = f.action();
        let err = f
            .orchestrator
            .execute_bridge_leg(&f.agent, &action.id, 0, 0)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Economic);

        f.orchestrator
            .execute_bridge_leg(&f.agent, &action.id, 0, 9)
            .unwrap();
        assert_eq!(f.policies.balance(&f.owner, &TokenId::new("ETH")), 9);
    }

    #[test]
    fn complete_action_runs_once_and_stamps_once() {
        let f = fixture();
        let action = f.action();
        let completed = f.orchestrator.complete_action(&f.agent, &action.id).unwrap();
        assert!(completed.executed);
        assert_eq!(completed.status, ActionStatus::Completed);

        let stamped = f
            .policies
            .get_portfolio(&f.owner)
            .unwrap()
            .unwrap()
            .last_rebalance_ts;
        assert!(stamped.is_some());

        let err = f
            .orchestrator
            .complete_action(&f.agent, &action.id)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
        let after = f.policies.get_portfolio(&f.owner).unwrap().unwrap();
        assert_eq!(after.last_rebalance_ts, stamped);
    }

    #[test]
    fn completion_waits_for_cooldown() {
        let f = fixture();
        let first = f.action();
        let second = f.action();
        f.orchestrator.complete_action(&f.agent, &first.id).unwrap();

        let err = f
            .orchestrator
            .complete_action(&f.agent, &second.id)
            .unwrap_err();
        assert!(matches!(err, RebalancerError::CooldownActive { .. }));
        assert!(!f.orchestrator.get_action(&second.id).unwrap().unwrap().executed);
    }

    #[test]
    fn pause_is_admin_only_and_terminal() {
        let f = fixture();
        let action = f.action();
        let err = f
            .orchestrator
            .pause_action(&f.agent, &action.id)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);

        let paused = f.orchestrator.pause_action(&f.admin, &action.id).unwrap();
        assert!(paused.executed);
        assert_eq!(paused.status, ActionStatus::Paused);
        assert!(f
            .policies
            .get_portfolio(&f.owner)
            .unwrap()
            .unwrap()
            .last_rebalance_ts
            .is_none());

        let err = f
            .orchestrator
            .execute_bridge_leg(&f.agent, &action.id, 0, 1)
            .unwrap_err();
        assert!(matches!(err, RebalancerError::ActionTerminal(_)));
    }

    #[test]
    fn drift_values_balances_at_chain_prices() {
        let f = fixture();
        f.prices
            .set_price(&f.oracle, 1, TokenId::new("USDC"), 1)
            .unwrap();
        f.prices
            .set_price(&f.oracle, 1, TokenId::new("ETH"), 3)
            .unwrap();

        let tokens = [TokenId::new("USDC"), TokenId::new("ETH")];
        let report = f
            .orchestrator
            .calculate_drift(&f.owner, &tokens, &[600, 200])
            .unwrap();
        assert_eq!(report.total_value_usd, 1_200);
        assert_eq!(report.current_bps, vec![5_000, 5_000]);
        assert_eq!(report.max_drift_bps(), 0);

        let report = f
            .orchestrator
            .calculate_drift(&f.owner, &tokens, &[900, 100])
            .unwrap();
        assert_eq!(report.current_bps, vec![7_500, 2_500]);
        assert_eq!(report.drift_bps, vec![2_500, 2_500]);

        let err = f
            .orchestrator
            .calculate_drift(&f.owner, &tokens[..1], &[1])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn unpriced_holdings_report_zero_allocation() {
        let f = fixture();
        let tokens = [TokenId::new("USDC"), TokenId::new("ETH")];
        let report = f
            .orchestrator
            .calculate_drift(&f.owner, &tokens, &[600, 200])
            .unwrap();
        assert_eq!(report.total_value_usd, 0);
        assert_eq!(report.current_bps, vec![0, 0]);
        assert_eq!(report.drift_bps, vec![5_000, 5_000]);
    }
}
