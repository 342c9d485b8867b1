use crate::clock::Clock;
use crate::error::RebalancerError;
use crate::ledger::{AuditEvent, AuditLog};
use crate::locks::KeyedLocks;
use crate::types::{
    Asset, ChainId, DelegationPolicy, Identity, PolicyBounds, Portfolio, TokenId,
    MAX_SLIPPAGE_BPS, MAX_THRESHOLD_BPS, MIN_COOLDOWN_SECS, TOTAL_BPS,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Cached balance of one token for one owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceEntry {
    pub owner: Identity,
    pub token: TokenId,
    pub amount: u128,
}

/// Serializable image of the policy store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStoreSnapshot {
    pub portfolios: Vec<Portfolio>,
    pub policies: Vec<DelegationPolicy>,
    pub balances: Vec<BalanceEntry>,
}

/// Owns each owner's portfolio (target allocations) and delegation policy (bounds).
///
/// Every mutation runs under the owner's single-writer lock and either applies
/// fully or not at all.
pub struct PolicyStore {
    portfolios: RwLock<HashMap<Identity, Portfolio>>,
    policies: RwLock<HashMap<Identity, DelegationPolicy>>,
    balances: RwLock<HashMap<(Identity, TokenId), u128>>,
    locks: KeyedLocks,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
}

impl PolicyStore {
    pub fn new(clock: Arc<dyn Clock>, audit: Arc<AuditLog>) -> Self {
        Self {
            portfolios: RwLock::new(HashMap::new()),
            policies: RwLock::new(HashMap::new()),
            balances: RwLock::new(HashMap::new()),
            locks: KeyedLocks::new(),
            clock,
            audit,
        }
    }

    // --- Portfolio -------------------------------------------------------

    pub fn create_portfolio(
        &self,
        owner: &Identity,
        assets: Vec<Asset>,
    ) -> Result<Portfolio, RebalancerError> {
        require_identity(owner, "owner")?;
        self.locks.with_lock(owner.as_str(), || {
            if self
                .get_portfolio(owner)?
                .map(|p| p.is_active)
                .unwrap_or(false)
            {
                return Err(RebalancerError::PortfolioExists(owner.clone()));
            }
            let assets = validate_assets(assets)?;

            let now = self.clock.now();
            let portfolio = Portfolio {
                owner: owner.clone(),
                assets,
                total_value_usd: 0,
                last_rebalance_ts: None,
                is_active: true,
                created_at: now,
            };
            self.write_portfolios()?
                .insert(owner.clone(), portfolio.clone());

            info!(owner = %owner, assets = portfolio.assets.len(), "Portfolio created");
            self.audit.record(
                owner.as_str(),
                now,
                AuditEvent::new("portfolio_created", format!("assets={}", portfolio.assets.len())),
            )?;
            Ok(portfolio)
        })
    }

    /// Full replace of the asset list, never a merge.
    pub fn update_portfolio(
        &self,
        owner: &Identity,
        assets: Vec<Asset>,
    ) -> Result<Portfolio, RebalancerError> {
        self.locks.with_lock(owner.as_str(), || {
            let mut portfolio = self.active_portfolio(owner)?;
            portfolio.assets = validate_assets(assets)?;
            self.write_portfolios()?
                .insert(owner.clone(), portfolio.clone());

            info!(owner = %owner, assets = portfolio.assets.len(), "Portfolio updated");
            self.audit.record(
                owner.as_str(),
                self.clock.now(),
                AuditEvent::new("portfolio_updated", format!("assets={}", portfolio.assets.len())),
            )?;
            Ok(portfolio)
        })
    }

    /// Append one asset, carving its weight out of the largest target.
    ///
    /// The donor is the asset with the largest `target_bps` (first on ties) and
    /// must keep a positive weight afterwards.
    pub fn add_asset(&self, owner: &Identity, asset: Asset) -> Result<Portfolio, RebalancerError> {
        self.locks.with_lock(owner.as_str(), || {
            let mut portfolio = self.active_portfolio(owner)?;
            let mut assets = portfolio.assets.clone();

            let donor = assets
                .iter()
                .enumerate()
                .max_by(|(i, a), (j, b)| a.target_bps.cmp(&b.target_bps).then(j.cmp(i)))
                .map(|(i, _)| i)
                .ok_or(RebalancerError::EmptyAssets)?;
            let remaining = assets[donor]
                .target_bps
                .checked_sub(asset.target_bps)
                .filter(|left| *left > 0)
                .ok_or_else(|| RebalancerError::InvalidTargetBps {
                    token: assets[donor].token_id.clone(),
                    chain_id: assets[donor].chain_id,
                    target_bps: 0,
                })?;
            assets[donor].target_bps = remaining;

            let detail = format!("token={} chain={}", asset.token_id, asset.chain_id);
            assets.push(asset);
            portfolio.assets = validate_assets(assets)?;
            self.write_portfolios()?
                .insert(owner.clone(), portfolio.clone());

            self.audit.record(
                owner.as_str(),
                self.clock.now(),
                AuditEvent::new("asset_added", detail),
            )?;
            Ok(portfolio)
        })
    }

    /// Remove the asset keyed by `(token, chain_id)`.
    ///
    /// Removal swaps the last asset into the removed slot and truncates, so the
    /// order of the remaining assets is NOT preserved. The removed weight is
    /// folded into the asset now occupying the slot, or into the new last asset
    /// when the removed asset was itself last.
    pub fn remove_asset(
        &self,
        owner: &Identity,
        token: &TokenId,
        chain_id: ChainId,
    ) -> Result<Portfolio, RebalancerError> {
        self.locks.with_lock(owner.as_str(), || {
            let mut portfolio = self.active_portfolio(owner)?;
            let mut assets = portfolio.assets.clone();
            let position = assets
                .iter()
                .position(|asset| asset.matches(token, chain_id))
                .ok_or_else(|| RebalancerError::AssetNotFound {
                    token: token.clone(),
                    chain_id,
                })?;
            if assets.len() == 1 {
                return Err(RebalancerError::EmptyAssets);
            }

            let removed = assets.swap_remove(position);
            let heir = position.min(assets.len() - 1);
            assets[heir].target_bps += removed.target_bps;
            portfolio.assets = validate_assets(assets)?;
            self.write_portfolios()?
                .insert(owner.clone(), portfolio.clone());

            self.audit.record(
                owner.as_str(),
                self.clock.now(),
                AuditEvent::new("asset_removed", format!("token={token} chain={chain_id}")),
            )?;
            Ok(portfolio)
        })
    }

    /// Portfolios are never deleted, only deactivated.
    pub fn deactivate_portfolio(&self, owner: &Identity) -> Result<(), RebalancerError> {
        self.locks.with_lock(owner.as_str(), || {
            let mut portfolio = self.active_portfolio(owner)?;
            portfolio.is_active = false;
            self.write_portfolios()?.insert(owner.clone(), portfolio);

            info!(owner = %owner, "Portfolio deactivated");
            self.audit.record(
                owner.as_str(),
                self.clock.now(),
                AuditEvent::new("portfolio_deactivated", ""),
            )?;
            Ok(())
        })
    }

    pub fn get_portfolio(&self, owner: &Identity) -> Result<Option<Portfolio>, RebalancerError> {
        Ok(self
            .portfolios
            .read()
            .map_err(|_| RebalancerError::LockPoisoned("portfolios"))?
            .get(owner)
            .cloned())
    }

    // --- Delegation policy -----------------------------------------------

    /// Overwrites any existing policy for `owner`; bounds are never merged.
    pub fn set_delegation_policy(
        &self,
        owner: &Identity,
        delegate: &Identity,
        bounds: PolicyBounds,
    ) -> Result<DelegationPolicy, RebalancerError> {
        require_identity(owner, "owner")?;
        require_identity(delegate, "delegate")?;
        validate_bounds(&bounds)?;

        self.locks.with_lock(owner.as_str(), || {
            let now = self.clock.now();
            let policy = DelegationPolicy {
                owner: owner.clone(),
                delegate: delegate.clone(),
                max_slippage_bps: bounds.max_slippage_bps,
                max_rebalance_usd: bounds.max_rebalance_usd,
                threshold_bps: bounds.threshold_bps,
                cooldown_secs: bounds.cooldown_secs,
                is_active: true,
                updated_at: now,
            };
            self.write_policies()?.insert(owner.clone(), policy.clone());

            info!(
                owner = %owner,
                delegate = %delegate,
                threshold_bps = bounds.threshold_bps,
                cooldown_secs = bounds.cooldown_secs,
                "Delegation policy set"
            );
            self.audit.record(
                owner.as_str(),
                now,
                AuditEvent::new(
                    "policy_set",
                    format!(
                        "delegate={} slippage={} threshold={} cooldown={}",
                        delegate, bounds.max_slippage_bps, bounds.threshold_bps, bounds.cooldown_secs
                    ),
                ),
            )?;
            Ok(policy)
        })
    }

    /// Idempotent: revoking an absent or inactive policy succeeds.
    pub fn revoke_delegation(&self, owner: &Identity) -> Result<(), RebalancerError> {
        self.locks.with_lock(owner.as_str(), || {
            let mut policies = self.write_policies()?;
            let Some(policy) = policies.get_mut(owner) else {
                return Ok(());
            };
            if !policy.is_active {
                return Ok(());
            }
            policy.is_active = false;
            policy.updated_at = self.clock.now();
            drop(policies);

            info!(owner = %owner, "Delegation revoked");
            self.audit.record(
                owner.as_str(),
                self.clock.now(),
                AuditEvent::new("policy_revoked", ""),
            )?;
            Ok(())
        })
    }

    pub fn get_delegation_policy(
        &self,
        owner: &Identity,
    ) -> Result<Option<DelegationPolicy>, RebalancerError> {
        Ok(self
            .policies
            .read()
            .map_err(|_| RebalancerError::LockPoisoned("policies"))?
            .get(owner)
            .cloned())
    }

    pub fn active_policy(&self, owner: &Identity) -> Result<DelegationPolicy, RebalancerError> {
        self.get_delegation_policy(owner)?
            .filter(|policy| policy.is_active)
            .ok_or_else(|| RebalancerError::PolicyInactive(owner.clone()))
    }

    // --- Balances ----------------------------------------------------------

    /// Overwrite the cached balance; only the owner's active delegate may call.
    pub fn update_balance(
        &self,
        caller: &Identity,
        owner: &Identity,
        token: &TokenId,
        new_balance: u128,
    ) -> Result<(), RebalancerError> {
        require_token(token)?;
        self.locks.with_lock(owner.as_str(), || {
            self.require_active_delegate(caller, owner)?;
            self.write_balances()?
                .insert((owner.clone(), token.clone()), new_balance);
            debug!(owner = %owner, token = %token, amount = %new_balance, "Balance updated");
            Ok(())
        })
    }

    /// Book a realized swap: `token_in` drops to zero, `token_out` is credited.
    pub(crate) fn settle_swap(
        &self,
        owner: &Identity,
        token_in: &TokenId,
        token_out: &TokenId,
        amount_out: u128,
    ) -> Result<u128, RebalancerError> {
        require_token(token_in)?;
        require_token(token_out)?;
        self.locks.with_lock(owner.as_str(), || {
            let mut balances = self.write_balances()?;
            let credited = balances
                .get(&(owner.clone(), token_out.clone()))
                .copied()
                .unwrap_or(0)
                .checked_add(amount_out)
                .ok_or(RebalancerError::ValueOverflow("output token balance"))?;
            balances.insert((owner.clone(), token_in.clone()), 0);
            balances.insert((owner.clone(), token_out.clone()), credited);
            debug!(owner = %owner, token_in = %token_in, token_out = %token_out, balance = %credited, "Swap settled");
            Ok(credited)
        })
    }

    /// Credit `amount` onto the cached balance of `token`.
    pub(crate) fn credit_balance(
        &self,
        owner: &Identity,
        token: &TokenId,
        amount: u128,
    ) -> Result<u128, RebalancerError> {
        require_token(token)?;
        self.locks.with_lock(owner.as_str(), || {
            let mut balances = self.write_balances()?;
            let slot = balances.entry((owner.clone(), token.clone())).or_insert(0);
            *slot = slot
                .checked_add(amount)
                .ok_or(RebalancerError::ValueOverflow("token balance"))?;
            debug!(owner = %owner, token = %token, balance = %*slot, "Balance credited");
            Ok(*slot)
        })
    }

    pub fn balance(&self, owner: &Identity, token: &TokenId) -> u128 {
        self.balances
            .read()
            .ok()
            .and_then(|balances| balances.get(&(owner.clone(), token.clone())).copied())
            .unwrap_or(0)
    }

    // --- Rebalance decisions -----------------------------------------------

    /// Whether the owner's allocation drifted beyond the policy threshold.
    ///
    /// An inactive policy or an unexpired cooldown is a `false` decision, not
    /// an error. A length mismatch against the asset list is an error.
    pub fn needs_rebalancing(
        &self,
        owner: &Identity,
        current_bps: &[u32],
    ) -> Result<bool, RebalancerError> {
        let Some(policy) = self.get_delegation_policy(owner)?.filter(|p| p.is_active) else {
            debug!(owner = %owner, "No active policy; rebalancing not needed");
            return Ok(false);
        };
        let portfolio = self.active_portfolio(owner)?;

        let now = self.clock.now();
        if !cooldown_elapsed(portfolio.last_rebalance_ts, policy.cooldown_secs, now) {
            debug!(owner = %owner, "Cooldown active; rebalancing not needed");
            return Ok(false);
        }

        if current_bps.len() != portfolio.assets.len() {
            return Err(RebalancerError::LengthMismatch {
                expected: portfolio.assets.len(),
                actual: current_bps.len(),
            });
        }

        let max_drift = portfolio
            .assets
            .iter()
            .zip(current_bps)
            .map(|(asset, current)| asset.target_bps.abs_diff(*current))
            .max()
            .unwrap_or(0);

        let needed = max_drift > policy.threshold_bps;
        debug!(owner = %owner, max_drift, threshold = policy.threshold_bps, needed, "Drift evaluated");
        Ok(needed)
    }

    /// Stamp a finished rebalance; only the active delegate may call.
    pub fn execute_rebalance(
        &self,
        caller: &Identity,
        owner: &Identity,
        total_value_usd: u128,
    ) -> Result<Portfolio, RebalancerError> {
        self.locks.with_lock(owner.as_str(), || {
            self.require_active_delegate(caller, owner)?;
            self.stamp_locked(owner, total_value_usd)
        })
    }

    /// Set value and timestamp, re-arming the cooldown window.
    pub(crate) fn stamp_rebalance(
        &self,
        owner: &Identity,
        total_value_usd: u128,
    ) -> Result<Portfolio, RebalancerError> {
        self.locks
            .with_lock(owner.as_str(), || self.stamp_locked(owner, total_value_usd))
    }

    // Caller holds the owner lock.
    fn stamp_locked(
        &self,
        owner: &Identity,
        total_value_usd: u128,
    ) -> Result<Portfolio, RebalancerError> {
        let policy = self.active_policy(owner)?;
        let mut portfolio = self.active_portfolio(owner)?;

        let now = self.clock.now();
        if !cooldown_elapsed(portfolio.last_rebalance_ts, policy.cooldown_secs, now) {
            return Err(RebalancerError::CooldownActive {
                owner: owner.clone(),
                ready_at: ready_at(portfolio.last_rebalance_ts, policy.cooldown_secs)
                    .unwrap_or(now),
            });
        }

        portfolio.total_value_usd = total_value_usd;
        portfolio.last_rebalance_ts = Some(now);
        self.write_portfolios()?
            .insert(owner.clone(), portfolio.clone());

        info!(owner = %owner, total_value_usd = %total_value_usd, "Rebalance stamped");
        self.audit.record(
            owner.as_str(),
            now,
            AuditEvent::new("rebalance_stamped", format!("total_value_usd={total_value_usd}")),
        )?;
        Ok(portfolio)
    }

    // --- Snapshot ------------------------------------------------------------

    pub fn snapshot(&self) -> Result<PolicyStoreSnapshot, RebalancerError> {
        let mut portfolios: Vec<Portfolio> = self
            .portfolios
            .read()
            .map_err(|_| RebalancerError::LockPoisoned("portfolios"))?
            .values()
            .cloned()
            .collect();
        portfolios.sort_by(|a, b| a.owner.cmp(&b.owner));

        let mut policies: Vec<DelegationPolicy> = self
            .policies
            .read()
            .map_err(|_| RebalancerError::LockPoisoned("policies"))?
            .values()
            .cloned()
            .collect();
        policies.sort_by(|a, b| a.owner.cmp(&b.owner));

        let mut balances: Vec<BalanceEntry> = self
            .balances
            .read()
            .map_err(|_| RebalancerError::LockPoisoned("balances"))?
            .iter()
            .map(|((owner, token), amount)| BalanceEntry {
                owner: owner.clone(),
                token: token.clone(),
                amount: *amount,
            })
            .collect();
        balances.sort_by(|a, b| (&a.owner, &a.token).cmp(&(&b.owner, &b.token)));

        Ok(PolicyStoreSnapshot {
            portfolios,
            policies,
            balances,
        })
    }

    pub fn restore(&self, snapshot: PolicyStoreSnapshot) -> Result<(), RebalancerError> {
        *self.write_portfolios()? = snapshot
            .portfolios
            .into_iter()
            .map(|p| (p.owner.clone(), p))
            .collect();
        *self.write_policies()? = snapshot
            .policies
            .into_iter()
            .map(|p| (p.owner.clone(), p))
            .collect();
        *self
            .balances
            .write()
            .map_err(|_| RebalancerError::LockPoisoned("balances"))? = snapshot
            .balances
            .into_iter()
            .map(|b| ((b.owner, b.token), b.amount))
            .collect();
        Ok(())
    }

    // --- Guards ----------------------------------------------------------------

    fn require_active_delegate(
        &self,
        caller: &Identity,
        owner: &Identity,
    ) -> Result<(), RebalancerError> {
        match self.get_delegation_policy(owner)? {
            Some(policy) if policy.is_active && &policy.delegate == caller => Ok(()),
            _ => Err(RebalancerError::unauthorized(caller, "the active delegate")),
        }
    }

    fn active_portfolio(&self, owner: &Identity) -> Result<Portfolio, RebalancerError> {
        self.get_portfolio(owner)?
            .filter(|portfolio| portfolio.is_active)
            .ok_or_else(|| RebalancerError::PortfolioNotFound(owner.clone()))
    }

    fn write_portfolios(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<Identity, Portfolio>>, RebalancerError> {
        self.portfolios
            .write()
            .map_err(|_| RebalancerError::LockPoisoned("portfolios"))
    }

    fn write_policies(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<Identity, DelegationPolicy>>, RebalancerError>
    {
        self.policies
            .write()
            .map_err(|_| RebalancerError::LockPoisoned("policies"))
    }

    fn write_balances(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<(Identity, TokenId), u128>>, RebalancerError>
    {
        self.balances
            .write()
            .map_err(|_| RebalancerError::LockPoisoned("balances"))
    }
}

/// Validate an asset list against the allocation invariant.
pub fn validate_assets(assets: Vec<Asset>) -> Result<Vec<Asset>, RebalancerError> {
    if assets.is_empty() {
        return Err(RebalancerError::EmptyAssets);
    }

    let mut seen = HashSet::new();
    let mut sum: u64 = 0;
    for asset in &assets {
        if asset.token_id.is_empty() {
            return Err(RebalancerError::EmptyIdentity { field: "token_id" });
        }
        if asset.target_bps == 0 {
            return Err(RebalancerError::InvalidTargetBps {
                token: asset.token_id.clone(),
                chain_id: asset.chain_id,
                target_bps: asset.target_bps,
            });
        }
        if !seen.insert((asset.token_id.clone(), asset.chain_id)) {
            return Err(RebalancerError::DuplicateAsset {
                token: asset.token_id.clone(),
                chain_id: asset.chain_id,
            });
        }
        sum += u64::from(asset.target_bps);
    }

    if sum != u64::from(TOTAL_BPS) {
        return Err(RebalancerError::AllocationSum { sum });
    }

    Ok(assets
        .into_iter()
        .map(|asset| Asset {
            is_active: true,
            ..asset
        })
        .collect())
}

fn validate_bounds(bounds: &PolicyBounds) -> Result<(), RebalancerError> {
    if bounds.max_slippage_bps > MAX_SLIPPAGE_BPS {
        return Err(RebalancerError::BoundExceeded {
            field: "max_slippage_bps",
            value: u64::from(bounds.max_slippage_bps),
            max: u64::from(MAX_SLIPPAGE_BPS),
        });
    }
    if bounds.threshold_bps > MAX_THRESHOLD_BPS {
        return Err(RebalancerError::BoundExceeded {
            field: "threshold_bps",
            value: u64::from(bounds.threshold_bps),
            max: u64::from(MAX_THRESHOLD_BPS),
        });
    }
    if bounds.cooldown_secs < MIN_COOLDOWN_SECS {
        return Err(RebalancerError::CooldownTooShort {
            value: bounds.cooldown_secs,
            min: MIN_COOLDOWN_SECS,
        });
    }
    Ok(())
}

fn require_identity(identity: &Identity, field: &'static str) -> Result<(), RebalancerError> {
    if identity.is_empty() {
        return Err(RebalancerError::EmptyIdentity { field });
    }
    Ok(())
}

fn require_token(token: &TokenId) -> Result<(), RebalancerError> {
    if token.is_empty() {
        return Err(RebalancerError::EmptyIdentity { field: "token" });
    }
    Ok(())
}

fn ready_at(last: Option<DateTime<Utc>>, cooldown_secs: u64) -> Option<DateTime<Utc>> {
    let cooldown = i64::try_from(cooldown_secs)
        .ok()
        .and_then(Duration::try_seconds)?;
    last.and_then(|ts| ts.checked_add_signed(cooldown))
}

fn cooldown_elapsed(last: Option<DateTime<Utc>>, cooldown_secs: u64, now: DateTime<Utc>) -> bool {
    match last {
        None => true,
        // An unrepresentable ready time means the window never closes.
        Some(_) => ready_at(last, cooldown_secs)
            .map(|ready| now >= ready)
            .unwrap_or(false),
    }
}
