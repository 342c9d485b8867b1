use crate::error::RebalancerError;
use crate::types::Identity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::RwLock;
use tracing::info;

/// Serializable image of the role sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSets {
    pub admins: BTreeSet<Identity>,
    pub price_feeds: BTreeSet<Identity>,
    pub authorized_agents: BTreeSet<Identity>,
}

/// Role registry backing every guard function.
///
/// Admins are fixed at construction; feeds and agents are admin-managed.
#[derive(Debug, Default)]
pub struct AccessControl {
    roles: RwLock<RoleSets>,
}

impl AccessControl {
    pub fn new(roles: RoleSets) -> Self {
        Self {
            roles: RwLock::new(roles),
        }
    }

    pub fn is_admin(&self, who: &Identity) -> bool {
        self.roles
            .read()
            .map(|roles| roles.admins.contains(who))
            .unwrap_or(false)
    }

    pub fn is_price_feed(&self, who: &Identity) -> bool {
        self.roles
            .read()
            .map(|roles| roles.price_feeds.contains(who))
            .unwrap_or(false)
    }

    pub fn is_authorized_agent(&self, who: &Identity) -> bool {
        self.roles
            .read()
            .map(|roles| roles.authorized_agents.contains(who))
            .unwrap_or(false)
    }

    pub fn require_admin(&self, caller: &Identity) -> Result<(), RebalancerError> {
        if self.is_admin(caller) {
            Ok(())
        } else {
            Err(RebalancerError::unauthorized(caller, "an admin"))
        }
    }

    pub fn require_price_feed(&self, caller: &Identity) -> Result<(), RebalancerError> {
        if self.is_price_feed(caller) {
            Ok(())
        } else {
            Err(RebalancerError::unauthorized(caller, "a trusted price feed"))
        }
    }

    pub fn require_authorized_agent(&self, caller: &Identity) -> Result<(), RebalancerError> {
        if self.is_authorized_agent(caller) {
            Ok(())
        } else {
            Err(RebalancerError::unauthorized(caller, "an authorized agent"))
        }
    }

    pub fn add_authorized_agent(
        &self,
        caller: &Identity,
        agent: Identity,
    ) -> Result<(), RebalancerError> {
        self.require_admin(caller)?;
        if agent.is_empty() {
            return Err(RebalancerError::EmptyIdentity { field: "agent" });
        }
        let mut roles = self.write()?;
        roles.authorized_agents.insert(agent.clone());
        info!(agent = %agent, by = %caller, "Authorized agent added");
        Ok(())
    }

    pub fn remove_authorized_agent(
        &self,
        caller: &Identity,
        agent: &Identity,
    ) -> Result<bool, RebalancerError> {
        self.require_admin(caller)?;
        let removed = self.write()?.authorized_agents.remove(agent);
        info!(agent = %agent, by = %caller, removed, "Authorized agent removed");
        Ok(removed)
    }

    pub fn grant_price_feed(&self, caller: &Identity, feed: Identity) -> Result<(), RebalancerError> {
        self.require_admin(caller)?;
        if feed.is_empty() {
            return Err(RebalancerError::EmptyIdentity { field: "feed" });
        }
        self.write()?.price_feeds.insert(feed.clone());
        info!(feed = %feed, by = %caller, "Price feed granted");
        Ok(())
    }

    pub fn revoke_price_feed(&self, caller: &Identity, feed: &Identity) -> Result<bool, RebalancerError> {
        self.require_admin(caller)?;
        Ok(self.write()?.price_feeds.remove(feed))
    }

    pub fn snapshot(&self) -> Result<RoleSets, RebalancerError> {
        Ok(self
            .roles
            .read()
            .map_err(|_| RebalancerError::LockPoisoned("roles"))?
            .clone())
    }

    pub fn restore(&self, roles: RoleSets) -> Result<(), RebalancerError> {
        *self.write()? = roles;
        Ok(())
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, RoleSets>, RebalancerError> {
        self.roles
            .write()
            .map_err(|_| RebalancerError::LockPoisoned("roles"))
    }
}
