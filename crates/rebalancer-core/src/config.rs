//! Engine configuration

use crate::access::RoleSets;
use crate::error::RebalancerError;
use crate::types::Identity;
use serde::{Deserialize, Serialize};

/// Engine configuration, usually the `[engine]` table of the service config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Identities allowed to pause actions and manage roles
    pub admins: Vec<Identity>,

    /// Identities allowed to push prices
    pub price_feeds: Vec<Identity>,

    /// Agents allowed to create and execute rebalance actions
    pub authorized_agents: Vec<Identity>,

    /// Session lifetime used when a delegation does not name one
    pub default_session_ttl_secs: u64,

    /// Operation cap used when a delegation does not name one
    pub default_max_ops: u32,

    /// Reject swap legs whose priced minimum output breaks the policy slippage
    pub enforce_slippage_bounds: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            admins: Vec::new(),
            price_feeds: Vec::new(),
            authorized_agents: Vec::new(),
            default_session_ttl_secs: 86_400,
            default_max_ops: 10,
            enforce_slippage_bounds: true,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, RebalancerError> {
        let config: EngineConfig = toml::from_str(contents)
            .map_err(|e| RebalancerError::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RebalancerError> {
        if self.default_session_ttl_secs == 0 {
            return Err(RebalancerError::InvalidInput(
                "default_session_ttl_secs must be positive".to_string(),
            ));
        }
        if self.default_max_ops == 0 {
            return Err(RebalancerError::InvalidInput(
                "default_max_ops must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn roles(&self) -> RoleSets {
        RoleSets {
            admins: self.admins.iter().cloned().collect(),
            price_feeds: self.price_feeds.iter().cloned().collect(),
            authorized_agents: self.authorized_agents.iter().cloned().collect(),
        }
    }
}
