use crate::access::AccessControl;
use crate::error::RebalancerError;
use crate::types::{ChainId, Identity, TokenId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceEntry {
    pub chain_id: ChainId,
    pub token: TokenId,
    pub price_usd: u128,
}

/// USD price per (chain, token), pushed by a trusted feed.
///
/// Prices are trusted as given; an unset price reads as 0 ("unpriced").
pub struct PriceRegistry {
    prices: RwLock<HashMap<(ChainId, TokenId), u128>>,
    access: Arc<AccessControl>,
}

impl PriceRegistry {
    pub fn new(access: Arc<AccessControl>) -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
            access,
        }
    }

    pub fn set_price(
        &self,
        caller: &Identity,
        chain_id: ChainId,
        token: TokenId,
        price_usd: u128,
    ) -> Result<(), RebalancerError> {
        self.access.require_price_feed(caller)?;
        if token.is_empty() {
            return Err(RebalancerError::EmptyIdentity { field: "token" });
        }

        debug!(chain_id, token = %token, price_usd = %price_usd, "Price updated");
        self.prices
            .write()
            .map_err(|_| RebalancerError::LockPoisoned("prices"))?
            .insert((chain_id, token), price_usd);
        Ok(())
    }

    pub fn get_price(&self, chain_id: ChainId, token: &TokenId) -> u128 {
        self.prices
            .read()
            .ok()
            .and_then(|prices| prices.get(&(chain_id, token.clone())).copied())
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> Result<Vec<PriceEntry>, RebalancerError> {
        let prices = self
            .prices
            .read()
            .map_err(|_| RebalancerError::LockPoisoned("prices"))?;
        let mut entries: Vec<PriceEntry> = prices
            .iter()
            .map(|((chain_id, token), price_usd)| PriceEntry {
                chain_id: *chain_id,
                token: token.clone(),
                price_usd: *price_usd,
            })
            .collect();
        entries.sort_by(|a, b| (a.chain_id, &a.token).cmp(&(b.chain_id, &b.token)));
        Ok(entries)
    }

    pub fn restore(&self, entries: Vec<PriceEntry>) -> Result<(), RebalancerError> {
        let mut prices = self
            .prices
            .write()
            .map_err(|_| RebalancerError::LockPoisoned("prices"))?;
        prices.clear();
        for entry in entries {
            prices.insert((entry.chain_id, entry.token), entry.price_usd);
        }
        Ok(())
    }
}
