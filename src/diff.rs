//! NEW→CURRENT diff engine.
//!
//! Computes the per-asset actions needed to move a user from their current
//! allocation to the requested one. Pure and infallible: inputs have already
//! been validated upstream.
//!
//! Convention: an asset whose target weight is above its current weight is
//! bought, one below is sold. The percent is always the positive gap.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::allocation::Allocation;

/// Trade direction for one asset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Sell,
}

impl Action {
    /// Returns the opposite action.
    #[inline]
    pub fn opposite(self) -> Self {
        match self {
            Action::Buy => Action::Sell,
            Action::Sell => Action::Buy,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Buy => write!(f, "BUY"),
            Action::Sell => write!(f, "SELL"),
        }
    }
}

/// One buy or sell instruction, in percentage points of the portfolio.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RebalanceTransaction {
    pub user_id: String,
    pub asset: String,
    pub action: Action,
    #[serde(rename = "rebalance_percent")]
    pub percent: f64,
}

/// Compute the transactions moving `current` to `target` for `user_id`.
///
/// The asset universe is the union of both allocations; an asset missing from
/// one side counts as weight 0 there. Assets with equal weights produce nothing.
/// The result is sorted by asset id.
pub fn diff(target: &Allocation, current: &Allocation, user_id: &str) -> Vec<RebalanceTransaction> {
    let mut assets: Vec<&str> = target.assets().chain(current.assets()).collect();
    assets.sort_unstable();
    assets.dedup();

    assets
        .into_iter()
        .filter_map(|asset| {
            let delta = target.weight(asset) - current.weight(asset);
            let action = if delta > 0.0 {
                Action::Buy
            } else if delta < 0.0 {
                Action::Sell
            } else {
                return None;
            };
            Some(RebalanceTransaction {
                user_id: user_id.to_string(),
                asset: asset.to_string(),
                action,
                percent: delta.abs(),
            })
        })
        .collect()
}

/// Net percentage bought minus sold. Zero for two complete portfolios.
pub fn net_flow(transactions: &[RebalanceTransaction]) -> f64 {
    transactions
        .iter()
        .map(|t| match t.action {
            Action::Buy => t.percent,
            Action::Sell => -t.percent,
        })
        .sum()
}
