//! Allocations (asset → percentage weight) and the inbound rebalance event.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Upper bound for a single asset weight, in percent.
pub const MAX_WEIGHT_PCT: f64 = 100.0;

/// A sparse weighted set of assets. Missing assets have weight 0.
///
/// Iteration order of the underlying map is unspecified; anything observable
/// (fingerprints, diffs) sorts by asset id first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Allocation(FxHashMap<String, f64>);

impl Allocation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Weight of `asset`, or 0.0 when absent.
    #[inline]
    pub fn weight(&self, asset: &str) -> f64 {
        self.0.get(asset).copied().unwrap_or(0.0)
    }

    pub fn insert(&mut self, asset: impl Into<String>, weight: f64) -> Option<f64> {
        self.0.insert(asset.into(), weight)
    }

    pub fn contains(&self, asset: &str) -> bool {
        self.0.contains_key(asset)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn assets(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Sum of all weights.
    pub fn total(&self) -> f64 {
        self.0.values().sum()
    }

    /// Check every weight is finite and within `[0, 100]`.
    pub fn validate_weights(&self) -> Result<(), ValidationError> {
        for (asset, &weight) in &self.0 {
            if asset.is_empty() {
                return Err(ValidationError::EmptyAsset);
            }
            if !weight.is_finite() {
                return Err(ValidationError::NonFiniteWeight(asset.clone()));
            }
            if weight < 0.0 {
                return Err(ValidationError::NegativeWeight {
                    asset: asset.clone(),
                    weight,
                });
            }
            if weight > MAX_WEIGHT_PCT {
                return Err(ValidationError::WeightOutOfRange {
                    asset: asset.clone(),
                    weight,
                });
            }
        }
        Ok(())
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for Allocation {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl<K: Into<String>, const N: usize> From<[(K, f64); N]> for Allocation {
    fn from(pairs: [(K, f64); N]) -> Self {
        pairs.into_iter().collect()
    }
}

/// A request to move `user_id` from `current_allocation` to `new_allocation`.
///
/// Built upstream (HTTP handler or transport deserializer) and consumed once per
/// pipeline invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceEvent {
    pub user_id: String,
    pub new_allocation: Allocation,
    pub current_allocation: Allocation,
}

impl RebalanceEvent {
    pub fn new(
        user_id: impl Into<String>,
        new_allocation: Allocation,
        current_allocation: Allocation,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            new_allocation,
            current_allocation,
        }
    }

    /// Parse a JSON event and validate it.
    pub fn from_json(json: &str) -> Result<Self, ValidationError> {
        let event: RebalanceEvent =
            serde_json::from_str(json).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    /// True when the target is content-identical to the current allocation
    /// (same fingerprint), so the event cannot produce transactions.
    pub fn is_noop(&self) -> bool {
        crate::fingerprint::fingerprint(&self.new_allocation)
            == crate::fingerprint::fingerprint(&self.current_allocation)
    }

    /// Structural checks the pipeline relies on. Sum-to-100 is not enforced here.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.user_id.trim().is_empty() {
            return Err(ValidationError::MissingUserId);
        }
        self.new_allocation.validate_weights()?;
        self.current_allocation.validate_weights()?;
        Ok(())
    }
}
