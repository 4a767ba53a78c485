//! Canonical content hash of an allocation.
//!
//! The digest covers a canonical JSON rendering of the allocation:
//!
//! ```text
//! {"<asset>":<weight>,...}    keys sorted lexicographically (byte order)
//! ```
//!
//! Weights render the way Go's `encoding/json` renders a `float64`, so digests
//! already stored under `allocation_hash` by the Go intake service still match:
//! integral weights print without a fraction (`60`, not `60.0`), other values use
//! the shortest round-trip form. `-0.0` is folded into `0` and non-finite
//! weights render as `null`, so hashing never fails.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::allocation::Allocation;

/// Length of a rendered fingerprint (hex-encoded SHA-256).
pub const FINGERPRINT_HEX_LEN: usize = 64;

/// Opaque fixed-width digest of an allocation's exact content.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap a stored digest. Returns `None` unless it is 64 lowercase hex chars.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let valid = hex.len() == FINGERPRINT_HEX_LEN
            && hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(hex.to_string()))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 16 hex chars, for log lines and document ids.
    #[inline]
    pub fn short(&self) -> &str {
        self.0.get(..16).unwrap_or(&self.0)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Fingerprint::from_hex(&hex)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid fingerprint {hex:?}")))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the fingerprint of an allocation.
pub fn fingerprint(allocation: &Allocation) -> Fingerprint {
    let digest = Sha256::digest(canonical_encoding(allocation).as_bytes());
    Fingerprint(hex::encode(digest))
}

/// The exact text that gets hashed.
pub fn canonical_encoding(allocation: &Allocation) -> String {
    let mut pairs: Vec<(&str, f64)> = allocation.iter().collect();
    pairs.sort_unstable_by(|a, b| a.0.cmp(b.0));

    let mut out = String::with_capacity(2 + pairs.len() * 24);
    out.push('{');
    for (i, (asset, weight)) in pairs.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&serde_json::Value::String(asset.to_owned()).to_string());
        out.push(':');
        out.push_str(&render_weight(weight));
    }
    out.push('}');
    out
}

/// Go switches to exponent notation at this magnitude.
const PLAIN_INTEGRAL_LIMIT: f64 = 1e21;

fn render_weight(weight: f64) -> String {
    // -0.0 == 0.0, so both must encode identically
    let weight = if weight == 0.0 { 0.0 } else { weight };
    if weight.is_finite() && weight.fract() == 0.0 && weight.abs() < PLAIN_INTEGRAL_LIMIT {
        return format!("{weight:.0}");
    }
    match serde_json::Number::from_f64(weight) {
        Some(n) => n.to_string(),
        None => "null".to_string(),
    }
}
