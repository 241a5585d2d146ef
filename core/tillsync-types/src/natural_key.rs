//! Natural-key normalization.
//!
//! Two records are "the same thing" when their natural keys are equal after
//! trimming, collapsing internal whitespace and lowercasing. This is the
//! comparison used both for duplicate consolidation and for resolving a
//! dangling reference by parent name.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A normalized natural key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalKey(String);

impl NaturalKey {
    /// Normalizes a raw value. Returns `None` for blank input, which never
    /// participates in matching.
    pub fn new(raw: &str) -> Option<Self> {
        let normalized = normalize_natural_key(raw);
        if normalized.is_empty() {
            None
        } else {
            Some(Self(normalized))
        }
    }

    /// Returns the normalized form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trims, collapses whitespace runs to a single space and lowercases.
pub fn normalize_natural_key(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
