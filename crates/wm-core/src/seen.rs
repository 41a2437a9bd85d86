//! Insertion-ordered, bounded sets of seen fingerprints.

use std::collections::BTreeMap;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::Fingerprint;

pub const DEFAULT_MAX_ITEMS_PER_SITE: usize = 10_000;

/// Seen-sets keyed by site key.
pub type SeenMap = BTreeMap<String, SeenSet>;

/// Fingerprints of one site, oldest first. Serialized as a JSON array.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeenSet {
    items: IndexSet<Fingerprint>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.items.contains(fingerprint)
    }

    /// Returns `false` if the fingerprint was already present; its position
    /// is left unchanged in that case.
    pub fn insert(&mut self, fingerprint: Fingerprint) -> bool {
        self.items.insert(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Fingerprint> {
        self.items.iter()
    }

    /// Evict the oldest entries until at most `cap` remain. Returns the
    /// number evicted.
    pub fn trim_to(&mut self, cap: usize) -> usize {
        let excess = self.items.len().saturating_sub(cap);
        if excess > 0 {
            self.items.drain(..excess);
        }
        excess
    }

    pub fn shrink_to_fit(&mut self) {
        self.items.shrink_to_fit();
    }
}

impl Extend<Fingerprint> for SeenSet {
    fn extend<I: IntoIterator<Item = Fingerprint>>(&mut self, iter: I) {
        self.items.extend(iter);
    }
}

impl FromIterator<Fingerprint> for SeenSet {
    fn from_iter<I: IntoIterator<Item = Fingerprint>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

/// Total fingerprints across all sites.
pub fn total_seen(map: &SeenMap) -> usize {
    map.values().map(SeenSet::len).sum()
}
