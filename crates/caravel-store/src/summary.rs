//! Summary vectors for neighbor inventory exchange
//!
//! Routers summarize "the bundles this node already holds" as a Bloom filter
//! over serialized bundle identities, so two neighbors can find bundles worth
//! exchanging without shipping full inventories. False positives make a
//! neighbor skip a bundle it doesn't actually have; false negatives cannot
//! occur, so nothing is lost permanently.

use std::collections::BTreeSet;

use caravel_bundle::BundleId;
use serde::{Deserialize, Serialize};

/// Default filter size in bytes (matches a few thousand bundles comfortably)
const DEFAULT_FILTER_BYTES: usize = 4096;
/// Default number of hash functions
const DEFAULT_HASHES: u8 = 4;

/// A Bloom filter over bundle-id strings
///
/// Uses double hashing over a blake3 digest: the first two 64-bit words of
/// the digest seed `k` derived hash functions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u8>,
    hashes: u8,
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::new(DEFAULT_FILTER_BYTES, DEFAULT_HASHES)
    }
}

impl BloomFilter {
    /// Create a filter with `size` bytes of bit table and `hashes` hash functions
    pub fn new(size: usize, hashes: u8) -> Self {
        Self {
            bits: vec![0u8; size.max(1)],
            hashes: hashes.max(1),
        }
    }

    fn bit_positions(&self, key: &str) -> impl Iterator<Item = usize> + '_ {
        let digest = blake3::hash(key.as_bytes());
        let words = digest.as_bytes();
        let h1 = u64::from_le_bytes(words[0..8].try_into().unwrap_or_default());
        let h2 = u64::from_le_bytes(words[8..16].try_into().unwrap_or_default());
        let table_bits = (self.bits.len() * 8) as u64;

        (0..self.hashes as u64).map(move |i| {
            (h1.wrapping_add(i.wrapping_mul(h2)) % table_bits) as usize
        })
    }

    /// Whether the filter can represent anything at all
    ///
    /// Wire-decoded filters bypass the constructor, so an empty bit table or
    /// zero hash functions can arrive from a neighbor. Such a filter
    /// represents nothing.
    fn is_degenerate(&self) -> bool {
        self.bits.is_empty() || self.hashes == 0
    }

    /// Insert a key
    pub fn insert(&mut self, key: &str) {
        if self.is_degenerate() {
            return;
        }
        let positions: Vec<usize> = self.bit_positions(key).collect();
        for bit in positions {
            self.bits[bit / 8] |= 1 << (bit % 8);
        }
    }

    /// Whether the key might be present (false positives possible)
    pub fn contains(&self, key: &str) -> bool {
        !self.is_degenerate()
            && self
                .bit_positions(key)
                .all(|bit| self.bits[bit / 8] & (1 << (bit % 8)) != 0)
    }

    /// Reset all bits
    pub fn clear(&mut self) {
        self.bits.fill(0);
    }

    /// Size of the bit table in bytes
    pub fn table_len(&self) -> usize {
        self.bits.len()
    }
}

/// A node's bundle inventory: exact id set plus the exchangeable Bloom filter
///
/// The exact set makes `remove` possible (the filter is rebuilt from it) and
/// backs difference queries against a neighbor's filter.
#[derive(Debug, Clone, Default)]
pub struct SummaryVector {
    filter: BloomFilter,
    ids: BTreeSet<BundleId>,
}

impl SummaryVector {
    /// Create an empty summary vector
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a summary vector from a set of bundle identities
    pub fn from_ids(ids: impl IntoIterator<Item = BundleId>) -> Self {
        let mut vector = Self::new();
        for id in ids {
            vector.add(&id);
        }
        vector
    }

    /// Add a bundle identity
    pub fn add(&mut self, id: &BundleId) {
        self.filter.insert(&id.to_string());
        self.ids.insert(id.clone());
    }

    /// Remove a bundle identity, rebuilding the filter
    pub fn remove(&mut self, id: &BundleId) {
        if self.ids.remove(id) {
            self.filter.clear();
            for id in &self.ids {
                self.filter.insert(&id.to_string());
            }
        }
    }

    /// Whether the identity is (probably) represented
    pub fn contains(&self, id: &BundleId) -> bool {
        self.filter.contains(&id.to_string())
    }

    /// Identities present here but not represented in a neighbor's filter
    pub fn not_in(&self, filter: &BloomFilter) -> Vec<BundleId> {
        self.ids
            .iter()
            .filter(|id| !filter.contains(&id.to_string()))
            .cloned()
            .collect()
    }

    /// The exchangeable filter
    pub fn filter(&self) -> &BloomFilter {
        &self.filter
    }

    /// Number of identities represented
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether no identities are represented
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Drop all identities and reset the filter
    pub fn clear(&mut self) {
        self.filter.clear();
        self.ids.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caravel_bundle::EndpointId;

    fn id(seq: u64) -> BundleId {
        BundleId::new(EndpointId::node("node1").unwrap(), 100, seq)
    }

    #[test]
    fn test_filter_membership() {
        let mut filter = BloomFilter::default();
        filter.insert("a");
        filter.insert("b");

        assert!(filter.contains("a"));
        assert!(filter.contains("b"));
        // A 4KiB table with two entries makes a false positive on "c"
        // astronomically unlikely.
        assert!(!filter.contains("c"));
    }

    #[test]
    fn test_summary_add_remove() {
        let mut vector = SummaryVector::new();
        vector.add(&id(1));
        vector.add(&id(2));
        assert_eq!(vector.len(), 2);
        assert!(vector.contains(&id(1)));

        vector.remove(&id(1));
        assert!(!vector.contains(&id(1)));
        assert!(vector.contains(&id(2)));
    }

    #[test]
    fn test_difference_against_neighbor_filter() {
        let local = SummaryVector::from_ids([id(1), id(2), id(3)]);

        let mut neighbor = BloomFilter::default();
        neighbor.insert(&id(2).to_string());

        let missing = local.not_in(&neighbor);
        assert_eq!(missing, vec![id(1), id(3)]);
    }

    #[test]
    fn test_wire_decoded_degenerate_filter_matches_nothing() {
        // A struct and a tuple of its fields encode identically in postcard,
        // so this is the wire image a hostile neighbor could send.
        let wire = postcard::to_allocvec(&(Vec::<u8>::new(), 4u8)).unwrap();
        let hostile: BloomFilter = postcard::from_bytes(&wire).unwrap();
        assert_eq!(hostile.table_len(), 0);
        assert!(!hostile.contains("anything"));

        let mut writable = hostile.clone();
        writable.insert("x");
        assert!(!writable.contains("x"));

        let wire = postcard::to_allocvec(&(vec![0u8; 8], 0u8)).unwrap();
        let zero_hashes: BloomFilter = postcard::from_bytes(&wire).unwrap();
        assert!(!zero_hashes.contains("anything"));
    }

    #[test]
    fn test_filter_roundtrips_through_postcard() {
        let mut filter = BloomFilter::new(64, 3);
        filter.insert("x");
        let wire = postcard::to_allocvec(&filter).unwrap();
        let decoded: BloomFilter = postcard::from_bytes(&wire).unwrap();
        assert_eq!(decoded, filter);
        assert!(decoded.contains("x"));
    }
}
