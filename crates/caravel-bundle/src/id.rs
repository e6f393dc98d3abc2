//! Bundle identity
//!
//! A `BundleId` uniquely names a bundle or a bundle fragment. Two fragments
//! of the same original bundle share (source, timestamp, sequence) and differ
//! only in their fragment offset.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::endpoint::EndpointId;

/// Unique identifier of a bundle or bundle fragment
///
/// The derived ordering is lexicographic on
/// (source, timestamp, sequence, fragment offset); a non-fragment sorts
/// before any fragment of the same group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BundleId {
    /// Source endpoint of the bundle
    pub source: EndpointId,
    /// Creation timestamp in DTN seconds
    pub timestamp: u64,
    /// Sequence number distinguishing bundles created in the same second
    pub sequence: u64,
    /// Byte offset of this fragment's payload, `None` for whole bundles
    pub fragment_offset: Option<u64>,
}

impl BundleId {
    /// Create the identity of a whole (non-fragmented) bundle
    pub fn new(source: EndpointId, timestamp: u64, sequence: u64) -> Self {
        Self {
            source,
            timestamp,
            sequence,
            fragment_offset: None,
        }
    }

    /// Create the identity of a fragment
    pub fn fragment(source: EndpointId, timestamp: u64, sequence: u64, offset: u64) -> Self {
        Self {
            source,
            timestamp,
            sequence,
            fragment_offset: Some(offset),
        }
    }

    /// Whether this identity names a fragment
    pub fn is_fragment(&self) -> bool {
        self.fragment_offset.is_some()
    }

    /// The identity of the whole bundle this fragment belongs to
    pub fn whole_bundle(&self) -> BundleId {
        Self {
            source: self.source.clone(),
            timestamp: self.timestamp,
            sequence: self.sequence,
            fragment_offset: None,
        }
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}@{}", self.timestamp, self.sequence, self.source)?;
        if let Some(offset) = self.fragment_offset {
            write!(f, "+{offset}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> EndpointId {
        EndpointId::node("node1").unwrap()
    }

    #[test]
    fn test_ordering() {
        let a = BundleId::new(source(), 100, 1);
        let b = BundleId::new(source(), 100, 2);
        let c = BundleId::new(source(), 101, 0);
        let frag = BundleId::fragment(source(), 100, 1, 50);

        assert!(a < b);
        assert!(b < c);
        // A whole bundle sorts before any fragment of the same group.
        assert!(a < frag);
    }

    #[test]
    fn test_whole_bundle_of_fragment() {
        let frag = BundleId::fragment(source(), 100, 1, 50);
        assert!(frag.is_fragment());
        assert_eq!(frag.whole_bundle(), BundleId::new(source(), 100, 1));
    }

    #[test]
    fn test_display() {
        let id = BundleId::fragment(source(), 100, 1, 50);
        assert_eq!(id.to_string(), "100.1@dtn://node1+50");
    }
}
