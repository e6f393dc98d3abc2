//! Metadata view of a bundle
//!
//! `BundleMeta` carries the primary-block fields the storage and routing
//! layers need without holding the payload in memory. It is what index
//! lookups and summary exchanges return.

use serde::{Deserialize, Serialize};

use crate::bundle::{Bundle, Priority, ProcessingFlags};
use crate::endpoint::EndpointId;
use crate::id::BundleId;

/// Primary-block metadata, detached from the payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMeta {
    /// Bundle identity
    pub id: BundleId,
    /// Final destination endpoint
    pub destination: EndpointId,
    /// Endpoint to send status reports to
    pub report_to: EndpointId,
    /// Current custodian endpoint
    pub custodian: EndpointId,
    /// Processing flags of the primary block
    pub flags: ProcessingFlags,
    /// Lifetime in seconds
    pub lifetime: u64,
    /// Absolute expiry in DTN seconds (creation timestamp + lifetime)
    pub expires_at: u64,
    /// Total application data length (fragments only, otherwise 0)
    pub app_data_length: u64,
}

impl BundleMeta {
    /// The priority class of this bundle
    pub fn priority(&self) -> Priority {
        self.flags.priority()
    }

    /// Whether this metadata describes a fragment
    pub fn is_fragment(&self) -> bool {
        self.flags.is_fragment()
    }

    /// Whether the bundle is expired at the given time
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expires_at <= now
    }
}

impl From<&Bundle> for BundleMeta {
    fn from(bundle: &Bundle) -> Self {
        Self {
            id: bundle.id(),
            destination: bundle.primary.destination.clone(),
            report_to: bundle.primary.report_to.clone(),
            custodian: bundle.primary.custodian.clone(),
            flags: bundle.primary.flags,
            lifetime: bundle.primary.lifetime,
            expires_at: bundle.expires_at(),
            app_data_length: bundle.primary.app_data_length,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_meta_from_bundle() {
        let bundle = Bundle::new(
            EndpointId::node("src").unwrap(),
            EndpointId::node("dst").unwrap(),
            500,
            3,
            Bytes::from_static(b"payload"),
        )
        .with_lifetime(100)
        .with_priority(Priority::Expedited);

        let meta = BundleMeta::from(&bundle);
        assert_eq!(meta.id, bundle.id());
        assert_eq!(meta.expires_at, 600);
        assert_eq!(meta.priority(), Priority::Expedited);
        assert!(!meta.is_fragment());
        assert!(!meta.is_expired_at(599));
        assert!(meta.is_expired_at(600));
    }
}
