//! Byte-quota admission policy
//!
//! The quota bounds the aggregate serialized size of all admitted bundles.
//! It is checked at admission time only: a store that would push the total
//! over the limit is rejected outright, leaving no partial state.

/// Upper bound on aggregate stored bundle size, in bytes
///
/// A quota of zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageQuota {
    max_bytes: u64,
}

impl StorageQuota {
    /// Create a quota with the given byte limit (0 = unlimited)
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }

    /// An unlimited quota
    pub fn unlimited() -> Self {
        Self { max_bytes: 0 }
    }

    /// Whether a limit is configured
    pub fn is_limited(&self) -> bool {
        self.max_bytes > 0
    }

    /// The configured limit in bytes (0 = unlimited)
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Whether admitting `additional` bytes on top of `current` would exceed the limit
    pub fn would_exceed(&self, current: u64, additional: u64) -> bool {
        self.is_limited() && current.saturating_add(additional) > self.max_bytes
    }

    /// Bytes still available under the limit
    pub fn available(&self, current: u64) -> u64 {
        if self.is_limited() {
            self.max_bytes.saturating_sub(current)
        } else {
            u64::MAX
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_exceeds() {
        let quota = StorageQuota::unlimited();
        assert!(!quota.is_limited());
        assert!(!quota.would_exceed(u64::MAX - 1, 1));
        assert_eq!(quota.available(12345), u64::MAX);
    }

    #[test]
    fn test_limit_is_inclusive() {
        let quota = StorageQuota::new(100);
        assert!(!quota.would_exceed(50, 50));
        assert!(quota.would_exceed(50, 51));
        assert_eq!(quota.available(60), 40);
    }

    #[test]
    fn test_saturating_accounting() {
        let quota = StorageQuota::new(100);
        assert!(quota.would_exceed(u64::MAX, 1));
        assert_eq!(quota.available(200), 0);
    }
}
