//! The bundle index and its expiry-ordered view
//!
//! Two ordered structures over one container set: the retrieval index,
//! ordered by (priority descending, identity ascending) so higher-priority
//! bundles are always offered first, and the expiry view, ordered by absolute
//! expiry time so eviction touches only the entries that are actually due.
//! Removing an identity removes it from both. The index also carries the
//! aggregate size counter the quota is enforced against.
//!
//! The index itself is not synchronized; the facade owns it behind its single
//! store lock.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use caravel_bundle::{BundleId, EndpointId, Priority};

use crate::container::BundleContainer;
use crate::error::{StoreError, StoreResult};
use crate::quota::StorageQuota;
use crate::summary::BloomFilter;

/// Retrieval order: priority descending, then identity ascending
#[derive(Debug, Clone, PartialEq, Eq)]
struct IndexKey {
    priority: Priority,
    id: BundleId,
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Result of an admission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// The container was inserted into both views
    Inserted,
    /// The identity is already present; nothing changed
    Duplicate,
}

/// Priority/identity-ordered container index with an expiry-ordered view
#[derive(Debug, Default)]
pub(crate) struct BundleIndex {
    entries: BTreeMap<IndexKey, BundleContainer>,
    ids: HashMap<BundleId, Priority>,
    expiry: BTreeSet<(u64, BundleId)>,
    current_size: u64,
    quota: StorageQuota,
}

impl BundleIndex {
    pub(crate) fn new(quota: StorageQuota) -> Self {
        Self {
            quota,
            ..Default::default()
        }
    }

    /// Admit a container into both views, enforcing the quota
    ///
    /// A duplicate identity is a no-op; a quota violation leaves the index
    /// untouched.
    pub(crate) fn insert(&mut self, container: BundleContainer) -> StoreResult<Admission> {
        let id = container.id().clone();
        if self.ids.contains_key(&id) {
            return Ok(Admission::Duplicate);
        }

        self.reserve(container.size())?;

        let priority = container.meta().priority();
        let expires_at = container.meta().expires_at;

        self.entries.insert(
            IndexKey {
                priority,
                id: id.clone(),
            },
            container,
        );
        self.ids.insert(id.clone(), priority);
        self.expiry.insert((expires_at, id));

        Ok(Admission::Inserted)
    }

    /// Reserve bytes against the quota without indexing a container
    ///
    /// Absorbed fragments live in the fragment table rather than the index,
    /// but their bytes still count toward the quota; the facade reserves them
    /// here and releases them when the group completes or expires.
    pub(crate) fn reserve(&mut self, additional: u64) -> StoreResult<()> {
        if self.quota.would_exceed(self.current_size, additional) {
            return Err(StoreError::SizeExceeded {
                requested: additional,
                available: self.quota.available(self.current_size),
            });
        }
        self.current_size = self.current_size.saturating_add(additional);
        Ok(())
    }

    /// Give back bytes previously taken by `reserve` or an indexed container
    pub(crate) fn release(&mut self, bytes: u64) {
        self.current_size = self.current_size.saturating_sub(bytes);
    }

    /// Look up a container by identity
    pub(crate) fn get(&self, id: &BundleId) -> Option<BundleContainer> {
        let priority = *self.ids.get(id)?;
        self.entries
            .get(&IndexKey {
                priority,
                id: id.clone(),
            })
            .cloned()
    }

    pub(crate) fn contains(&self, id: &BundleId) -> bool {
        self.ids.contains_key(id)
    }

    /// First container addressed to the endpoint, in retrieval order
    ///
    /// Ties between equal-priority candidates resolve to the lowest identity
    /// because of the index ordering.
    pub(crate) fn find_by_destination(
        &self,
        destination: &EndpointId,
        exact: bool,
    ) -> Option<BundleContainer> {
        self.entries
            .values()
            .find(|c| destination.matches(&c.meta().destination, exact))
            .cloned()
    }

    /// First container whose identity is not represented in the filter and
    /// whose destination is not blocked, in retrieval order
    pub(crate) fn find_not_in(
        &self,
        filter: &BloomFilter,
        blocked: &HashSet<EndpointId>,
    ) -> Option<BundleContainer> {
        self.entries
            .values()
            .find(|c| {
                !filter.contains(&c.id().to_string())
                    && !blocked.contains(&c.meta().destination)
            })
            .cloned()
    }

    /// Unlink an identity from both views and release its size
    pub(crate) fn remove(&mut self, id: &BundleId) -> Option<BundleContainer> {
        let priority = self.ids.remove(id)?;
        let container = self.entries.remove(&IndexKey {
            priority,
            id: id.clone(),
        })?;
        self.expiry
            .remove(&(container.meta().expires_at, id.clone()));
        self.current_size = self.current_size.saturating_sub(container.size());
        Some(container)
    }

    /// Unlink every entry with `expiry <= now`, earliest first
    ///
    /// Walks the expiry view front-to-back and stops at the first still-valid
    /// entry, so the cost is proportional to the number of expired bundles.
    pub(crate) fn take_expired(&mut self, now: u64) -> Vec<BundleContainer> {
        let mut expired = Vec::new();
        while let Some(entry) = self.expiry.first() {
            if entry.0 > now {
                break;
            }
            let Some((_, id)) = self.expiry.pop_first() else {
                break;
            };
            if let Some(priority) = self.ids.remove(&id)
                && let Some(container) = self.entries.remove(&IndexKey {
                    priority,
                    id,
                })
            {
                self.current_size = self.current_size.saturating_sub(container.size());
                expired.push(container);
            }
        }
        expired
    }

    /// Remove everything, returning the containers for tombstoning
    pub(crate) fn drain(&mut self) -> Vec<BundleContainer> {
        self.ids.clear();
        self.expiry.clear();
        self.current_size = 0;
        std::mem::take(&mut self.entries).into_values().collect()
    }

    /// Apply a size correction after a durable write refreshed a container's size
    pub(crate) fn adjust_size(&mut self, delta: i64) {
        if delta >= 0 {
            self.current_size = self.current_size.saturating_add(delta as u64);
        } else {
            self.current_size = self.current_size.saturating_sub(delta.unsigned_abs());
        }
    }

    /// All identities in retrieval order
    pub(crate) fn list(&self) -> Vec<BundleId> {
        self.entries.keys().map(|k| k.id.clone()).collect()
    }

    pub(crate) fn count(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn size(&self) -> u64 {
        self.current_size
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
