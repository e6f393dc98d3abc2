//! # Caravel Store
//!
//! The bundle storage engine of the Caravel DTN daemon: holds bundles for
//! arbitrarily long periods while no path to their destination exists, then
//! releases them for forwarding or local delivery.
//!
//! The engine combines:
//!
//! - a priority- and identity-ordered in-memory index with byte-quota
//!   admission ([`BundleStore::store`])
//! - write-back durable persistence through a single-consumer pipeline with
//!   atomic artifact writes and bounded retry
//! - time-driven expiration fed by an external tick
//!   ([`BundleStore::handle_tick`])
//! - fragment reassembly with union-based coverage accounting
//! - summary-vector construction for neighbor inventory exchange
//!   ([`SummaryVector`])
//!
//! Durability is best-effort write-back: `store` returns before the artifact
//! hits disk, and a crash loses at most the not-yet-flushed tail. Restarting
//! over the same working directory re-admits everything that made it to disk.
//!
//! ```no_run
//! use caravel_bundle::{Bundle, EndpointId};
//! use caravel_store::{BundleStore, StoreConfig};
//!
//! # async fn demo() -> caravel_store::StoreResult<()> {
//! let store = BundleStore::open(StoreConfig::new("/var/lib/caravel"), None).await?;
//!
//! let bundle = Bundle::new(
//!     EndpointId::application("alpha", "sensor")?,
//!     EndpointId::application("beta", "inbox")?,
//!     1_000,
//!     1,
//!     bytes::Bytes::from_static(b"reading"),
//! );
//! let id = bundle.id();
//!
//! store.store(bundle).await?;
//! let back = store.get(&id).await?;
//! # let _ = back;
//! store.shutdown().await
//! # }
//! ```

pub mod container;
pub mod error;
pub mod events;
pub mod quota;
pub mod store;
pub mod summary;

mod fragments;
mod index;
mod pipeline;

pub use container::{BundleContainer, LifecycleState};
pub use error::{StoreError, StoreResult};
pub use events::{DeletionReason, EventSender, StoreEvent};
pub use quota::StorageQuota;
pub use store::{BundleStore, StoreConfig};
pub use summary::{BloomFilter, SummaryVector};

use std::collections::HashSet;

use async_trait::async_trait;
use caravel_bundle::{Bundle, BundleId, BundleMeta, EndpointId};

/// The storage interface routing and networking collaborators depend on
///
/// [`BundleStore`] is the production implementation; the trait exists so
/// routers can be written and tested against a storage stand-in.
#[async_trait]
pub trait BundleStorage: Send + Sync {
    /// Admit a bundle or fragment
    async fn store(&self, bundle: Bundle) -> StoreResult<()>;

    /// Fetch a bundle by identity
    async fn get(&self, id: &BundleId) -> StoreResult<Bundle>;

    /// Metadata of the best bundle addressed to an endpoint
    async fn get_by_destination(
        &self,
        destination: &EndpointId,
        exact: bool,
    ) -> StoreResult<BundleMeta>;

    /// Metadata of the best bundle a neighbor does not already hold
    async fn get_not_in(
        &self,
        filter: &BloomFilter,
        blocked: &HashSet<EndpointId>,
    ) -> StoreResult<BundleMeta>;

    /// Remove a bundle by identity
    async fn remove(&self, id: &BundleId) -> StoreResult<()>;

    /// Number of stored bundles
    fn count(&self) -> usize;

    /// Aggregate serialized size in bytes
    fn size(&self) -> u64;

    /// Whether no bundles are stored
    fn is_empty(&self) -> bool;
}

#[async_trait]
impl BundleStorage for BundleStore {
    async fn store(&self, bundle: Bundle) -> StoreResult<()> {
        BundleStore::store(self, bundle).await
    }

    async fn get(&self, id: &BundleId) -> StoreResult<Bundle> {
        BundleStore::get(self, id).await
    }

    async fn get_by_destination(
        &self,
        destination: &EndpointId,
        exact: bool,
    ) -> StoreResult<BundleMeta> {
        BundleStore::get_by_destination(self, destination, exact).await
    }

    async fn get_not_in(
        &self,
        filter: &BloomFilter,
        blocked: &HashSet<EndpointId>,
    ) -> StoreResult<BundleMeta> {
        BundleStore::get_not_in(self, filter, blocked).await
    }

    async fn remove(&self, id: &BundleId) -> StoreResult<()> {
        BundleStore::remove(self, id).await
    }

    fn count(&self) -> usize {
        BundleStore::count(self)
    }

    fn size(&self) -> u64 {
        BundleStore::size(self)
    }

    fn is_empty(&self) -> bool {
        BundleStore::is_empty(self)
    }
}
