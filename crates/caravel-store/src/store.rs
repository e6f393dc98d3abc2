//! The storage facade
//!
//! `BundleStore` composes the index, the fragment table and the persistence
//! pipeline behind one synchronization boundary: a single mutex over the
//! in-memory state, never held across I/O or an `.await`. Durable reads
//! happen after the lock is released; durable writes and deletes go through
//! the pipeline and never touch the caller's path.
//!
//! Opening a store on an existing working directory re-admits every readable
//! artifact, sweeps temp-file leftovers of interrupted writes, and deletes
//! unreadable artifacts instead of refusing to start.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use caravel_bundle::{Bundle, BundleId, BundleMeta, EndpointId};
use tokio::fs;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::container::{BundleContainer, LifecycleState};
use crate::error::{StoreError, StoreResult};
use crate::events::{DeletionReason, EventSender, EventSink, StoreEvent};
use crate::fragments::{AbsorbOutcome, FragmentTable};
use crate::index::{Admission, BundleIndex};
use crate::pipeline::{self, StoreTask};
use crate::quota::StorageQuota;
use crate::summary::{BloomFilter, SummaryVector};

/// Store configuration, injected at construction
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Working directory for durable artifacts
    pub workdir: PathBuf,
    /// Byte quota over all admitted bundles (0 = unlimited)
    pub quota_bytes: u64,
    /// Durable write attempts before a bundle is left memory-resident
    pub max_write_attempts: u32,
    /// Fail the first N durable writes; test hook for exercising the retry path
    pub inject_write_failures: u32,
}

impl StoreConfig {
    /// Configuration with the given working directory and no quota
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            quota_bytes: 0,
            max_write_attempts: 10,
            inject_write_failures: 0,
        }
    }

    /// Set the byte quota (0 = unlimited)
    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }

    /// Set the durable write attempt cap
    pub fn with_max_write_attempts(mut self, attempts: u32) -> Self {
        self.max_write_attempts = attempts.max(1);
        self
    }

    /// Fail the first N durable writes (testing)
    pub fn with_injected_write_failures(mut self, failures: u32) -> Self {
        self.inject_write_failures = failures;
        self
    }
}

#[derive(Debug)]
struct StoreInner {
    index: BundleIndex,
    fragments: FragmentTable,
}

/// State shared between the facade and the pipeline worker
#[derive(Debug)]
pub(crate) struct StoreShared {
    inner: Mutex<StoreInner>,
    workdir: PathBuf,
    events: EventSink,
    max_write_attempts: u32,
    fail_budget: AtomicU32,
}

impl StoreShared {
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn artifact_path(&self, id: &BundleId) -> PathBuf {
        self.workdir.join(pipeline::artifact_name(id))
    }

    pub(crate) fn events(&self) -> &EventSink {
        &self.events
    }

    pub(crate) fn max_write_attempts(&self) -> u32 {
        self.max_write_attempts
    }

    /// Consume one injected failure, if any remain
    pub(crate) fn injected_failure(&self) -> StoreResult<()> {
        let armed = self
            .fail_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            return Err(StoreError::io("injected write failure"));
        }
        Ok(())
    }

    /// Apply a size correction reported by a completed durable write
    pub(crate) fn adjust_size(&self, delta: i64) {
        self.lock_inner().index.adjust_size(delta);
    }

    /// Unlink everything expired at `now`, returning indexed bundles and
    /// retired fragment containers separately
    pub(crate) fn take_expired(
        &self,
        now: u64,
    ) -> (Vec<BundleContainer>, Vec<BundleContainer>) {
        let mut inner = self.lock_inner();
        let expired = inner.index.take_expired(now);
        let fragments = inner.fragments.expire(now);
        for container in &fragments {
            inner.index.release(container.size());
        }
        (expired, fragments)
    }
}

/// The bundle store: concurrent index, write-back persistence, expiry,
/// fragment reassembly and quota enforcement behind one facade
#[derive(Debug)]
pub struct BundleStore {
    shared: Arc<StoreShared>,
    tasks: mpsc::UnboundedSender<StoreTask>,
    worker: JoinHandle<()>,
}

impl BundleStore {
    /// Open a store over a working directory, restoring any durable artifacts
    ///
    /// `events` is the notification-bus sender; pass `None` for a silent
    /// store. The persistence worker runs until `shutdown`.
    pub async fn open(config: StoreConfig, events: Option<EventSender>) -> StoreResult<Self> {
        fs::create_dir_all(&config.workdir).await?;

        let shared = Arc::new(StoreShared {
            inner: Mutex::new(StoreInner {
                index: BundleIndex::new(StorageQuota::new(config.quota_bytes)),
                fragments: FragmentTable::default(),
            }),
            workdir: config.workdir,
            events: EventSink::new(events),
            max_write_attempts: config.max_write_attempts.max(1),
            fail_budget: AtomicU32::new(config.inject_write_failures),
        });

        let (tasks, queue) = mpsc::unbounded_channel();
        let worker = pipeline::spawn(Arc::clone(&shared), tasks.downgrade(), queue);

        let store = Self {
            shared,
            tasks,
            worker,
        };
        store.restore().await?;
        Ok(store)
    }

    /// Re-admit durable artifacts left by a previous process
    async fn restore(&self) -> StoreResult<()> {
        let mut restored = 0usize;
        let mut dropped = 0usize;

        let mut dir = fs::read_dir(&self.shared.workdir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some("tmp") => {
                    // Leftover of an interrupted atomic write.
                    debug!(path = %path.display(), "Sweeping interrupted write");
                    let _ = fs::remove_file(&path).await;
                }
                Some("bundle") => match self.restore_artifact(&path).await {
                    Ok(()) => restored += 1,
                    Err(err @ StoreError::SizeExceeded { .. }) => {
                        warn!(path = %path.display(), error = %err, "Dropping artifact over the storage quota");
                        let _ = fs::remove_file(&path).await;
                        dropped += 1;
                    }
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "Deleting unreadable artifact");
                        let _ = fs::remove_file(&path).await;
                        dropped += 1;
                    }
                },
                _ => {}
            }
        }

        if restored > 0 || dropped > 0 {
            info!(restored, dropped, "Restored bundle store from durable storage");
        }
        Ok(())
    }

    async fn restore_artifact(&self, path: &Path) -> StoreResult<()> {
        let data = fs::read(path).await?;
        let bundle = Bundle::from_wire(&data)?;
        let meta = BundleMeta::from(&bundle);
        let container = BundleContainer::from_artifact(meta, path.to_path_buf(), data.len() as u64);

        if bundle.primary.flags.is_fragment() {
            let size = container.size();
            let outcome = {
                let mut inner = self.shared.lock_inner();
                inner.index.reserve(size)?;
                match inner.fragments.absorb(&bundle, Some(container)) {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        inner.index.release(size);
                        return Err(err);
                    }
                }
            };
            if let AbsorbOutcome::Complete { bundle, sources } = outcome {
                self.retire(sources)?;
                self.store_bundle(bundle)?;
            }
        } else {
            let id = container.id().clone();
            if let Err(err) = self.shared.lock_inner().index.insert(container) {
                if matches!(err, StoreError::SizeExceeded { .. }) {
                    self.shared.events().emit(StoreEvent::BundleDeleted {
                        id,
                        reason: DeletionReason::DepletedStorage,
                    });
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Admit a bundle (or bundle fragment) into the store
    ///
    /// Storing an identity that is already present is a no-op. A completed
    /// fragment group is folded into the reassembled original bundle, which
    /// is admitted as if it had been stored whole.
    #[instrument(skip_all, fields(id = %bundle.id()))]
    pub async fn store(&self, bundle: Bundle) -> StoreResult<()> {
        if bundle.primary.flags.is_fragment() {
            self.store_fragment(bundle)
        } else {
            self.store_bundle(bundle)
        }
    }

    fn store_bundle(&self, bundle: Bundle) -> StoreResult<()> {
        let container = BundleContainer::new_resident(bundle)?;
        let admission = self.shared.lock_inner().index.insert(container.clone())?;

        match admission {
            Admission::Duplicate => {
                debug!(id = %container.id(), "Bundle already stored");
                Ok(())
            }
            Admission::Inserted => {
                container.mark_pending_write();
                debug!(id = %container.id(), size = container.size(), "Bundle admitted");
                self.submit(StoreTask::Write {
                    container,
                    attempt: 0,
                })
            }
        }
    }

    fn store_fragment(&self, bundle: Bundle) -> StoreResult<()> {
        let container = BundleContainer::new_resident(bundle.clone())?;
        let size = container.size();

        // Fragments live in the fragment table, not the index, but their
        // bytes still count against the quota until the group completes or
        // expires.
        let outcome = {
            let mut inner = self.shared.lock_inner();
            inner.index.reserve(size)?;
            match inner.fragments.absorb(&bundle, Some(container.clone())) {
                Ok(outcome) => outcome,
                Err(err) => {
                    inner.index.release(size);
                    return Err(err);
                }
            }
        };

        match outcome {
            AbsorbOutcome::Duplicate => {
                self.shared.lock_inner().index.release(size);
                debug!(id = %container.id(), "Fragment already absorbed");
                Ok(())
            }
            AbsorbOutcome::Incomplete => {
                // Persist the fragment so a partially collected group
                // survives a restart.
                container.mark_pending_write();
                debug!(id = %container.id(), "Fragment absorbed, group incomplete");
                self.submit(StoreTask::Write {
                    container,
                    attempt: 0,
                })
            }
            AbsorbOutcome::Complete { bundle, sources } => {
                info!(id = %bundle.id(), "Fragment group reassembled");
                self.retire(sources)?;
                let id = bundle.id();
                self.store_bundle(bundle).inspect_err(|err| {
                    if matches!(err, StoreError::SizeExceeded { .. }) {
                        warn!(id = %id, error = %err, "Reassembled bundle over quota, dropping");
                        self.shared.events().emit(StoreEvent::BundleDeleted {
                            id: id.clone(),
                            reason: DeletionReason::DepletedStorage,
                        });
                    }
                })
            }
        }
    }

    /// Fetch a bundle by identity
    ///
    /// An unrecoverable durable record is purged on sight: the identity is
    /// unlinked, a deletion event is raised and the load error is surfaced
    /// once.
    pub async fn get(&self, id: &BundleId) -> StoreResult<Bundle> {
        let container = self
            .shared
            .lock_inner()
            .index
            .get(id)
            .ok_or(StoreError::NotFound)?;

        match container.load().await {
            Ok(bundle) => Ok(bundle),
            Err(err @ StoreError::LoadFailed { .. }) => {
                warn!(id = %id, error = %err, "Purging unrecoverable bundle record");
                self.shared.lock_inner().index.remove(id);
                container.tombstone();
                let _ = self.submit(StoreTask::Remove { container });
                self.shared.events().emit(StoreEvent::BundleDeleted {
                    id: id.clone(),
                    reason: DeletionReason::Unrecoverable,
                });
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Metadata of the best bundle addressed to an endpoint
    ///
    /// With `exact` false the endpoint matches at node level, so a query for
    /// the node finds bundles addressed to any of its applications. Ties
    /// resolve to highest priority, then lowest identity.
    pub async fn get_by_destination(
        &self,
        destination: &EndpointId,
        exact: bool,
    ) -> StoreResult<BundleMeta> {
        self.shared
            .lock_inner()
            .index
            .find_by_destination(destination, exact)
            .map(|c| c.meta().clone())
            .ok_or(StoreError::NotFound)
    }

    /// Metadata of the best bundle a neighbor does not already hold
    ///
    /// `filter` is the neighbor's summary filter; `blocked` destinations are
    /// skipped regardless.
    pub async fn get_not_in(
        &self,
        filter: &BloomFilter,
        blocked: &HashSet<EndpointId>,
    ) -> StoreResult<BundleMeta> {
        self.shared
            .lock_inner()
            .index
            .find_not_in(filter, blocked)
            .map(|c| c.meta().clone())
            .ok_or(StoreError::NotFound)
    }

    /// Remove a bundle by identity
    ///
    /// Explicit removal is silent: no deletion event is raised.
    pub async fn remove(&self, id: &BundleId) -> StoreResult<()> {
        let container = self
            .shared
            .lock_inner()
            .index
            .remove(id)
            .ok_or(StoreError::NotFound)?;

        container.tombstone();
        debug!(id = %id, "Bundle removed");
        self.submit(StoreTask::Remove { container })
    }

    /// Remove the best bundle not represented in a neighbor's filter,
    /// returning its metadata
    pub async fn remove_not_in(&self, filter: &BloomFilter) -> StoreResult<BundleMeta> {
        let container = {
            let mut inner = self.shared.lock_inner();
            let found = inner
                .index
                .find_not_in(filter, &HashSet::new())
                .ok_or(StoreError::NotFound)?;
            let id = found.id().clone();
            inner.index.remove(&id).ok_or(StoreError::NotFound)?
        };

        let meta = container.meta().clone();
        container.tombstone();
        debug!(id = %meta.id, "Bundle removed by filter");
        self.submit(StoreTask::Remove { container })?;
        Ok(meta)
    }

    /// Drop every bundle and recreate the durable working directory
    ///
    /// The directory is replaced as one bulk operation rather than per-item
    /// deletes.
    pub async fn clear(&self) -> StoreResult<()> {
        let retired = {
            let mut inner = self.shared.lock_inner();
            let mut all = inner.index.drain();
            all.extend(inner.fragments.drain());
            all
        };
        let count = retired.len();
        for container in retired {
            container.tombstone();
            // The bulk directory swap below covers the artifacts.
            container.take_artifact();
        }

        fs::remove_dir_all(&self.shared.workdir).await?;
        fs::create_dir_all(&self.shared.workdir).await?;
        info!(count, "Cleared bundle store");
        Ok(())
    }

    /// Deliver a time tick in absolute DTN seconds
    ///
    /// Expiry runs on the pipeline worker; each expired bundle or fragment
    /// group raises one expiry event.
    pub fn handle_tick(&self, now: u64) -> StoreResult<()> {
        self.submit(StoreTask::Expire { timestamp: now })
    }

    /// Number of stored bundles (excluding partial fragment groups)
    pub fn count(&self) -> usize {
        self.shared.lock_inner().index.count()
    }

    /// Aggregate serialized size of stored bundles in bytes
    pub fn size(&self) -> u64 {
        self.shared.lock_inner().index.size()
    }

    /// Whether no bundles are stored
    pub fn is_empty(&self) -> bool {
        self.shared.lock_inner().index.is_empty()
    }

    /// Whether a bundle with this identity is stored
    pub fn contains(&self, id: &BundleId) -> bool {
        self.shared.lock_inner().index.contains(id)
    }

    /// All stored identities in retrieval order
    pub fn list(&self) -> Vec<BundleId> {
        self.shared.lock_inner().index.list()
    }

    /// Summary vector over the current contents, for neighbor exchange
    pub fn summary_vector(&self) -> SummaryVector {
        SummaryVector::from_ids(self.shared.lock_inner().index.list())
    }

    /// Lifecycle state of a stored bundle, for diagnostics
    pub fn lifecycle_of(&self, id: &BundleId) -> Option<LifecycleState> {
        self.shared.lock_inner().index.get(id).map(|c| c.state())
    }

    /// Number of partially collected fragment groups
    pub fn pending_fragment_groups(&self) -> usize {
        self.shared.lock_inner().fragments.group_count()
    }

    /// Shut down: stop accepting work, drain the pipeline, join the worker
    ///
    /// Durable writes still queued are processed; nothing new can be
    /// submitted once this is called.
    pub async fn shutdown(self) -> StoreResult<()> {
        let Self {
            shared: _shared,
            tasks,
            worker,
        } = self;
        drop(tasks);
        worker.await.map_err(|err| StoreError::io(err.to_string()))
    }

    fn retire(&self, sources: Vec<BundleContainer>) -> StoreResult<()> {
        {
            let mut inner = self.shared.lock_inner();
            for container in &sources {
                inner.index.release(container.size());
            }
        }
        for container in sources {
            container.tombstone();
            self.submit(StoreTask::Remove { container })?;
        }
        Ok(())
    }

    fn submit(&self, task: StoreTask) -> StoreResult<()> {
        self.tasks.send(task).map_err(|_| StoreError::ShutDown)
    }
}
