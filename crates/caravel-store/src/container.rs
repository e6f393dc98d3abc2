//! Bundle containers and their lifecycle
//!
//! A container owns one live bundle in the store. It starts memory-resident,
//! may be handed to the persistence pipeline for a durable write, and serves
//! reads from memory or from its durable artifact depending on where the
//! payload currently lives. Shared ownership is plain `Arc`: the index holds
//! one handle, in-flight pipeline tasks hold others, and the backing resource
//! is released by whoever drops the last handle after a tombstone.
//!
//! State machine:
//!
//! ```text
//! Resident ──mark_pending_write──▶ PendingWrite ──complete_write──▶ Durable
//!     ▲                                 │
//!     └────────abandon_write────────────┘        any ──tombstone──▶ Tombstoned
//! ```

use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use caravel_bundle::{Bundle, BundleId, BundleMeta};

use crate::error::{StoreError, StoreResult};

/// Where a container's payload currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Payload in memory, no durable write pending
    Resident,
    /// Payload in memory, a durable write is enqueued or in flight
    PendingWrite,
    /// Payload evicted; reads reload from the durable artifact
    Durable,
    /// Unlinked from the index; backing resources released with the last handle
    Tombstoned,
}

#[derive(Debug)]
enum ContainerBody {
    Resident(Arc<Bundle>),
    PendingWrite(Arc<Bundle>),
    Durable(PathBuf),
    Tombstoned(Option<PathBuf>),
}

impl ContainerBody {
    fn state(&self) -> LifecycleState {
        match self {
            ContainerBody::Resident(_) => LifecycleState::Resident,
            ContainerBody::PendingWrite(_) => LifecycleState::PendingWrite,
            ContainerBody::Durable(_) => LifecycleState::Durable,
            ContainerBody::Tombstoned(_) => LifecycleState::Tombstoned,
        }
    }
}

/// Outcome of completing a durable write
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    /// The container moved to `Durable`; the index size changed by this delta
    Completed { size_delta: i64 },
    /// The container was tombstoned while the write ran; the fresh artifact
    /// must be deleted by the caller
    Discarded,
}

#[derive(Debug)]
struct ContainerInner {
    meta: BundleMeta,
    body: Mutex<ContainerBody>,
    size: AtomicU64,
    deletion: AtomicBool,
}

impl Drop for ContainerInner {
    fn drop(&mut self) {
        // Backstop for the last handle: the pipeline's removal task is the
        // normal path, this covers containers that never reached it.
        if self.deletion.load(Ordering::SeqCst)
            && let Ok(body) = self.body.get_mut()
            && let ContainerBody::Tombstoned(Some(path)) = body
        {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Shared handle to one stored bundle
///
/// Cloning is cheap; all clones refer to the same lifecycle state.
#[derive(Debug, Clone)]
pub struct BundleContainer {
    inner: Arc<ContainerInner>,
}

impl BundleContainer {
    /// Create a memory-resident container for a freshly stored bundle
    ///
    /// The serialized size is computed up front so quota accounting does not
    /// depend on when (or whether) the durable write happens.
    pub(crate) fn new_resident(bundle: Bundle) -> StoreResult<Self> {
        let size = bundle.to_wire()?.len() as u64;
        let meta = BundleMeta::from(&bundle);
        Ok(Self {
            inner: Arc::new(ContainerInner {
                meta,
                body: Mutex::new(ContainerBody::Resident(Arc::new(bundle))),
                size: AtomicU64::new(size),
                deletion: AtomicBool::new(false),
            }),
        })
    }

    /// Create a durable container for an artifact found during startup restore
    pub(crate) fn from_artifact(meta: BundleMeta, path: PathBuf, size: u64) -> Self {
        Self {
            inner: Arc::new(ContainerInner {
                meta,
                body: Mutex::new(ContainerBody::Durable(path)),
                size: AtomicU64::new(size),
                deletion: AtomicBool::new(false),
            }),
        }
    }

    /// Identity of the contained bundle
    pub fn id(&self) -> &BundleId {
        &self.inner.meta.id
    }

    /// Metadata of the contained bundle
    pub fn meta(&self) -> &BundleMeta {
        &self.inner.meta
    }

    /// Serialized size in bytes (refreshed after a durable write)
    pub fn size(&self) -> u64 {
        self.inner.size.load(Ordering::SeqCst)
    }

    /// Current lifecycle state
    pub fn state(&self) -> LifecycleState {
        self.lock_body().state()
    }

    fn lock_body(&self) -> std::sync::MutexGuard<'_, ContainerBody> {
        // A poisoned body mutex means a panic mid-transition; the body enum
        // is always left whole, so continuing with it is sound.
        self.inner
            .body
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move `Resident` to `PendingWrite` ahead of enqueuing a write task
    pub(crate) fn mark_pending_write(&self) {
        let mut body = self.lock_body();
        if let ContainerBody::Resident(bundle) = &*body {
            *body = ContainerBody::PendingWrite(Arc::clone(bundle));
        }
    }

    /// The bundle to serialize, if a write is still wanted
    ///
    /// Returns `None` when the container was tombstoned or abandoned while
    /// the task sat in the queue; the worker then skips the write.
    pub(crate) fn pending_bundle(&self) -> Option<Arc<Bundle>> {
        match &*self.lock_body() {
            ContainerBody::PendingWrite(bundle) => Some(Arc::clone(bundle)),
            _ => None,
        }
    }

    /// Complete a durable write: release the in-memory payload and adopt the artifact
    pub(crate) fn complete_write(&self, path: PathBuf, written: u64) -> WriteOutcome {
        let mut body = self.lock_body();
        match &*body {
            ContainerBody::PendingWrite(_) => {
                let previous = self.inner.size.swap(written, Ordering::SeqCst);
                *body = ContainerBody::Durable(path);
                WriteOutcome::Completed {
                    size_delta: written as i64 - previous as i64,
                }
            }
            _ => WriteOutcome::Discarded,
        }
    }

    /// Abandon a failed write after the retry cap: the bundle stays memory-only
    pub(crate) fn abandon_write(&self) {
        let mut body = self.lock_body();
        if let ContainerBody::PendingWrite(bundle) = &*body {
            *body = ContainerBody::Resident(Arc::clone(bundle));
        }
    }

    /// Tombstone the container: it is already unlinked from the index, the
    /// backing artifact (if any) is released by the removal task or the last
    /// handle drop
    pub(crate) fn tombstone(&self) {
        self.inner.deletion.store(true, Ordering::SeqCst);
        let mut body = self.lock_body();
        let path = match &*body {
            ContainerBody::Durable(path) => Some(path.clone()),
            ContainerBody::Tombstoned(path) => path.clone(),
            _ => None,
        };
        *body = ContainerBody::Tombstoned(path);
    }

    /// Take the artifact path out of a tombstoned container for deletion
    ///
    /// Clears the path so the drop backstop does not race the removal task.
    pub(crate) fn take_artifact(&self) -> Option<PathBuf> {
        let mut body = self.lock_body();
        if let ContainerBody::Tombstoned(path) = &mut *body {
            path.take()
        } else {
            None
        }
    }

    /// Materialize the bundle
    ///
    /// Resident and pending-write containers answer from memory; durable
    /// containers reload and decode the artifact. The body lock is never held
    /// across the file read.
    pub async fn load(&self) -> StoreResult<Bundle> {
        enum Source {
            Memory(Arc<Bundle>),
            Artifact(PathBuf),
        }

        let source = match &*self.lock_body() {
            ContainerBody::Resident(bundle) | ContainerBody::PendingWrite(bundle) => {
                Source::Memory(Arc::clone(bundle))
            }
            ContainerBody::Durable(path) => Source::Artifact(path.clone()),
            ContainerBody::Tombstoned(_) => return Err(StoreError::NotFound),
        };

        match source {
            Source::Memory(bundle) => Ok((*bundle).clone()),
            Source::Artifact(path) => {
                let data = tokio::fs::read(&path)
                    .await
                    .map_err(|e| StoreError::load_failed(self.id().clone(), e.to_string()))?;
                Bundle::from_wire(&data)
                    .map_err(|e| StoreError::load_failed(self.id().clone(), e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use caravel_bundle::EndpointId;

    fn make_bundle() -> Bundle {
        Bundle::new(
            EndpointId::node("src").unwrap(),
            EndpointId::node("dst").unwrap(),
            100,
            1,
            Bytes::from_static(b"payload"),
        )
    }

    #[tokio::test]
    async fn test_resident_load() {
        let container = BundleContainer::new_resident(make_bundle()).unwrap();
        assert_eq!(container.state(), LifecycleState::Resident);
        assert!(container.size() > 0);

        let bundle = container.load().await.unwrap();
        assert_eq!(bundle.id(), *container.id());
    }

    #[tokio::test]
    async fn test_write_lifecycle() {
        let container = BundleContainer::new_resident(make_bundle()).unwrap();
        container.mark_pending_write();
        assert_eq!(container.state(), LifecycleState::PendingWrite);
        assert!(container.pending_bundle().is_some());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.bundle");
        let wire = make_bundle().to_wire().unwrap();
        tokio::fs::write(&path, &wire).await.unwrap();

        let outcome = container.complete_write(path, wire.len() as u64);
        assert!(matches!(outcome, WriteOutcome::Completed { size_delta: 0 }));
        assert_eq!(container.state(), LifecycleState::Durable);

        let bundle = container.load().await.unwrap();
        assert_eq!(bundle.id(), *container.id());
    }

    #[tokio::test]
    async fn test_abandon_returns_to_resident() {
        let container = BundleContainer::new_resident(make_bundle()).unwrap();
        container.mark_pending_write();
        container.abandon_write();
        assert_eq!(container.state(), LifecycleState::Resident);
        // Still readable from memory.
        assert!(container.load().await.is_ok());
    }

    #[tokio::test]
    async fn test_tombstone_discards_in_flight_write() {
        let container = BundleContainer::new_resident(make_bundle()).unwrap();
        container.mark_pending_write();
        container.tombstone();

        assert!(container.pending_bundle().is_none());
        let outcome = container.complete_write(PathBuf::from("/nonexistent"), 10);
        assert_eq!(outcome, WriteOutcome::Discarded);
        assert!(container.load().await.is_err());
    }

    #[tokio::test]
    async fn test_last_handle_removes_tombstoned_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.bundle");
        let bundle = make_bundle();
        let wire = bundle.to_wire().unwrap();
        tokio::fs::write(&path, &wire).await.unwrap();

        let meta = BundleMeta::from(&bundle);
        let container = BundleContainer::from_artifact(meta, path.clone(), wire.len() as u64);
        container.tombstone();
        drop(container);

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_take_artifact_disarms_backstop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.bundle");
        tokio::fs::write(&path, b"data").await.unwrap();

        let bundle = make_bundle();
        let meta = BundleMeta::from(&bundle);
        let container = BundleContainer::from_artifact(meta, path.clone(), 4);
        container.tombstone();

        assert_eq!(container.take_artifact(), Some(path.clone()));
        assert_eq!(container.take_artifact(), None);
        drop(container);
        // The backstop must not have touched the file once taken.
        assert!(path.exists());
    }
}
