//! The persistence pipeline
//!
//! A single worker task drains a FIFO queue of durable-storage work: writes,
//! artifact removals and expiry sweeps. One consumer means tasks touching the
//! same bundle execute in submission order, so a removal enqueued after a
//! write always observes the write's outcome (or its tombstone-discard).
//!
//! Artifacts are written atomically: serialize to a sibling `.tmp` file, sync,
//! then rename into place. A crash mid-write leaves only a `.tmp` leftover
//! that startup restore sweeps away.
//!
//! Failed writes are retried with a short delay up to the configured attempt
//! cap; past the cap the bundle simply stays memory-resident. Retries are
//! resubmitted through a downgraded sender so an in-flight retry never keeps
//! the queue alive after the store facade is gone.

use std::sync::Arc;
use std::time::Duration;

use caravel_bundle::BundleId;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{UnboundedReceiver, WeakUnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use crate::container::{BundleContainer, WriteOutcome};
use crate::error::StoreResult;
use crate::events::{DeletionReason, StoreEvent};
use crate::store::StoreShared;

/// Delay between write attempts
const RETRY_DELAY: Duration = Duration::from_millis(50);

/// Work items consumed by the pipeline worker
#[derive(Debug)]
pub(crate) enum StoreTask {
    /// Persist a pending-write container to its durable artifact
    Write {
        container: BundleContainer,
        attempt: u32,
    },
    /// Delete a tombstoned container's artifact
    Remove { container: BundleContainer },
    /// Sweep out everything expired at the given time
    Expire { timestamp: u64 },
}

/// File name of the durable artifact for a bundle identity
pub(crate) fn artifact_name(id: &BundleId) -> String {
    let digest = blake3::hash(id.to_string().as_bytes());
    format!("{}.bundle", hex::encode(digest.as_bytes()))
}

/// Start the pipeline worker
///
/// The worker owns the receiver; it exits once every sender (the facade's
/// plus any pending retry resubmission) is gone and the queue is drained.
pub(crate) fn spawn(
    shared: Arc<StoreShared>,
    tasks: WeakUnboundedSender<StoreTask>,
    mut queue: UnboundedReceiver<StoreTask>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(task) = queue.recv().await {
            match task {
                StoreTask::Write { container, attempt } => {
                    run_write(&shared, &tasks, container, attempt).await;
                }
                StoreTask::Remove { container } => {
                    run_remove(&container).await;
                }
                StoreTask::Expire { timestamp } => {
                    run_expire(&shared, timestamp).await;
                }
            }
        }
        trace!("Persistence queue drained, pipeline worker exiting");
    })
}

async fn run_write(
    shared: &StoreShared,
    tasks: &WeakUnboundedSender<StoreTask>,
    container: BundleContainer,
    attempt: u32,
) {
    // Tombstoned or abandoned while queued: nothing to persist.
    let Some(bundle) = container.pending_bundle() else {
        return;
    };

    let outcome: StoreResult<()> = async {
        shared.injected_failure()?;
        let data = bundle.to_wire()?;
        let path = shared.artifact_path(container.id());
        write_atomic(&path, &data).await?;

        match container.complete_write(path.clone(), data.len() as u64) {
            WriteOutcome::Completed { size_delta } => {
                if size_delta != 0 {
                    shared.adjust_size(size_delta);
                }
                trace!(id = %container.id(), bytes = data.len(), "Bundle persisted");
            }
            WriteOutcome::Discarded => {
                // Tombstoned mid-write; the fresh artifact must not linger.
                let _ = fs::remove_file(&path).await;
            }
        }
        Ok(())
    }
    .await;

    if let Err(err) = outcome {
        let next = attempt + 1;
        if next >= shared.max_write_attempts() {
            error!(
                id = %container.id(),
                attempts = next,
                error = %err,
                "Durable write abandoned, bundle stays memory-resident"
            );
            container.abandon_write();
            return;
        }
        debug!(id = %container.id(), attempt = next, error = %err, "Durable write failed, requeueing");
        sleep(RETRY_DELAY).await;
        let resubmitted = tasks.upgrade().is_some_and(|tx| {
            tx.send(StoreTask::Write {
                container: container.clone(),
                attempt: next,
            })
            .is_ok()
        });
        if !resubmitted {
            // Facade gone, queue closed: give up quietly.
            container.abandon_write();
        }
    }
}

async fn run_remove(container: &BundleContainer) {
    let Some(path) = container.take_artifact() else {
        return;
    };
    match fs::remove_file(&path).await {
        Ok(()) => trace!(id = %container.id(), "Artifact removed"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(id = %container.id(), error = %err, "Failed to remove artifact"),
    }
}

async fn run_expire(shared: &StoreShared, timestamp: u64) {
    let (expired, fragments) = shared.take_expired(timestamp);
    if expired.is_empty() && fragments.is_empty() {
        return;
    }
    info!(
        bundles = expired.len(),
        fragments = fragments.len(),
        timestamp,
        "Expiring bundles"
    );

    for container in expired {
        container.tombstone();
        shared.events().emit(StoreEvent::BundleExpired {
            id: container.id().clone(),
        });
        debug!(id = %container.id(), "Bundle lifetime elapsed");
        run_remove(&container).await;
    }

    // Fragments of a never-completed group were never visible as stored
    // bundles; their purge is announced as a deletion, not an expiry.
    for container in fragments {
        container.tombstone();
        shared.events().emit(StoreEvent::BundleDeleted {
            id: container.id().clone(),
            reason: DeletionReason::LifetimeExpired,
        });
        debug!(id = %container.id(), "Fragment group expired");
        run_remove(&container).await;
    }
}

/// Write `data` to `path` atomically via a sibling temp file
async fn write_atomic(path: &std::path::Path, data: &[u8]) -> StoreResult<()> {
    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use caravel_bundle::EndpointId;

    #[test]
    fn test_artifact_name_is_stable_and_distinct() {
        let a = BundleId::new(EndpointId::node("n").unwrap(), 1, 1);
        let b = BundleId::new(EndpointId::node("n").unwrap(), 1, 2);

        assert_eq!(artifact_name(&a), artifact_name(&a));
        assert_ne!(artifact_name(&a), artifact_name(&b));
        assert!(artifact_name(&a).ends_with(".bundle"));
    }

    #[tokio::test]
    async fn test_write_atomic_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.bundle");

        write_atomic(&path, b"data").await.unwrap();

        assert_eq!(fs::read(&path).await.unwrap(), b"data");
        assert!(!path.with_extension("tmp").exists());
    }
}
