//! Background vision-extraction worker.
//!
//! Uploads enqueue an explicit job; a dispatcher task fans jobs out to a
//! semaphore-bounded pool. Enqueueing never blocks the upload path, and a
//! run may start while extraction is still processing; the vision adapter
//! waits a bounded interval or proceeds with what has completed.
//!
//! Artifact status advances Pending → Processing → {Completed | Failed} and
//! never reverts; completion status is polled, not delivered by callback.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use precheck_core::ExtractionStatus;

use crate::config::UploadConfig;
use crate::store::{Datastore, ObjectStore};
use crate::tools::PhotoExtractor;

/// One queued extraction job.
#[derive(Debug, Clone, Copy)]
struct ExtractionJob {
    artifact_id: Uuid,
}

/// Handle for enqueueing extraction jobs.
#[derive(Clone)]
pub struct ExtractionQueue {
    tx: mpsc::UnboundedSender<ExtractionJob>,
}

impl ExtractionQueue {
    /// Enqueue extraction for an artifact. Non-blocking; a closed worker
    /// leaves the artifact pending for the run-time extraction path.
    pub fn enqueue(&self, artifact_id: Uuid) {
        if self.tx.send(ExtractionJob { artifact_id }).is_err() {
            warn!(%artifact_id, "extraction worker is down, job dropped");
        }
    }
}

/// The worker pool. Owns the dispatcher task.
pub struct ExtractionWorker {
    handle: JoinHandle<()>,
}

impl ExtractionWorker {
    /// Start the worker and return it with its queue handle.
    pub fn spawn(
        extractor: Arc<PhotoExtractor>,
        store: Arc<dyn Datastore>,
        objects: Arc<dyn ObjectStore>,
        config: &UploadConfig,
    ) -> (Self, ExtractionQueue) {
        let (tx, mut rx) = mpsc::unbounded_channel::<ExtractionJob>();
        let semaphore = Arc::new(Semaphore::new(config.extraction_concurrency.max(1)));
        let retry_limit = config.extraction_retry_limit;

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break, // semaphore closed, shutting down
                };
                let extractor = extractor.clone();
                let store = store.clone();
                let objects = objects.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    process_job(job, extractor, store, objects, retry_limit).await;
                });
            }
        });

        (Self { handle }, ExtractionQueue { tx })
    }

    /// Abort the dispatcher. In-flight jobs finish on their own tasks.
    pub fn shutdown(self) {
        self.handle.abort();
    }
}

/// Run one extraction job to a terminal artifact status.
async fn process_job(
    job: ExtractionJob,
    extractor: Arc<PhotoExtractor>,
    store: Arc<dyn Datastore>,
    objects: Arc<dyn ObjectStore>,
    retry_limit: u32,
) {
    let artifact_id = job.artifact_id;

    let artifact = match store.get_artifact(artifact_id).await {
        Ok(a) => a,
        Err(e) => {
            warn!(%artifact_id, error = %e, "extraction job for unknown artifact");
            return;
        }
    };

    // Claim the job; losing the claim means another path already owns it.
    if store
        .update_artifact_extraction(artifact_id, ExtractionStatus::Processing, None)
        .await
        .is_err()
    {
        debug!(%artifact_id, "artifact already claimed, skipping");
        return;
    }

    let url = objects.url_for(&artifact.storage_pointer);

    // Retry while the model yields a degraded envelope; keep the last one
    // so partial fields still reach the run.
    let mut envelope = extractor.extract(&url, &artifact_id.to_string()).await;
    let mut attempt = 0;
    while envelope.validation_error.is_some() && attempt < retry_limit {
        attempt += 1;
        debug!(%artifact_id, attempt, "extraction degraded, retrying");
        envelope = extractor.extract(&url, &artifact_id.to_string()).await;
    }

    let result = store
        .update_artifact_extraction(artifact_id, ExtractionStatus::Completed, Some(envelope))
        .await;

    if let Err(e) = result {
        warn!(%artifact_id, error = %e, "failed to record extraction result");
        let _ = store
            .update_artifact_extraction(artifact_id, ExtractionStatus::Failed, None)
            .await;
    }
}
