//! Upstream service surface.
//!
//! Thin callers (a request layer, the CLI) consume these operations:
//! create appraisal, upload evidence, trigger a run, poll, fetch the
//! ledger. Everything here validates before it writes and rejects bad
//! input before a run can exist.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use precheck_core::{
    sanitize_notes, validate_metadata, validate_notes, Appraisal, Artifact, ExtractionStatus,
    LedgerEvent, PipelineRun, RunStatus, ValidationError, VehicleMetadata, SHORT_CODE_ALPHABET,
    SHORT_CODE_LEN,
};

use crate::config::UploadConfig;
use crate::extraction::ExtractionQueue;
use crate::ledger::{summarize, Ledger, NodeSummary};
use crate::run::{PipelineRunner, RunError, TriggerOutcome};
use crate::store::{Datastore, ObjectStore, StoreError};

/// Content types accepted for evidence photos.
const ALLOWED_CONTENT_TYPES: [&str; 4] = ["image/jpeg", "image/jpg", "image/png", "image/webp"];

/// Attempts at generating a collision-free short code before giving up.
const SHORT_CODE_ATTEMPTS: usize = 10;

/// Errors from the service surface.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error("appraisal reference '{0}' not found")]
    UnknownReference(String),

    #[error("could not allocate a unique reference code")]
    ShortCodeExhausted,
}

/// A run plus the failure context a poller needs.
#[derive(Debug, Clone)]
pub struct RunView {
    pub run: PipelineRun,
    /// Last ledger error, populated for FAILED runs.
    pub last_error: Option<String>,
}

/// The pipeline's front door for thin callers.
pub struct AppraisalService {
    store: Arc<dyn Datastore>,
    objects: Arc<dyn ObjectStore>,
    queue: ExtractionQueue,
    runner: PipelineRunner,
    ledger: Ledger,
    upload: UploadConfig,
}

impl AppraisalService {
    pub fn new(
        store: Arc<dyn Datastore>,
        objects: Arc<dyn ObjectStore>,
        queue: ExtractionQueue,
        runner: PipelineRunner,
        ledger: Ledger,
        upload: UploadConfig,
    ) -> Self {
        Self {
            store,
            objects,
            queue,
            runner,
            ledger,
            upload,
        }
    }

    /// Create an appraisal from metadata and notes. Returns the stored
    /// record including its short reference code.
    pub async fn create_appraisal(
        &self,
        metadata: VehicleMetadata,
        notes: Option<String>,
    ) -> Result<Appraisal, ServiceError> {
        validate_metadata(&metadata)?;
        validate_notes(notes.as_deref())?;
        let notes = sanitize_notes(notes.as_deref());

        // Short codes are random; collisions are rare and retried against
        // the store's unique constraint.
        for _ in 0..SHORT_CODE_ATTEMPTS {
            let appraisal = Appraisal {
                id: Uuid::new_v4(),
                short_code: generate_short_code(),
                metadata: metadata.clone(),
                notes: notes.clone(),
                latest_run_id: None,
                created_at: Utc::now(),
            };

            match self.store.insert_appraisal(appraisal.clone()).await {
                Ok(()) => {
                    info!(appraisal_id = %appraisal.id, code = %appraisal.short_code, "appraisal created");
                    return Ok(appraisal);
                }
                Err(StoreError::UniqueViolation {
                    constraint: "appraisals.short_code",
                }) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(ServiceError::ShortCodeExhausted)
    }

    /// Upload one evidence photo. Stores the bytes, inserts the artifact
    /// row, and enqueues background extraction; returns without waiting.
    pub async fn upload_artifact(
        &self,
        appraisal_ref: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<Artifact, ServiceError> {
        let appraisal = self.resolve_reference(appraisal_ref).await?;

        let content_type = normalize_content_type(content_type);
        if !ALLOWED_CONTENT_TYPES.contains(&content_type.as_str()) {
            return Err(ValidationError::UnsupportedContentType(content_type).into());
        }
        if bytes.len() as u64 > self.upload.max_artifact_bytes {
            return Err(ValidationError::ArtifactTooLarge {
                size: bytes.len() as u64,
                max: self.upload.max_artifact_bytes,
            }
            .into());
        }

        let existing = self.store.list_artifacts(appraisal.id).await?;
        if existing.len() >= self.upload.max_artifacts {
            return Err(ValidationError::TooManyArtifacts {
                max: self.upload.max_artifacts,
            }
            .into());
        }

        let content_hash = hash_bytes(&bytes);
        if existing.iter().any(|a| a.content_hash == content_hash) {
            return Err(ValidationError::DuplicateArtifact.into());
        }

        let artifact_id = Uuid::new_v4();
        let key = format!("appraisals/{}/{artifact_id}", appraisal.id);
        let size_bytes = bytes.len() as u64;
        let pointer = self.objects.put(&key, bytes, &content_type).await?;

        let artifact = Artifact {
            id: artifact_id,
            appraisal_id: appraisal.id,
            storage_pointer: pointer,
            content_type,
            size_bytes,
            content_hash,
            extraction_status: ExtractionStatus::Pending,
            vision_output: None,
            uploaded_at: Utc::now(),
        };
        self.store.insert_artifact(artifact.clone()).await?;

        self.queue.enqueue(artifact_id);
        info!(%artifact_id, appraisal_id = %appraisal.id, "artifact uploaded, extraction queued");

        Ok(artifact)
    }

    /// Trigger the pipeline. Replays of the same idempotency key return the
    /// existing run without a second execution.
    pub async fn trigger_run(
        &self,
        appraisal_ref: &str,
        idempotency_key: &str,
    ) -> Result<TriggerOutcome, ServiceError> {
        let appraisal = self.resolve_reference(appraisal_ref).await?;
        Ok(self.runner.trigger(appraisal.id, idempotency_key).await?)
    }

    /// Poll one run; FAILED runs expose the last ledger error.
    pub async fn poll_run(&self, run_id: Uuid) -> Result<RunView, ServiceError> {
        let run = self.runner.get_run(run_id).await?;

        let last_error = if run.status == RunStatus::Failed {
            self.ledger
                .events_for_run(run_id)
                .await?
                .iter()
                .rev()
                .find_map(|e| e.error.clone())
        } else {
            None
        };

        Ok(RunView { run, last_error })
    }

    /// All runs for an appraisal, oldest first.
    pub async fn list_runs(&self, appraisal_ref: &str) -> Result<Vec<PipelineRun>, ServiceError> {
        let appraisal = self.resolve_reference(appraisal_ref).await?;
        Ok(self.store.list_runs(appraisal.id).await?)
    }

    /// Chronological ledger for an appraisal, plus per-node summaries.
    pub async fn ledger_events(
        &self,
        appraisal_ref: &str,
    ) -> Result<(Vec<LedgerEvent>, Vec<NodeSummary>), ServiceError> {
        let appraisal = self.resolve_reference(appraisal_ref).await?;
        let events = self.ledger.events_for_appraisal(appraisal.id).await?;
        let summaries = summarize(&events);
        Ok((events, summaries))
    }

    /// Artifacts for an appraisal with their extraction status.
    pub async fn list_artifacts(&self, appraisal_ref: &str) -> Result<Vec<Artifact>, ServiceError> {
        let appraisal = self.resolve_reference(appraisal_ref).await?;
        Ok(self.store.list_artifacts(appraisal.id).await?)
    }

    /// Resolve a 4-character short code or a UUID to the appraisal.
    pub async fn resolve_reference(&self, reference: &str) -> Result<Appraisal, ServiceError> {
        if reference.len() == SHORT_CODE_LEN {
            if let Some(appraisal) = self.store.find_appraisal_by_short_code(reference).await? {
                return Ok(appraisal);
            }
        }
        if let Ok(id) = Uuid::parse_str(reference) {
            if let Ok(appraisal) = self.store.get_appraisal(id).await {
                return Ok(appraisal);
            }
        }
        Err(ServiceError::UnknownReference(reference.to_string()))
    }
}

/// Random 4-character code from the unambiguous alphabet.
fn generate_short_code() -> String {
    let mut rng = rand::thread_rng();
    (0..SHORT_CODE_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..SHORT_CODE_ALPHABET.len());
            SHORT_CODE_ALPHABET[idx] as char
        })
        .collect()
}

/// Content hash for duplicate detection.
fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// `image/jpg` and `image/jpeg` are the same thing.
fn normalize_content_type(content_type: &str) -> String {
    let lower = content_type.to_ascii_lowercase();
    if lower == "image/jpg" {
        "image/jpeg".to_string()
    } else {
        lower
    }
}
