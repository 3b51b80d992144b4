//! Persistence seams: the relational datastore and object storage.
//!
//! The pipeline consumes narrow trait interfaces; the traits promise typed
//! row read/write, unique-constraint enforcement for idempotency keys and
//! short codes, referential integrity, and compare-and-set status
//! transitions. [`MemoryStore`] is the in-process implementation used by
//! tests and the CLI; a database-backed implementation slots in behind the
//! same traits.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use precheck_core::{
    Appraisal, Artifact, ExtractionStatus, LedgerEvent, PipelineRun, RunOutputs, RunStatus,
    VisionEnvelope,
};

mod memory;

pub use memory::{MemoryObjectStore, MemoryStore};

/// Errors from persistence operations.
///
/// Datastore write failures are fatal to a run (`PersistenceError` in the
/// taxonomy); callers translate them accordingly.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("{entity} not found")]
    NotFound { entity: &'static str },

    #[error("unique constraint violated: {constraint}")]
    UniqueViolation { constraint: &'static str },

    #[error("referential integrity violated: {reference}")]
    ForeignKey { reference: &'static str },

    #[error("illegal transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Typed row access to the relational datastore.
#[async_trait]
pub trait Datastore: Send + Sync {
    // -- appraisals ---------------------------------------------------------

    /// Insert a new appraisal. Fails on short-code collision.
    async fn insert_appraisal(&self, appraisal: Appraisal) -> Result<(), StoreError>;

    async fn get_appraisal(&self, id: Uuid) -> Result<Appraisal, StoreError>;

    /// Look up an appraisal by its 4-character reference code.
    async fn find_appraisal_by_short_code(
        &self,
        code: &str,
    ) -> Result<Option<Appraisal>, StoreError>;

    /// Point the appraisal at its latest run. The run must belong to the
    /// appraisal; anything else is a referential-integrity error.
    async fn set_latest_run(&self, appraisal_id: Uuid, run_id: Uuid) -> Result<(), StoreError>;

    // -- pipeline runs ------------------------------------------------------

    /// Insert a new run. Fails if the idempotency key is already taken.
    async fn insert_run(&self, run: PipelineRun) -> Result<(), StoreError>;

    async fn get_run(&self, id: Uuid) -> Result<PipelineRun, StoreError>;

    async fn find_run_by_key(&self, key: &str) -> Result<Option<PipelineRun>, StoreError>;

    /// Compare-and-set the run status: the transition happens only when the
    /// current status equals `from` and `from → to` is legal. Returns true
    /// when the transition was applied. Timestamps and outputs are updated
    /// atomically with the status.
    async fn transition_run(
        &self,
        id: Uuid,
        from: RunStatus,
        to: RunStatus,
        outputs: Option<RunOutputs>,
    ) -> Result<bool, StoreError>;

    async fn list_runs(&self, appraisal_id: Uuid) -> Result<Vec<PipelineRun>, StoreError>;

    // -- ledger -------------------------------------------------------------

    /// Append one ledger event. Events are write-once; there is no update.
    async fn append_ledger_event(&self, event: LedgerEvent) -> Result<(), StoreError>;

    /// Events for one run, in chronological order.
    async fn ledger_events_for_run(&self, run_id: Uuid) -> Result<Vec<LedgerEvent>, StoreError>;

    /// Events across all runs of an appraisal, in chronological order.
    async fn ledger_events_for_appraisal(
        &self,
        appraisal_id: Uuid,
    ) -> Result<Vec<LedgerEvent>, StoreError>;

    // -- artifacts ----------------------------------------------------------

    async fn insert_artifact(&self, artifact: Artifact) -> Result<(), StoreError>;

    async fn get_artifact(&self, id: Uuid) -> Result<Artifact, StoreError>;

    async fn list_artifacts(&self, appraisal_id: Uuid) -> Result<Vec<Artifact>, StoreError>;

    /// Advance an artifact's extraction status, optionally attaching the
    /// vision output. Transitions must move forward; terminal states are
    /// never exited.
    async fn update_artifact_extraction(
        &self,
        id: Uuid,
        status: ExtractionStatus,
        vision_output: Option<VisionEnvelope>,
    ) -> Result<(), StoreError>;
}

/// Object storage: put/get by key, yielding an addressable pointer.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store bytes under a key; returns the storage pointer.
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StoreError>;

    /// Fetch bytes by pointer.
    async fn get(&self, pointer: &str) -> Result<Vec<u8>, StoreError>;

    /// Addressable URL for a pointer, suitable for handing to the vision
    /// model. The in-memory store produces `memory://` URLs.
    fn url_for(&self, pointer: &str) -> String;
}

/// Whether `from → to` is a legal extraction-status advance.
pub(crate) fn extraction_transition_legal(from: ExtractionStatus, to: ExtractionStatus) -> bool {
    use ExtractionStatus::*;
    matches!(
        (from, to),
        (Pending, Processing) | (Processing, Completed) | (Processing, Failed) | (Pending, Failed)
    )
}
