//! In-memory datastore and object store.
//!
//! Backing maps live behind `parking_lot` locks; every method takes the lock
//! for the shortest possible span. The CAS contract of
//! [`Datastore::transition_run`] holds because the read-check-write happens
//! under one write lock.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use precheck_core::{
    Appraisal, Artifact, ExtractionStatus, LedgerEvent, PipelineRun, RunOutputs, RunStatus,
    VisionEnvelope,
};

use super::{extraction_transition_legal, Datastore, ObjectStore, StoreError};

#[derive(Default)]
struct Tables {
    appraisals: HashMap<Uuid, Appraisal>,
    short_codes: HashMap<String, Uuid>,
    runs: HashMap<Uuid, PipelineRun>,
    idempotency_keys: HashMap<String, Uuid>,
    ledger: Vec<LedgerEvent>,
    artifacts: HashMap<Uuid, Artifact>,
}

/// In-memory [`Datastore`] implementation.
#[derive(Default, Clone)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total ledger rows across all runs. Test hook for append-only checks.
    pub fn ledger_len(&self) -> usize {
        self.tables.read().ledger.len()
    }
}

#[async_trait]
impl Datastore for MemoryStore {
    async fn insert_appraisal(&self, appraisal: Appraisal) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if tables.short_codes.contains_key(&appraisal.short_code) {
            return Err(StoreError::UniqueViolation {
                constraint: "appraisals.short_code",
            });
        }
        if tables.appraisals.contains_key(&appraisal.id) {
            return Err(StoreError::UniqueViolation {
                constraint: "appraisals.id",
            });
        }
        tables
            .short_codes
            .insert(appraisal.short_code.clone(), appraisal.id);
        tables.appraisals.insert(appraisal.id, appraisal);
        Ok(())
    }

    async fn get_appraisal(&self, id: Uuid) -> Result<Appraisal, StoreError> {
        self.tables
            .read()
            .appraisals
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound {
                entity: "appraisal",
            })
    }

    async fn find_appraisal_by_short_code(
        &self,
        code: &str,
    ) -> Result<Option<Appraisal>, StoreError> {
        let tables = self.tables.read();
        Ok(tables
            .short_codes
            .get(&code.to_ascii_uppercase())
            .and_then(|id| tables.appraisals.get(id))
            .cloned())
    }

    async fn set_latest_run(&self, appraisal_id: Uuid, run_id: Uuid) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let belongs = tables
            .runs
            .get(&run_id)
            .map(|r| r.appraisal_id == appraisal_id)
            .unwrap_or(false);
        if !belongs {
            return Err(StoreError::ForeignKey {
                reference: "appraisals.latest_run_id",
            });
        }
        let appraisal = tables
            .appraisals
            .get_mut(&appraisal_id)
            .ok_or(StoreError::NotFound {
                entity: "appraisal",
            })?;
        appraisal.latest_run_id = Some(run_id);
        Ok(())
    }

    async fn insert_run(&self, run: PipelineRun) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if !tables.appraisals.contains_key(&run.appraisal_id) {
            return Err(StoreError::ForeignKey {
                reference: "pipeline_runs.appraisal_id",
            });
        }
        if tables.idempotency_keys.contains_key(&run.idempotency_key) {
            return Err(StoreError::UniqueViolation {
                constraint: "pipeline_runs.idempotency_key",
            });
        }
        tables
            .idempotency_keys
            .insert(run.idempotency_key.clone(), run.id);
        tables.runs.insert(run.id, run);
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<PipelineRun, StoreError> {
        self.tables
            .read()
            .runs
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { entity: "run" })
    }

    async fn find_run_by_key(&self, key: &str) -> Result<Option<PipelineRun>, StoreError> {
        let tables = self.tables.read();
        Ok(tables
            .idempotency_keys
            .get(key)
            .and_then(|id| tables.runs.get(id))
            .cloned())
    }

    async fn transition_run(
        &self,
        id: Uuid,
        from: RunStatus,
        to: RunStatus,
        outputs: Option<RunOutputs>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write();
        let run = tables
            .runs
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "run" })?;

        if run.status != from {
            return Ok(false);
        }
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                from: format!("{from:?}"),
                to: format!("{to:?}"),
            });
        }

        run.status = to;
        match to {
            RunStatus::Running => run.started_at = Some(Utc::now()),
            RunStatus::Completed | RunStatus::Failed => {
                run.completed_at = Some(Utc::now());
                if outputs.is_some() {
                    run.outputs = outputs;
                }
            }
            RunStatus::Pending => {}
        }
        Ok(true)
    }

    async fn list_runs(&self, appraisal_id: Uuid) -> Result<Vec<PipelineRun>, StoreError> {
        let mut runs: Vec<PipelineRun> = self
            .tables
            .read()
            .runs
            .values()
            .filter(|r| r.appraisal_id == appraisal_id)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn append_ledger_event(&self, event: LedgerEvent) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if !tables.runs.contains_key(&event.run_id) {
            return Err(StoreError::ForeignKey {
                reference: "ledger_events.run_id",
            });
        }
        tables.ledger.push(event);
        Ok(())
    }

    async fn ledger_events_for_run(&self, run_id: Uuid) -> Result<Vec<LedgerEvent>, StoreError> {
        let mut events: Vec<LedgerEvent> = self
            .tables
            .read()
            .ledger
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.recorded_at);
        Ok(events)
    }

    async fn ledger_events_for_appraisal(
        &self,
        appraisal_id: Uuid,
    ) -> Result<Vec<LedgerEvent>, StoreError> {
        let mut events: Vec<LedgerEvent> = self
            .tables
            .read()
            .ledger
            .iter()
            .filter(|e| e.appraisal_id == appraisal_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.recorded_at);
        Ok(events)
    }

    async fn insert_artifact(&self, artifact: Artifact) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if !tables.appraisals.contains_key(&artifact.appraisal_id) {
            return Err(StoreError::ForeignKey {
                reference: "artifacts.appraisal_id",
            });
        }
        tables.artifacts.insert(artifact.id, artifact);
        Ok(())
    }

    async fn get_artifact(&self, id: Uuid) -> Result<Artifact, StoreError> {
        self.tables
            .read()
            .artifacts
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { entity: "artifact" })
    }

    async fn list_artifacts(&self, appraisal_id: Uuid) -> Result<Vec<Artifact>, StoreError> {
        let mut artifacts: Vec<Artifact> = self
            .tables
            .read()
            .artifacts
            .values()
            .filter(|a| a.appraisal_id == appraisal_id)
            .cloned()
            .collect();
        artifacts.sort_by_key(|a| a.uploaded_at);
        Ok(artifacts)
    }

    async fn update_artifact_extraction(
        &self,
        id: Uuid,
        status: ExtractionStatus,
        vision_output: Option<VisionEnvelope>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let artifact = tables
            .artifacts
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "artifact" })?;

        if !extraction_transition_legal(artifact.extraction_status, status) {
            return Err(StoreError::InvalidTransition {
                from: format!("{:?}", artifact.extraction_status),
                to: format!("{status:?}"),
            });
        }

        artifact.extraction_status = status;
        if status == ExtractionStatus::Completed {
            artifact.vision_output = vision_output;
        }
        Ok(())
    }
}

/// In-memory [`ObjectStore`] implementation.
#[derive(Default, Clone)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<HashMap<String, (Vec<u8>, String)>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StoreError> {
        self.objects
            .write()
            .insert(key.to_string(), (bytes, content_type.to_string()));
        Ok(key.to_string())
    }

    async fn get(&self, pointer: &str) -> Result<Vec<u8>, StoreError> {
        self.objects
            .read()
            .get(pointer)
            .map(|(bytes, _)| bytes.clone())
            .ok_or(StoreError::NotFound { entity: "object" })
    }

    fn url_for(&self, pointer: &str) -> String {
        format!("memory://{pointer}")
    }
}
