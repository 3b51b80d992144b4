//! Pipeline run state machine.
//!
//! `trigger` is the single entry point and carries the two core contracts:
//! at-most-one execution per idempotency key, and a guaranteed exit from
//! RUNNING on every path: success, failure, even a panic inside the
//! controller. Status moves only through compare-and-set transitions, so a
//! duplicate trigger or a racing worker observes the change and backs off.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use precheck_core::{
    validate_idempotency_key, ContentTag, PipelineRun, RunStatus, ValidationError,
};

use crate::controller::AgentController;
use crate::ledger::Ledger;
use crate::retrieval::{build_query_text, Retriever};
use crate::store::{Datastore, StoreError};

/// Errors surfaced by the state machine.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("idempotency key is already bound to another appraisal")]
    KeyBoundElsewhere,
}

/// Result of a trigger: the run, and whether this call created it.
#[derive(Debug, Clone)]
pub struct TriggerOutcome {
    pub run: PipelineRun,
    pub created: bool,
}

/// Owns run lifecycle: creation, execution, terminal transition.
#[derive(Clone)]
pub struct PipelineRunner {
    store: Arc<dyn Datastore>,
    ledger: Ledger,
    controller: Arc<AgentController>,
    /// When present, completed runs are indexed for future retrieval.
    retriever: Option<Arc<Retriever>>,
}

impl PipelineRunner {
    pub fn new(
        store: Arc<dyn Datastore>,
        ledger: Ledger,
        controller: Arc<AgentController>,
        retriever: Option<Arc<Retriever>>,
    ) -> Self {
        Self {
            store,
            ledger,
            controller,
            retriever,
        }
    }

    /// Trigger a run for `(appraisal_id, idempotency_key)`.
    ///
    /// - key bound to a non-terminal run → that run, unchanged
    /// - key bound to a terminal run → that run with its stored outputs
    /// - otherwise → a new PENDING run, executed on a spawned task
    ///
    /// Callers get the run id immediately and poll for terminal status.
    pub async fn trigger(
        &self,
        appraisal_id: Uuid,
        idempotency_key: &str,
    ) -> Result<TriggerOutcome, RunError> {
        validate_idempotency_key(Some(idempotency_key))?;

        // A duplicate trigger resolves to the existing run; it is never an
        // error and never a second execution.
        if let Some(existing) = self.store.find_run_by_key(idempotency_key).await? {
            if existing.appraisal_id != appraisal_id {
                return Err(RunError::KeyBoundElsewhere);
            }
            info!(run_id = %existing.id, status = ?existing.status, "idempotent replay");
            return Ok(TriggerOutcome {
                run: existing,
                created: false,
            });
        }

        // Verify the appraisal exists before creating anything.
        self.store.get_appraisal(appraisal_id).await?;

        let run = PipelineRun {
            id: Uuid::new_v4(),
            appraisal_id,
            status: RunStatus::Pending,
            idempotency_key: idempotency_key.to_string(),
            outputs: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let run_id = run.id;

        match self.store.insert_run(run.clone()).await {
            Ok(()) => {}
            // Lost a creation race: the winner's run is the one true run.
            Err(StoreError::UniqueViolation { .. }) => {
                let existing = self
                    .store
                    .find_run_by_key(idempotency_key)
                    .await?
                    .ok_or(StoreError::NotFound { entity: "run" })?;
                return Ok(TriggerOutcome {
                    run: existing,
                    created: false,
                });
            }
            Err(e) => return Err(e.into()),
        }

        let runner = self.clone();
        tokio::spawn(async move {
            runner.execute_run(run_id, appraisal_id).await;
        });

        Ok(TriggerOutcome { run, created: true })
    }

    /// Execute one run. Every exit path leaves the run terminal.
    async fn execute_run(&self, run_id: Uuid, appraisal_id: Uuid) {
        // Claim the run. A false CAS means another worker owns it.
        match self
            .store
            .transition_run(run_id, RunStatus::Pending, RunStatus::Running, None)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(%run_id, "run already claimed, skipping execution");
                return;
            }
            Err(e) => {
                error!(%run_id, error = %e, "failed to claim run");
                return;
            }
        }

        let loaded = async {
            let appraisal = self.store.get_appraisal(appraisal_id).await?;
            let artifacts = self.store.list_artifacts(appraisal_id).await?;
            Ok::<_, StoreError>((appraisal, artifacts))
        }
        .await;

        let (appraisal, artifacts) = match loaded {
            Ok(v) => v,
            Err(e) => {
                self.fail_run(run_id, appraisal_id, format!("failed to load evidence: {e}"))
                    .await;
                return;
            }
        };

        // Run the controller on its own task so a panic inside it is a
        // failure we observe, not a run stuck in RUNNING.
        let controller = self.controller.clone();
        let joined = tokio::spawn(async move {
            controller.execute(appraisal, artifacts, run_id).await
        })
        .await;

        match joined {
            Ok(Ok(outputs)) => {
                let transitioned = self
                    .store
                    .transition_run(
                        run_id,
                        RunStatus::Running,
                        RunStatus::Completed,
                        Some(outputs),
                    )
                    .await;
                match transitioned {
                    Ok(true) => {
                        info!(%run_id, "run completed");
                        self.after_completion(run_id, appraisal_id).await;
                    }
                    Ok(false) => warn!(%run_id, "run left RUNNING behind our back"),
                    Err(e) => error!(%run_id, error = %e, "failed to persist outputs"),
                }
            }
            Ok(Err(e)) => {
                self.fail_run(run_id, appraisal_id, e.to_string()).await;
            }
            Err(join_error) => {
                self.fail_run(
                    run_id,
                    appraisal_id,
                    format!("controller crashed: {join_error}"),
                )
                .await;
            }
        }
    }

    /// Mark a run FAILED, capturing the root cause as the final ledger
    /// entry first so the trace explains the failure.
    async fn fail_run(&self, run_id: Uuid, appraisal_id: Uuid, cause: String) {
        error!(%run_id, %cause, "run failed");
        let _ = self
            .ledger
            .append_fail(
                appraisal_id,
                run_id,
                "run_failed",
                serde_json::json!({}),
                cause,
            )
            .await;
        let _ = self
            .store
            .transition_run(run_id, RunStatus::Running, RunStatus::Failed, None)
            .await;
    }

    /// Post-completion bookkeeping: latest-run pointer, then fire-and-forget
    /// retrieval indexing. Neither can fail the finished run.
    async fn after_completion(&self, run_id: Uuid, appraisal_id: Uuid) {
        if let Err(e) = self.store.set_latest_run(appraisal_id, run_id).await {
            warn!(%run_id, error = %e, "failed to update latest-run pointer");
        }

        let Some(retriever) = self.retriever.clone() else {
            return;
        };
        let store = self.store.clone();
        tokio::spawn(async move {
            let Ok(appraisal) = store.get_appraisal(appraisal_id).await else {
                return;
            };
            let text = build_query_text(&appraisal.metadata, appraisal.notes.as_deref(), &[]);
            if text.is_empty() {
                return;
            }
            if let Err(e) = retriever
                .index_text(appraisal_id, Some(run_id), ContentTag::Metadata, &text)
                .await
            {
                warn!(%run_id, error = %e, "post-run embedding indexing failed");
            }
        });
    }

    /// Poll a run's current state.
    pub async fn get_run(&self, run_id: Uuid) -> Result<PipelineRun, RunError> {
        Ok(self.store.get_run(run_id).await?)
    }

    /// Wait (by polling) until a run reaches a terminal status.
    pub async fn wait_for_terminal(
        &self,
        run_id: Uuid,
        timeout: Duration,
    ) -> Result<PipelineRun, RunError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let run = self.store.get_run(run_id).await?;
            if run.status.is_terminal() {
                return Ok(run);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(run);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}
