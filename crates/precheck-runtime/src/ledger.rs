//! Audit ledger: one append-only event per tool invocation.
//!
//! The ledger is the authoritative execution trace. Every adapter call,
//! successful or failed, lands here, so a run can be reconstructed from
//! the ledger alone without consulting any other state.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use precheck_core::{EventStatus, LedgerEvent};

use crate::store::{Datastore, StoreError};

/// Schema version stamped on every event this writer produces.
pub const LEDGER_SCHEMA_VERSION: &str = "v1";

/// Append-only writer and reader over the datastore's ledger table.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn Datastore>,
}

impl Ledger {
    pub fn new(store: Arc<dyn Datastore>) -> Self {
        Self { store }
    }

    /// Append one event. `input_refs` should hold pointers to the evidence
    /// consumed (artifact ids, context keys), never the evidence itself.
    #[allow(clippy::too_many_arguments)]
    pub async fn append(
        &self,
        appraisal_id: Uuid,
        run_id: Uuid,
        node_name: &str,
        input_refs: serde_json::Value,
        output: Option<serde_json::Value>,
        confidence_summary: Option<serde_json::Value>,
        status: EventStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        debug!(%run_id, node = node_name, ?status, "ledger append");
        self.store
            .append_ledger_event(LedgerEvent {
                id: Uuid::new_v4(),
                appraisal_id,
                run_id,
                node_name: node_name.to_string(),
                schema_version: LEDGER_SCHEMA_VERSION.to_string(),
                input_refs,
                output,
                confidence_summary,
                status,
                error,
                recorded_at: Utc::now(),
            })
            .await
    }

    /// Append a successful invocation.
    pub async fn append_ok(
        &self,
        appraisal_id: Uuid,
        run_id: Uuid,
        node_name: &str,
        input_refs: serde_json::Value,
        output: serde_json::Value,
        confidence_summary: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        self.append(
            appraisal_id,
            run_id,
            node_name,
            input_refs,
            Some(output),
            confidence_summary,
            EventStatus::Ok,
            None,
        )
        .await
    }

    /// Append a failed invocation with its error text.
    pub async fn append_fail(
        &self,
        appraisal_id: Uuid,
        run_id: Uuid,
        node_name: &str,
        input_refs: serde_json::Value,
        error: impl Into<String>,
    ) -> Result<(), StoreError> {
        self.append(
            appraisal_id,
            run_id,
            node_name,
            input_refs,
            None,
            None,
            EventStatus::Fail,
            Some(error.into()),
        )
        .await
    }

    /// Chronologically ordered events for a run.
    pub async fn events_for_run(&self, run_id: Uuid) -> Result<Vec<LedgerEvent>, StoreError> {
        self.store.ledger_events_for_run(run_id).await
    }

    /// Chronologically ordered events across all of an appraisal's runs.
    pub async fn events_for_appraisal(
        &self,
        appraisal_id: Uuid,
    ) -> Result<Vec<LedgerEvent>, StoreError> {
        self.store.ledger_events_for_appraisal(appraisal_id).await
    }
}

/// Per-node outcome summary derived from a run's events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub node_name: String,
    pub ok: usize,
    pub failed: usize,
    pub last_status: EventStatus,
    pub last_error: Option<String>,
}

/// Fold chronologically ordered events into per-node summaries, in order of
/// each node's first appearance.
pub fn summarize(events: &[LedgerEvent]) -> Vec<NodeSummary> {
    let mut order: Vec<String> = Vec::new();
    let mut by_node: std::collections::HashMap<String, NodeSummary> =
        std::collections::HashMap::new();

    for event in events {
        let summary = by_node
            .entry(event.node_name.clone())
            .or_insert_with(|| {
                order.push(event.node_name.clone());
                NodeSummary {
                    node_name: event.node_name.clone(),
                    ok: 0,
                    failed: 0,
                    last_status: event.status,
                    last_error: None,
                }
            });
        match event.status {
            EventStatus::Ok => summary.ok += 1,
            EventStatus::Fail => summary.failed += 1,
        }
        summary.last_status = event.status;
        summary.last_error = event.error.clone();
    }

    order
        .into_iter()
        .filter_map(|name| by_node.remove(&name))
        .collect()
}
