//! End-to-end pipeline behavior: idempotency, monotonic status, ledger
//! durability under failure, retrieval degradation, and the three worked
//! scoring scenarios.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use precheck_core::{DecisionStatus, HistoricalContext, RunStatus, VehicleMetadata};
use precheck_runtime::{
    ChatMessage, CompletionConfig, CompletionResponse, EmbeddingModel, Pipeline, ProviderError,
    RuntimeConfig, TextModel, UnavailableIndex, VisionModel,
};

// ---------------------------------------------------------------------------
// Scripted providers
// ---------------------------------------------------------------------------

/// Vision model that hands out scripted envelopes, one per distinct photo
/// id, remembering the assignment so retries see identical output.
struct ScriptedVision {
    scripts: Mutex<VecDeque<Value>>,
    assigned: Mutex<HashMap<String, Value>>,
    calls: AtomicUsize,
}

impl ScriptedVision {
    fn new(scripts: Vec<Value>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            assigned: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    fn photo_id_from(messages: &[ChatMessage]) -> Option<String> {
        messages.iter().rev().find_map(|m| {
            m.text()
                .split("Photo ID: ")
                .nth(1)
                .map(|rest| rest.split_whitespace().next().unwrap_or("").to_string())
        })
    }
}

#[async_trait]
impl VisionModel for ScriptedVision {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        _config: &CompletionConfig,
    ) -> Result<CompletionResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let photo_id = Self::photo_id_from(&messages).unwrap_or_default();

        let mut assigned = self.assigned.lock();
        let payload = assigned
            .entry(photo_id.clone())
            .or_insert_with(|| {
                let mut payload = self.scripts.lock().pop_front().unwrap_or_else(|| {
                    json!({
                        "photo_id": "",
                        "extraction": {
                            "photo_angle": {"angle": "unknown", "confidence": 0.0},
                            "odometer": {"value": null, "unit": null, "confidence": 0.0},
                            "vin": {"text": null, "confidence": 0.0},
                            "damage": []
                        }
                    })
                });
                payload["photo_id"] = json!(photo_id);
                payload
            })
            .clone();

        Ok(CompletionResponse {
            content: payload.to_string(),
            model: "scripted-vision".to_string(),
        })
    }

    fn name(&self) -> &str {
        "scripted-vision"
    }
}

/// Text model that returns one canned risk-scan payload.
struct CannedRisk(Value);

#[async_trait]
impl TextModel for CannedRisk {
    async fn complete(
        &self,
        _messages: Vec<ChatMessage>,
        _config: &CompletionConfig,
    ) -> Result<CompletionResponse, ProviderError> {
        Ok(CompletionResponse {
            content: self.0.to_string(),
            model: "canned-risk".to_string(),
        })
    }

    fn name(&self) -> &str {
        "canned-risk"
    }
}

/// Text model that always fails; exercises retry-then-unavailable.
struct FailingText;

#[async_trait]
impl TextModel for FailingText {
    async fn complete(
        &self,
        _messages: Vec<ChatMessage>,
        _config: &CompletionConfig,
    ) -> Result<CompletionResponse, ProviderError> {
        Err(ProviderError::HttpError("connection reset".to_string()))
    }

    fn name(&self) -> &str {
        "failing-text"
    }
}

struct StaticEmbedder;

#[async_trait]
impl EmbeddingModel for StaticEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(vec![0.1, 0.2, 0.3, 0.4])
    }

    fn name(&self) -> &str {
        "static-embedder"
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn test_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.controller.run_budget = Duration::from_secs(60);
    config.controller.tool_timeout = Duration::from_secs(10);
    config.controller.extraction_wait = Duration::from_secs(5);
    config.retrieval.embedding_dim = 4;
    config
}

fn angle_payload(angle: &str, confidence: f64) -> Value {
    json!({
        "photo_id": "",
        "extraction": {
            "photo_angle": {"angle": angle, "confidence": confidence},
            "odometer": {"value": null, "unit": null, "confidence": 0.0},
            "vin": {"text": null, "confidence": 0.0},
            "damage": []
        }
    })
}

fn full_coverage_scripts() -> Vec<Value> {
    let mut scripts = vec![
        angle_payload("front", 1.0),
        angle_payload("rear", 1.0),
        angle_payload("left", 1.0),
        angle_payload("right", 1.0),
        angle_payload("interior", 1.0),
    ];
    // Odometer close-up carries the reading; the front script above never
    // got the VIN, so attach it to this last one.
    scripts.push(json!({
        "photo_id": "",
        "extraction": {
            "photo_angle": {"angle": "odometer", "confidence": 1.0},
            "odometer": {"value": 42000.0, "unit": "miles", "confidence": 1.0},
            "vin": {"text": "1M8GDM9AXKP042788", "confidence": 1.0},
            "damage": []
        }
    }));
    scripts
}

fn clean_scan() -> Value {
    json!({ "flags": [], "assumptions": [], "unknowns": [] })
}

fn metadata() -> VehicleMetadata {
    VehicleMetadata {
        year: Some(2020),
        make: Some("Toyota".to_string()),
        model: Some("Camry".to_string()),
        mileage: Some(42_000.0),
        vin: Some("1M8GDM9AXKP042788".to_string()),
        ..Default::default()
    }
}

async fn seed_appraisal(
    pipeline: &Pipeline,
    metadata: VehicleMetadata,
    notes: &str,
    photo_count: usize,
) -> Uuid {
    let appraisal = pipeline
        .service
        .create_appraisal(metadata, Some(notes.to_string()))
        .await
        .unwrap();

    for i in 0..photo_count {
        pipeline
            .service
            .upload_artifact(
                &appraisal.id.to_string(),
                format!("photo-bytes-{i}").into_bytes(),
                "image/jpeg",
            )
            .await
            .unwrap();
    }

    appraisal.id
}

async fn run_to_terminal(pipeline: &Pipeline, appraisal_id: Uuid, key: &str) -> precheck_core::PipelineRun {
    let outcome = pipeline
        .service
        .trigger_run(&appraisal_id.to_string(), key)
        .await
        .unwrap();
    pipeline
        .runner
        .wait_for_terminal(outcome.run.id, Duration::from_secs(30))
        .await
        .unwrap()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_evidence_scores_93_and_routes_ready() {
    let pipeline = Pipeline::builder(test_config())
        .vision(Arc::new(ScriptedVision::new(full_coverage_scripts())))
        .text(Arc::new(CannedRisk(clean_scan())))
        .embedder(Arc::new(StaticEmbedder))
        .build()
        .unwrap();

    let notes = "Well maintained fleet vehicle, complete service records, recent tire change, \
                 no accident history, single owner, garage kept, all keys and manuals present.";
    let appraisal_id = seed_appraisal(&pipeline, metadata(), notes, 6).await;
    let run = run_to_terminal(&pipeline, appraisal_id, &Uuid::new_v4().to_string()).await;

    assert_eq!(run.status, RunStatus::Completed);
    let outputs = run.outputs.unwrap();
    assert_eq!(outputs.decision.score, 93);
    assert_eq!(outputs.decision.status, DecisionStatus::Ready);
    assert!(!outputs.incomplete);
    assert_eq!(
        outputs.tools_used,
        vec![
            "extract_vision_evidence",
            "check_evidence_completeness",
            "retrieve_similar_cases",
            "scan_risk",
            "compute_score",
        ]
    );

    let card = outputs.score.unwrap();
    assert_eq!(card.breakdown.angle_coverage.points, 48);
    assert_eq!(card.breakdown.odometer_confidence.points, 15);
    assert_eq!(card.breakdown.identifier_presence.points, 10);
    assert_eq!(card.breakdown.notes_quality.points, 20);

    pipeline.shutdown();
}

#[tokio::test]
async fn sparse_evidence_scores_17_and_escalates() {
    let scripts = vec![
        angle_payload("front", 1.0),
        json!({
            "photo_id": "",
            "extraction": {
                "photo_angle": {"angle": "rear", "confidence": 1.0},
                "odometer": {"value": 42000.0, "unit": "miles", "confidence": 0.2},
                "vin": {"text": null, "confidence": 0.0},
                "damage": []
            }
        }),
    ];
    let risky_scan = json!({
        "flags": [
            {
                "code": "DAMAGE_NOTES_MISMATCH",
                "severity": "high",
                "message": "Notes do not mention the visible rear damage",
                "evidence": [{"kind": "photo", "id": "p1", "description": "rear quarter panel"}]
            },
            {
                "code": "TITLE_GAP",
                "severity": "high",
                "message": "Ownership history has an unexplained gap",
                "evidence": [{"kind": "note", "id": null, "description": "notes section"}]
            }
        ],
        "assumptions": [],
        "unknowns": []
    });

    let pipeline = Pipeline::builder(test_config())
        .vision(Arc::new(ScriptedVision::new(scripts)))
        .text(Arc::new(CannedRisk(risky_scan)))
        .embedder(Arc::new(StaticEmbedder))
        .build()
        .unwrap();

    // No metadata mileage/VIN, so no deterministic consistency flags.
    let appraisal_id =
        seed_appraisal(&pipeline, VehicleMetadata::default(), "barely enough notes", 2).await;
    let run = run_to_terminal(&pipeline, appraisal_id, &Uuid::new_v4().to_string()).await;

    assert_eq!(run.status, RunStatus::Completed);
    let outputs = run.outputs.unwrap();
    assert_eq!(outputs.decision.score, 17);
    assert_eq!(outputs.decision.status, DecisionStatus::Escalate);

    let card = outputs.score.unwrap();
    assert_eq!(card.breakdown.angle_coverage.points, 16);
    assert_eq!(card.breakdown.odometer_confidence.points, 3);
    assert_eq!(card.breakdown.identifier_presence.points, 0);
    assert_eq!(card.breakdown.notes_quality.points, 5);
    assert_eq!(card.breakdown.risk_penalty.points, 7);

    pipeline.shutdown();
}

#[tokio::test]
async fn budget_exhaustion_still_completes_with_best_effort_decision() {
    let mut config = test_config();
    // Room for vision and completeness only; scoring is never reached.
    config.controller.max_iterations = 2;

    let pipeline = Pipeline::builder(config)
        .vision(Arc::new(ScriptedVision::new(full_coverage_scripts())))
        .text(Arc::new(CannedRisk(clean_scan())))
        .embedder(Arc::new(StaticEmbedder))
        .build()
        .unwrap();

    let appraisal_id = seed_appraisal(&pipeline, metadata(), "some quick notes here", 6).await;
    let run = run_to_terminal(&pipeline, appraisal_id, &Uuid::new_v4().to_string()).await;

    assert_eq!(run.status, RunStatus::Completed);
    let outputs = run.outputs.unwrap();
    assert_eq!(outputs.decision.status, DecisionStatus::NeedsMoreEvidence);
    assert!(outputs.incomplete);
    assert!(outputs
        .assumptions
        .iter()
        .any(|a| a.contains("iteration budget exhausted")));

    // The ledger shows the truncated sequence.
    let (events, _) = pipeline
        .service
        .ledger_events(&appraisal_id.to_string())
        .await
        .unwrap();
    let names: Vec<&str> = events.iter().map(|e| e.node_name.as_str()).collect();
    assert_eq!(
        names,
        vec!["extract_vision_evidence", "check_evidence_completeness"]
    );

    pipeline.shutdown();
}

// ---------------------------------------------------------------------------
// Idempotency and status invariants
// ---------------------------------------------------------------------------

#[tokio::test]
async fn replaying_the_same_key_never_executes_twice() {
    let vision = Arc::new(ScriptedVision::new(full_coverage_scripts()));
    let pipeline = Pipeline::builder(test_config())
        .vision(vision.clone())
        .text(Arc::new(CannedRisk(clean_scan())))
        .embedder(Arc::new(StaticEmbedder))
        .build()
        .unwrap();

    let appraisal_id = seed_appraisal(&pipeline, metadata(), "notes for the record", 6).await;
    let key = Uuid::new_v4().to_string();

    let first = run_to_terminal(&pipeline, appraisal_id, &key).await;
    assert_eq!(first.status, RunStatus::Completed);

    let calls_after_first = vision.calls.load(Ordering::SeqCst);
    let (events_before, _) = pipeline
        .service
        .ledger_events(&appraisal_id.to_string())
        .await
        .unwrap();

    // Replay: same run id, stored result, zero new work.
    let replay = pipeline
        .service
        .trigger_run(&appraisal_id.to_string(), &key)
        .await
        .unwrap();
    assert!(!replay.created);
    assert_eq!(replay.run.id, first.id);
    assert_eq!(replay.run.status, RunStatus::Completed);
    assert!(replay.run.outputs.is_some());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(vision.calls.load(Ordering::SeqCst), calls_after_first);
    let (events_after, _) = pipeline
        .service
        .ledger_events(&appraisal_id.to_string())
        .await
        .unwrap();
    assert_eq!(events_before.len(), events_after.len());

    pipeline.shutdown();
}

#[tokio::test]
async fn terminal_runs_stay_terminal() {
    let pipeline = Pipeline::builder(test_config())
        .vision(Arc::new(ScriptedVision::new(full_coverage_scripts())))
        .text(Arc::new(CannedRisk(clean_scan())))
        .embedder(Arc::new(StaticEmbedder))
        .build()
        .unwrap();

    let appraisal_id = seed_appraisal(&pipeline, metadata(), "notes", 6).await;
    let run = run_to_terminal(&pipeline, appraisal_id, &Uuid::new_v4().to_string()).await;
    assert!(run.status.is_terminal());

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let polled = pipeline.service.poll_run(run.id).await.unwrap();
        assert_eq!(polled.run.status, run.status);
        assert_eq!(polled.run.completed_at, run.completed_at);
    }

    pipeline.shutdown();
}

#[tokio::test]
async fn key_bound_to_another_appraisal_is_rejected() {
    let pipeline = Pipeline::builder(test_config())
        .vision(Arc::new(ScriptedVision::new(vec![])))
        .text(Arc::new(CannedRisk(clean_scan())))
        .embedder(Arc::new(StaticEmbedder))
        .build()
        .unwrap();

    let first = seed_appraisal(&pipeline, VehicleMetadata::default(), "notes", 0).await;
    let second = seed_appraisal(&pipeline, VehicleMetadata::default(), "notes", 0).await;

    let key = Uuid::new_v4().to_string();
    pipeline
        .service
        .trigger_run(&first.to_string(), &key)
        .await
        .unwrap();

    let result = pipeline.service.trigger_run(&second.to_string(), &key).await;
    assert!(result.is_err());

    pipeline.shutdown();
}

// ---------------------------------------------------------------------------
// Degradation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_risk_model_degrades_but_ledger_keeps_every_attempt() {
    let pipeline = Pipeline::builder(test_config())
        .vision(Arc::new(ScriptedVision::new(full_coverage_scripts())))
        .text(Arc::new(FailingText))
        .embedder(Arc::new(StaticEmbedder))
        .build()
        .unwrap();

    let notes = "Long, thorough notes describing the vehicle condition in enough detail to \
                 clear the top notes tier for scoring purposes, including service history \
                 with every maintenance receipt attached for review.";
    let appraisal_id = seed_appraisal(&pipeline, metadata(), notes, 6).await;
    let run = run_to_terminal(&pipeline, appraisal_id, &Uuid::new_v4().to_string()).await;

    // Risk scanning failed its retries, but the run still completed with a
    // decision; the degradation is spelled out, not hidden.
    assert_eq!(run.status, RunStatus::Completed);
    let outputs = run.outputs.unwrap();
    assert!(outputs
        .assumptions
        .iter()
        .any(|a| a.contains("scan_risk") && a.contains("unavailable")));
    assert!(outputs.risk.is_none());
    assert_eq!(outputs.decision.score, 93); // no flags could be raised

    // Retry limit 2 → three failed attempts, each with its own entry, and
    // every other invoked tool has at least one entry.
    let (events, summaries) = pipeline
        .service
        .ledger_events(&appraisal_id.to_string())
        .await
        .unwrap();
    let risk_failures = events
        .iter()
        .filter(|e| e.node_name == "scan_risk" && e.error.is_some())
        .count();
    assert_eq!(risk_failures, 3);
    for node in [
        "extract_vision_evidence",
        "check_evidence_completeness",
        "retrieve_similar_cases",
        "compute_score",
    ] {
        assert!(summaries.iter().any(|s| s.node_name == node && s.ok >= 1));
    }

    pipeline.shutdown();
}

#[tokio::test]
async fn unavailable_retrieval_never_fails_the_run() {
    let pipeline = Pipeline::builder(test_config())
        .vision(Arc::new(ScriptedVision::new(full_coverage_scripts())))
        .text(Arc::new(CannedRisk(clean_scan())))
        .embedder(Arc::new(StaticEmbedder))
        .index(Arc::new(UnavailableIndex))
        .build()
        .unwrap();

    let appraisal_id = seed_appraisal(&pipeline, metadata(), "adequate notes provided", 6).await;
    let run = run_to_terminal(&pipeline, appraisal_id, &Uuid::new_v4().to_string()).await;

    assert_eq!(run.status, RunStatus::Completed);
    let outputs = run.outputs.unwrap();
    assert!(!outputs.decision.reasons.is_empty());
    match &outputs.historical_context {
        HistoricalContext::Absent { reason } => assert!(reason.contains("index unavailable")),
        other => panic!("expected absent historical context, got {other:?}"),
    }
    assert!(outputs
        .unknowns
        .iter()
        .any(|u| u.contains("Historical context absent")));

    pipeline.shutdown();
}
