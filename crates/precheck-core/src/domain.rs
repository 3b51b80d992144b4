//! Domain records persisted by the pipeline.
//!
//! These types are the durable vocabulary of the system: appraisals,
//! pipeline runs, ledger events, uploaded artifacts, and embedding records.
//! Everything here is plain data with serde derives; behavior lives in the
//! scoring, policy, and runtime layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Alphabet for short reference codes: uppercase letters and digits with
/// the ambiguous I, O, 0, 1 removed.
pub const SHORT_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of a short reference code.
pub const SHORT_CODE_LEN: usize = 4;

/// Structured vehicle metadata supplied at appraisal creation.
///
/// All fields are optional; bounds are enforced by
/// [`crate::validation::validate_metadata`] before anything is persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VehicleMetadata {
    pub year: Option<i32>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub trim: Option<String>,
    pub mileage: Option<f64>,
    pub color: Option<String>,
    pub vin: Option<String>,
}

/// An appraisal submission. Never deleted; only `latest_run_id` mutates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appraisal {
    pub id: Uuid,

    /// Human-facing 4-character reference code, unique and immutable.
    pub short_code: String,

    pub metadata: VehicleMetadata,

    /// Free-text submitter notes, sanitized and length-bounded.
    pub notes: Option<String>,

    /// Latest pipeline run for this appraisal, if any. When set it must
    /// reference a run whose `appraisal_id` is this appraisal.
    pub latest_run_id: Option<Uuid>,

    pub created_at: DateTime<Utc>,
}

/// Lifecycle state of a pipeline run.
///
/// Transitions are monotonic: Pending → Running → {Completed | Failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    /// Whether this state is terminal (never exited once reached).
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }
}

/// Schema version written into every run's outputs payload.
pub const OUTPUTS_VERSION: &str = "v1";

/// One execution of the evidence-validation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub appraisal_id: Uuid,
    pub status: RunStatus,

    /// Caller-supplied token; globally unique. At most one run per key.
    pub idempotency_key: String,

    /// Versioned outputs payload, present once the run is terminal.
    pub outputs: Option<RunOutputs>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Final, versioned output of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutputs {
    /// Outputs schema version; allows evolution without invalidating
    /// historical runs.
    pub version: String,

    pub decision: crate::policy::Decision,

    /// Scoring breakdown, absent when the run ended before scoring.
    pub score: Option<crate::scoring::ScoreCard>,

    pub completeness: Option<crate::completeness::CompletenessReport>,

    pub risk: Option<RiskScan>,

    /// Whether historical context was available to the run.
    pub historical_context: HistoricalContext,

    /// Explicit assumptions made while producing the decision.
    pub assumptions: Vec<String>,

    /// Factors the run could not determine.
    pub unknowns: Vec<String>,

    /// True when budgets expired before the tool sequence finished.
    pub incomplete: bool,

    /// Capabilities invoked, in order.
    pub tools_used: Vec<String>,
}

/// Tagged availability of retrieved historical context.
///
/// Callers branch on this explicitly; absence is a state, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum HistoricalContext {
    Available { cases: Vec<SimilarCase> },
    Absent { reason: String },
}

impl HistoricalContext {
    pub fn is_available(&self) -> bool {
        matches!(self, HistoricalContext::Available { .. })
    }
}

/// A historical appraisal matched by similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarCase {
    pub rank: usize,
    pub similarity: f64,
    pub metadata: VehicleMetadata,
    pub matched_text: String,
    /// Outcome of that appraisal's latest run, when one exists.
    pub historical_outcome: Option<serde_json::Value>,
}

/// Outcome status of a single ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Ok,
    Fail,
}

/// One append-only audit record per tool invocation.
///
/// Write-once: never updated or deleted. Ordering by `recorded_at`
/// reconstructs the full execution trace, including failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub id: Uuid,
    pub appraisal_id: Uuid,
    pub run_id: Uuid,

    /// Which capability (or lifecycle node) produced this entry.
    pub node_name: String,

    pub schema_version: String,

    /// Pointers to the evidence consumed: references, never copies.
    pub input_refs: serde_json::Value,

    pub output: Option<serde_json::Value>,
    pub confidence_summary: Option<serde_json::Value>,
    pub status: EventStatus,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Vision-extraction lifecycle of an uploaded artifact.
///
/// Advances monotonically; terminal states never revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ExtractionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExtractionStatus::Completed | ExtractionStatus::Failed)
    }
}

/// An uploaded evidence photo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub appraisal_id: Uuid,

    /// Addressable pointer into object storage.
    pub storage_pointer: String,

    pub content_type: String,
    pub size_bytes: u64,

    /// Content hash used for duplicate-upload detection.
    pub content_hash: String,

    pub extraction_status: ExtractionStatus,

    /// Set exactly once, when extraction completes.
    pub vision_output: Option<VisionEnvelope>,

    pub uploaded_at: DateTime<Utc>,
}

/// Content classification for an embedding record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentTag {
    Metadata,
    Notes,
    VisionSummary,
    RiskFlags,
}

/// A stored embedding; read-only after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: Uuid,
    pub appraisal_id: Uuid,
    pub run_id: Option<Uuid>,
    pub content_tag: ContentTag,
    pub source_text: String,
    pub vector: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Vision payloads
// ---------------------------------------------------------------------------

/// Photo angle classification produced by the vision model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhotoAngle {
    Front,
    Rear,
    Left,
    Right,
    Interior,
    Odometer,
    Vin,
    Damage,
    Unknown,
}

impl PhotoAngle {
    pub fn as_str(self) -> &'static str {
        match self {
            PhotoAngle::Front => "front",
            PhotoAngle::Rear => "rear",
            PhotoAngle::Left => "left",
            PhotoAngle::Right => "right",
            PhotoAngle::Interior => "interior",
            PhotoAngle::Odometer => "odometer",
            PhotoAngle::Vin => "vin",
            PhotoAngle::Damage => "damage",
            PhotoAngle::Unknown => "unknown",
        }
    }
}

/// The canonical checklist of angles a complete appraisal must cover.
pub const REQUIRED_ANGLES: [PhotoAngle; 6] = [
    PhotoAngle::Front,
    PhotoAngle::Rear,
    PhotoAngle::Left,
    PhotoAngle::Right,
    PhotoAngle::Interior,
    PhotoAngle::Odometer,
];

/// Distance unit reported with an odometer reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceUnit {
    Miles,
    Km,
}

/// Angle classification with its confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AngleReading {
    pub angle: PhotoAngle,
    pub confidence: f64,
}

/// Odometer reading extracted from a photo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OdometerReading {
    pub value: Option<f64>,
    pub unit: Option<DistanceUnit>,
    pub confidence: f64,
}

/// Vehicle identifier (VIN) extracted from a photo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VinReading {
    pub text: Option<String>,
    pub confidence: f64,
}

/// A single damage observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DamageObservation {
    pub description: Option<String>,
    pub severity: Option<String>,
    pub confidence: f64,
}

/// Structured extraction for one photo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionExtraction {
    pub photo_angle: AngleReading,
    pub odometer: OdometerReading,
    pub vin: VinReading,
    #[serde(default)]
    pub damage: Vec<DamageObservation>,
}

/// Top-level vision payload for one photo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionEnvelope {
    pub photo_id: String,
    pub extraction: VisionExtraction,

    /// Warnings from plausibility checks (implausible odometer, bad VIN).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plausibility_warnings: Vec<String>,

    /// Present when the model never produced a schema-valid payload and the
    /// envelope was degraded to all-unknown fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_error: Option<String>,
}

impl VisionEnvelope {
    /// Minimal valid envelope with zero-confidence fields, used when
    /// extraction fails outright rather than failing the whole photo.
    pub fn degraded(photo_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            photo_id: photo_id.into(),
            extraction: VisionExtraction {
                photo_angle: AngleReading {
                    angle: PhotoAngle::Unknown,
                    confidence: 0.0,
                },
                odometer: OdometerReading {
                    value: None,
                    unit: None,
                    confidence: 0.0,
                },
                vin: VinReading {
                    text: None,
                    confidence: 0.0,
                },
                damage: Vec::new(),
            },
            plausibility_warnings: Vec::new(),
            validation_error: Some(error.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Risk payloads
// ---------------------------------------------------------------------------

/// Severity of a risk flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// A pointer to the evidence supporting a risk flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRef {
    /// Evidence kind: photo, metadata, note, vision, or similar_case.
    pub kind: String,
    pub id: Option<String>,
    pub description: Option<String>,
}

/// One risk or inconsistency flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFlag {
    pub code: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub evidence: Vec<EvidenceRef>,
}

/// Full result of the risk-scanning capability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskScan {
    #[serde(default)]
    pub flags: Vec<RiskFlag>,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub unknowns: Vec<String>,
    #[serde(default)]
    pub used_historical_context: bool,
    /// Messages describing flags dropped by the safety screen.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub safety_violations: Vec<String>,
    /// Set when the text model failed and only deterministic checks ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_error: Option<String>,
}
