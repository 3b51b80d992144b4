//! # precheck-core
//!
//! Deterministic evaluation core for appraisal evidence validation.
//!
//! This crate answers, without any model call:
//! - Is the submitted evidence complete?
//! - What readiness score does it earn?
//! - Where should the appraisal route next?
//!
//! ## Key Guarantees
//!
//! 1. **Deterministic**: same input always produces the same output
//! 2. **No I/O**: scoring, completeness, and policy are pure functions
//! 3. **Traceable**: every decision carries ordered human-readable reasons
//! 4. **Validated up front**: malformed metadata, notes, and keys are
//!    rejected before a run exists
//!
//! The async pipeline (tool adapters, the agent controller, persistence)
//! lives in `precheck-runtime` and delegates every judgment call back here.

pub mod completeness;
pub mod domain;
pub mod policy;
pub mod scoring;
pub mod validation;

// Re-export main types at crate root
pub use completeness::{assess, CompletenessReport, EvidenceStatus};
pub use domain::{
    AngleReading, Appraisal, Artifact, ContentTag, DamageObservation, DistanceUnit,
    EmbeddingRecord, EventStatus, EvidenceRef, ExtractionStatus, HistoricalContext, LedgerEvent,
    OdometerReading, PhotoAngle, PipelineRun, RiskFlag, RiskScan, RunOutputs, RunStatus,
    Severity, SimilarCase, VehicleMetadata, VinReading, VisionEnvelope, VisionExtraction,
    OUTPUTS_VERSION, REQUIRED_ANGLES, SHORT_CODE_ALPHABET, SHORT_CODE_LEN,
};
pub use policy::{decide, route_action, Decision, DecisionStatus, DecisionThresholds, NextAction};
pub use scoring::{compute_score, ScoreBreakdown, ScoreCard, ScoreInputs, ScoringWeights};
pub use validation::{
    sanitize_notes, validate_idempotency_key, validate_metadata, validate_notes,
    validate_vin_check_digit, vin_charset_valid, ValidationError,
};
