//! Tool adapters: uniform-interface wrappers around each capability.
//!
//! The capability set is closed (a [`Capability`] enum, not strings) and
//! the [`ToolRegistry`] is validated at construction: every capability must
//! have exactly one adapter or the registry refuses to build.
//!
//! # Isolation Contract
//! Adapters never mutate shared state. Each invocation reads the evidence
//! context and returns a [`ContextUpdate`] for the controller to merge; the
//! controller owns the context and the ledger entry.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;

use precheck_core::{
    Appraisal, Artifact, CompletenessReport, Decision, HistoricalContext, RiskScan, ScoreCard,
    VisionEnvelope,
};

use crate::providers::ProviderError;
use crate::store::StoreError;

mod completeness;
mod retrieval;
mod risk;
mod score;
mod vision;

pub use completeness::CompletenessTool;
pub use retrieval::RetrievalTool;
pub use risk::RiskScanTool;
pub use score::ScoreTool;
pub use vision::{PhotoExtractor, VisionExtractionTool};

/// The closed capability set. Declaration order is the deterministic
/// fallback invocation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    ExtractVisionEvidence,
    CheckEvidenceCompleteness,
    RetrieveSimilarCases,
    ScanRisk,
    ComputeScore,
}

/// All capabilities, in deterministic fallback order.
pub const ALL_CAPABILITIES: [Capability; 5] = [
    Capability::ExtractVisionEvidence,
    Capability::CheckEvidenceCompleteness,
    Capability::RetrieveSimilarCases,
    Capability::ScanRisk,
    Capability::ComputeScore,
];

impl Capability {
    /// Ledger node name for this capability.
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::ExtractVisionEvidence => "extract_vision_evidence",
            Capability::CheckEvidenceCompleteness => "check_evidence_completeness",
            Capability::RetrieveSimilarCases => "retrieve_similar_cases",
            Capability::ScanRisk => "scan_risk",
            Capability::ComputeScore => "compute_score",
        }
    }

    /// Parse a capability name. Unknown names return None; there is no
    /// string-keyed dispatch anywhere past this point.
    pub fn from_name(name: &str) -> Option<Self> {
        ALL_CAPABILITIES
            .into_iter()
            .find(|c| c.as_str() == name.trim())
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from tool adapters.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid tool output: {0}")]
    Invalid(String),
}

/// Accumulated working context the controller threads through the loop.
#[derive(Debug, Clone)]
pub struct EvidenceContext {
    pub appraisal: Appraisal,
    pub artifacts: Vec<Artifact>,
    pub envelopes: Vec<VisionEnvelope>,
    pub completeness: Option<CompletenessReport>,
    pub historical: Option<HistoricalContext>,
    pub risk: Option<RiskScan>,
    pub score: Option<ScoreCard>,
    pub decision: Option<Decision>,
}

impl EvidenceContext {
    pub fn new(appraisal: Appraisal, artifacts: Vec<Artifact>) -> Self {
        Self {
            appraisal,
            artifacts,
            envelopes: Vec::new(),
            completeness: None,
            historical: None,
            risk: None,
            score: None,
            decision: None,
        }
    }

    pub fn notes(&self) -> Option<&str> {
        self.appraisal.notes.as_deref()
    }

    /// Merge an adapter's result. The only place context mutates.
    pub fn apply(&mut self, update: ContextUpdate) {
        match update {
            ContextUpdate::Vision(envelopes) => self.envelopes = envelopes,
            ContextUpdate::Completeness(report) => self.completeness = Some(report),
            ContextUpdate::Historical(context) => self.historical = Some(context),
            ContextUpdate::Risk(scan) => self.risk = Some(scan),
            ContextUpdate::Score { card, decision } => {
                self.score = Some(card);
                self.decision = Some(decision);
            }
        }
    }

    /// Which capability's result is already present.
    pub fn has_result(&self, capability: Capability) -> bool {
        match capability {
            Capability::ExtractVisionEvidence => !self.envelopes.is_empty(),
            Capability::CheckEvidenceCompleteness => self.completeness.is_some(),
            Capability::RetrieveSimilarCases => self.historical.is_some(),
            Capability::ScanRisk => self.risk.is_some(),
            Capability::ComputeScore => self.decision.is_some(),
        }
    }
}

/// Result merge instruction returned by an adapter.
#[derive(Debug, Clone)]
pub enum ContextUpdate {
    Vision(Vec<VisionEnvelope>),
    Completeness(CompletenessReport),
    Historical(HistoricalContext),
    Risk(RiskScan),
    Score { card: ScoreCard, decision: Decision },
}

/// Structured result of one adapter invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Payload recorded in the ledger event.
    pub summary: serde_json::Value,

    /// Confidence signal recorded alongside the payload.
    pub confidence: Option<serde_json::Value>,

    /// Context merge instruction.
    pub update: ContextUpdate,
}

/// One evidence-processing capability behind a uniform interface.
///
/// # Isolation Contract
/// - MUST NOT mutate the context; results flow back via [`ToolOutput`]
/// - MUST NOT write to the ledger; the controller owns that
/// - Deterministic capabilities MUST return identical output for identical
///   context
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// The capability this adapter implements.
    fn capability(&self) -> Capability;

    /// Pointers to the evidence this invocation will consume, recorded as
    /// the ledger event's input refs.
    fn input_refs(&self, ctx: &EvidenceContext) -> serde_json::Value {
        json!({ "appraisal_id": ctx.appraisal.id })
    }

    /// Invoke the capability over the current context.
    async fn invoke(&self, ctx: &EvidenceContext) -> Result<ToolOutput, ToolError>;
}

/// Error from registry construction.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("no adapter registered for capability {0}")]
    Missing(Capability),

    #[error("duplicate adapter for capability {0}")]
    Duplicate(Capability),
}

/// Closed mapping from capability to adapter, validated at startup.
pub struct ToolRegistry {
    adapters: BTreeMap<Capability, Arc<dyn ToolAdapter>>,
}

impl ToolRegistry {
    /// Build the registry. Fails unless every capability has exactly one
    /// adapter.
    pub fn new(adapters: Vec<Arc<dyn ToolAdapter>>) -> Result<Self, RegistryError> {
        let mut map: BTreeMap<Capability, Arc<dyn ToolAdapter>> = BTreeMap::new();
        for adapter in adapters {
            let capability = adapter.capability();
            if map.insert(capability, adapter).is_some() {
                return Err(RegistryError::Duplicate(capability));
            }
        }
        for capability in ALL_CAPABILITIES {
            if !map.contains_key(&capability) {
                return Err(RegistryError::Missing(capability));
            }
        }
        Ok(Self { adapters: map })
    }

    pub fn get(&self, capability: Capability) -> &Arc<dyn ToolAdapter> {
        // Construction guarantees presence for every variant.
        &self.adapters[&capability]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubAdapter(Capability);

    #[async_trait]
    impl ToolAdapter for StubAdapter {
        fn capability(&self) -> Capability {
            self.0
        }

        async fn invoke(&self, _ctx: &EvidenceContext) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput {
                summary: json!({}),
                confidence: None,
                update: ContextUpdate::Vision(Vec::new()),
            })
        }
    }

    #[test]
    fn test_capability_names_round_trip() {
        for capability in ALL_CAPABILITIES {
            assert_eq!(Capability::from_name(capability.as_str()), Some(capability));
        }
        assert_eq!(Capability::from_name("made_up_tool"), None);
    }

    #[test]
    fn test_registry_requires_all_capabilities() {
        let partial: Vec<Arc<dyn ToolAdapter>> = vec![
            Arc::new(StubAdapter(Capability::ExtractVisionEvidence)),
            Arc::new(StubAdapter(Capability::ComputeScore)),
        ];
        assert!(matches!(
            ToolRegistry::new(partial),
            Err(RegistryError::Missing(_))
        ));
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let duplicated: Vec<Arc<dyn ToolAdapter>> = vec![
            Arc::new(StubAdapter(Capability::ScanRisk)),
            Arc::new(StubAdapter(Capability::ScanRisk)),
        ];
        assert!(matches!(
            ToolRegistry::new(duplicated),
            Err(RegistryError::Duplicate(Capability::ScanRisk))
        ));
    }

    #[test]
    fn test_registry_accepts_full_set() {
        let full: Vec<Arc<dyn ToolAdapter>> = ALL_CAPABILITIES
            .into_iter()
            .map(|c| Arc::new(StubAdapter(c)) as Arc<dyn ToolAdapter>)
            .collect();
        let registry = ToolRegistry::new(full).unwrap();
        for capability in ALL_CAPABILITIES {
            assert_eq!(registry.get(capability).capability(), capability);
        }
    }
}
