//! Scoring adapter: pure delegation to the deterministic core.
//!
//! No model access. The adapter exists so scoring participates in the same
//! loop, ledger, and retry machinery as every other capability.

use async_trait::async_trait;
use serde_json::json;

use precheck_core::{decide, compute_score, DecisionThresholds, ScoreInputs, ScoringWeights};

use super::{Capability, ContextUpdate, EvidenceContext, ToolAdapter, ToolError, ToolOutput};

/// Readiness-scoring tool adapter.
pub struct ScoreTool {
    weights: ScoringWeights,
    thresholds: DecisionThresholds,
}

impl ScoreTool {
    pub fn new(weights: ScoringWeights, thresholds: DecisionThresholds) -> Self {
        Self {
            weights,
            thresholds,
        }
    }
}

#[async_trait]
impl ToolAdapter for ScoreTool {
    fn capability(&self) -> Capability {
        Capability::ComputeScore
    }

    fn input_refs(&self, ctx: &EvidenceContext) -> serde_json::Value {
        json!({
            "photo_ids": ctx.envelopes.iter().map(|e| e.photo_id.clone()).collect::<Vec<_>>(),
            "risk_flag_count": ctx.risk.as_ref().map(|r| r.flags.len()).unwrap_or(0),
        })
    }

    async fn invoke(&self, ctx: &EvidenceContext) -> Result<ToolOutput, ToolError> {
        let empty = Vec::new();
        let flags = ctx.risk.as_ref().map(|r| &r.flags).unwrap_or(&empty);

        let card = compute_score(
            ScoreInputs {
                envelopes: &ctx.envelopes,
                notes: ctx.notes(),
                risk_flags: flags,
            },
            &self.weights,
        );
        let decision = decide(&card, &self.thresholds);

        let summary = json!({
            "score": card.total,
            "status": decision.status,
            "reasons": decision.reasons,
            "next_action": decision.next_action.action,
        });

        let confidence = json!({
            "breakdown": {
                "angle_coverage": card.breakdown.angle_coverage.points,
                "odometer_confidence": card.breakdown.odometer_confidence.points,
                "identifier_presence": card.breakdown.identifier_presence.points,
                "notes_quality": card.breakdown.notes_quality.points,
                "risk_penalty": card.breakdown.risk_penalty.points,
            },
        });

        Ok(ToolOutput {
            summary,
            confidence: Some(confidence),
            update: ContextUpdate::Score { card, decision },
        })
    }
}
