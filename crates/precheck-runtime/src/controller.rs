//! The agent controller: a bounded tool-calling loop.
//!
//! Each iteration selects the next capability (model-assisted when a
//! planner is supplied, deterministic order otherwise), invokes it with a
//! per-call timeout, appends a ledger event, and merges the result into the
//! working context. Two hard bounds, an iteration cap and a wall-clock
//! budget, are enforced independently of the selection policy.
//!
//! The controller never returns an empty result: when budgets expire or a
//! capability stays unavailable, it synthesizes a best-effort decision from
//! whatever evidence exists and flags the outputs as incomplete.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use precheck_core::{
    route_action, Appraisal, Artifact, Decision, DecisionStatus, HistoricalContext, RunOutputs,
    OUTPUTS_VERSION,
};

use crate::config::ControllerConfig;
use crate::ledger::Ledger;
use crate::providers::{ChatMessage, CompletionConfig, TextModel};
use crate::store::StoreError;
use crate::tools::{Capability, EvidenceContext, ToolRegistry, ALL_CAPABILITIES};

/// Errors that end a run as FAILED. Everything else degrades.
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

/// Selection policy: pick the next capability given the accumulated context.
///
/// Returning `None` defers to the fixed deterministic order
/// (vision → completeness → retrieval → risk → score).
#[async_trait]
pub trait Planner: Send + Sync {
    async fn next_capability(
        &self,
        ctx: &EvidenceContext,
        satisfied: &BTreeSet<Capability>,
        unavailable: &BTreeSet<Capability>,
    ) -> Option<Capability>;
}

/// Fixed-order planner; also the fallback whenever the adaptive planner
/// abstains or answers outside the registry.
pub struct DeterministicPlanner;

#[async_trait]
impl Planner for DeterministicPlanner {
    async fn next_capability(
        &self,
        _ctx: &EvidenceContext,
        satisfied: &BTreeSet<Capability>,
        unavailable: &BTreeSet<Capability>,
    ) -> Option<Capability> {
        next_in_order(satisfied, unavailable)
    }
}

fn next_in_order(
    satisfied: &BTreeSet<Capability>,
    unavailable: &BTreeSet<Capability>,
) -> Option<Capability> {
    ALL_CAPABILITIES
        .into_iter()
        .find(|c| !satisfied.contains(c) && !unavailable.contains(c))
}

/// Model-assisted planner: asks the text model to name the next capability
/// from a digest of the current context. Any answer that does not name a
/// remaining capability defers to the deterministic order.
pub struct ModelPlanner {
    model: Arc<dyn TextModel>,
    completion: CompletionConfig,
}

impl ModelPlanner {
    pub fn new(model: Arc<dyn TextModel>, completion: CompletionConfig) -> Self {
        Self { model, completion }
    }

    fn digest(ctx: &EvidenceContext, remaining: &[Capability]) -> String {
        format!(
            "Photos uploaded: {}. Photos analyzed: {}. Completeness checked: {}. \
             Historical context: {}. Risk scanned: {}. Scored: {}.\n\
             Remaining capabilities: {}.\n\
             Respond with exactly one capability name from the remaining list.",
            ctx.artifacts.len(),
            ctx.envelopes.len(),
            ctx.completeness.is_some(),
            match &ctx.historical {
                Some(h) if h.is_available() => "available",
                Some(_) => "absent",
                None => "not retrieved",
            },
            ctx.risk.is_some(),
            ctx.decision.is_some(),
            remaining
                .iter()
                .map(|c| c.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        )
    }
}

#[async_trait]
impl Planner for ModelPlanner {
    async fn next_capability(
        &self,
        ctx: &EvidenceContext,
        satisfied: &BTreeSet<Capability>,
        unavailable: &BTreeSet<Capability>,
    ) -> Option<Capability> {
        let remaining: Vec<Capability> = ALL_CAPABILITIES
            .into_iter()
            .filter(|c| !satisfied.contains(c) && !unavailable.contains(c))
            .collect();
        if remaining.is_empty() {
            return None;
        }

        let messages = vec![
            ChatMessage::system(
                "You sequence evidence-validation tools for a vehicle appraisal pipeline. \
                 Pick the single most useful next capability.",
            ),
            ChatMessage::user(Self::digest(ctx, &remaining)),
        ];

        match self.model.complete(messages, &self.completion).await {
            Ok(response) => {
                let answer = response.content.trim().trim_matches('"');
                Capability::from_name(answer).filter(|c| remaining.contains(c))
            }
            Err(e) => {
                warn!(error = %e, "planner model unavailable, using deterministic order");
                None
            }
        }
    }
}

/// The bounded tool-calling loop.
pub struct AgentController {
    registry: ToolRegistry,
    planner: Arc<dyn Planner>,
    ledger: Ledger,
    config: ControllerConfig,
}

impl AgentController {
    pub fn new(
        registry: ToolRegistry,
        planner: Arc<dyn Planner>,
        ledger: Ledger,
        config: ControllerConfig,
    ) -> Self {
        Self {
            registry,
            planner,
            ledger,
            config,
        }
    }

    /// Run the loop to a decision or budget exhaustion.
    ///
    /// Returns versioned outputs on every non-persistence path; only a
    /// datastore failure propagates, and the state machine turns that into
    /// a FAILED run.
    pub async fn execute(
        &self,
        appraisal: Appraisal,
        artifacts: Vec<Artifact>,
        run_id: Uuid,
    ) -> Result<RunOutputs, ControllerError> {
        let appraisal_id = appraisal.id;
        let deadline = Instant::now() + self.config.run_budget;

        let mut ctx = EvidenceContext::new(appraisal, artifacts);
        let mut satisfied: BTreeSet<Capability> = BTreeSet::new();
        let mut unavailable: BTreeSet<Capability> = BTreeSet::new();
        let mut failures: BTreeMap<Capability, u32> = BTreeMap::new();
        let mut tools_used: Vec<String> = Vec::new();
        let mut exhaustion: Option<String> = None;

        let mut iterations = 0u32;
        while ctx.decision.is_none() {
            if iterations >= self.config.max_iterations {
                exhaustion = Some("iteration budget exhausted".to_string());
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                exhaustion = Some("wall-clock budget exhausted".to_string());
                break;
            }
            iterations += 1;

            let capability = match self
                .planner
                .next_capability(&ctx, &satisfied, &unavailable)
                .await
                .filter(|c| !satisfied.contains(c) && !unavailable.contains(c))
                .or_else(|| next_in_order(&satisfied, &unavailable))
            {
                Some(c) => c,
                None => break, // nothing left to try
            };

            let adapter = self.registry.get(capability).clone();
            let input_refs = adapter.input_refs(&ctx);
            let tool_budget = self.config.tool_timeout.min(deadline - now);

            let outcome = tokio::time::timeout(tool_budget, adapter.invoke(&ctx)).await;

            match outcome {
                Ok(Ok(output)) => {
                    self.ledger
                        .append_ok(
                            appraisal_id,
                            run_id,
                            capability.as_str(),
                            input_refs,
                            output.summary,
                            output.confidence,
                        )
                        .await?;
                    ctx.apply(output.update);
                    satisfied.insert(capability);
                    tools_used.push(capability.as_str().to_string());
                }
                Ok(Err(error)) => {
                    self.ledger
                        .append_fail(
                            appraisal_id,
                            run_id,
                            capability.as_str(),
                            input_refs,
                            error.to_string(),
                        )
                        .await?;
                    self.record_failure(capability, &mut failures, &mut unavailable);
                }
                Err(_) => {
                    self.ledger
                        .append_fail(
                            appraisal_id,
                            run_id,
                            capability.as_str(),
                            input_refs,
                            format!("timed out after {tool_budget:?}"),
                        )
                        .await?;
                    self.record_failure(capability, &mut failures, &mut unavailable);
                }
            }
        }

        Ok(self.finish(ctx, tools_used, unavailable, exhaustion))
    }

    /// Count a failure; past the retry limit the capability is marked
    /// unavailable and the run continues degraded.
    fn record_failure(
        &self,
        capability: Capability,
        failures: &mut BTreeMap<Capability, u32>,
        unavailable: &mut BTreeSet<Capability>,
    ) {
        let count = failures.entry(capability).or_insert(0);
        *count += 1;
        if *count > self.config.tool_retry_limit {
            warn!(%capability, failures = *count, "capability marked unavailable");
            unavailable.insert(capability);
        }
    }

    /// Assemble versioned outputs, synthesizing a best-effort decision when
    /// the loop ended without one.
    fn finish(
        &self,
        ctx: EvidenceContext,
        tools_used: Vec<String>,
        unavailable: BTreeSet<Capability>,
        exhaustion: Option<String>,
    ) -> RunOutputs {
        let incomplete = ctx.decision.is_none();

        let decision = ctx.decision.clone().unwrap_or_else(|| {
            let mut reasons = vec!["Run ended before scoring completed".to_string()];
            if let Some(reason) = &exhaustion {
                reasons.push(reason.clone());
            }
            Decision {
                status: DecisionStatus::NeedsMoreEvidence,
                score: ctx.score.as_ref().map(|s| s.total).unwrap_or(0),
                reasons,
                next_action: route_action(DecisionStatus::NeedsMoreEvidence),
            }
        });

        let mut assumptions: Vec<String> = Vec::new();
        let mut unknowns: Vec<String> = Vec::new();

        if let Some(reason) = exhaustion {
            assumptions.push(format!("Best-effort decision: {reason}"));
        }
        for capability in &unavailable {
            assumptions.push(format!(
                "Capability {capability} was unavailable; the run continued degraded"
            ));
        }

        let historical = ctx.historical.clone().unwrap_or(HistoricalContext::Absent {
            reason: "retrieval was not reached".to_string(),
        });
        if let HistoricalContext::Absent { reason } = &historical {
            unknowns.push(format!("Historical context absent: {reason}"));
        }

        if let Some(risk) = &ctx.risk {
            assumptions.extend(risk.assumptions.iter().cloned());
            unknowns.extend(risk.unknowns.iter().cloned());
        }

        info!(
            score = decision.score,
            status = ?decision.status,
            incomplete,
            tools = tools_used.len(),
            "controller finished"
        );

        RunOutputs {
            version: OUTPUTS_VERSION.to_string(),
            decision,
            score: ctx.score,
            completeness: ctx.completeness,
            risk: ctx.risk,
            historical_context: historical,
            assumptions,
            unknowns,
            incomplete,
            tools_used,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{CompletionResponse, ProviderError};
    use chrono::Utc;
    use precheck_core::VehicleMetadata;

    struct ScriptedModel(String);

    #[async_trait]
    impl TextModel for ScriptedModel {
        async fn complete(
            &self,
            _messages: Vec<ChatMessage>,
            _config: &CompletionConfig,
        ) -> Result<CompletionResponse, ProviderError> {
            Ok(CompletionResponse {
                content: self.0.clone(),
                model: "scripted".to_string(),
            })
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn empty_ctx() -> EvidenceContext {
        EvidenceContext::new(
            Appraisal {
                id: Uuid::new_v4(),
                short_code: "PLAN".to_string(),
                metadata: VehicleMetadata::default(),
                notes: None,
                latest_run_id: None,
                created_at: Utc::now(),
            },
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn test_deterministic_planner_follows_fixed_order() {
        let planner = DeterministicPlanner;
        let mut satisfied = BTreeSet::new();
        let unavailable = BTreeSet::new();
        let ctx = empty_ctx();

        let expected = [
            Capability::ExtractVisionEvidence,
            Capability::CheckEvidenceCompleteness,
            Capability::RetrieveSimilarCases,
            Capability::ScanRisk,
            Capability::ComputeScore,
        ];
        for capability in expected {
            let next = planner
                .next_capability(&ctx, &satisfied, &unavailable)
                .await
                .unwrap();
            assert_eq!(next, capability);
            satisfied.insert(next);
        }
        assert!(planner
            .next_capability(&ctx, &satisfied, &unavailable)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_deterministic_planner_skips_unavailable() {
        let planner = DeterministicPlanner;
        let satisfied = BTreeSet::from([Capability::ExtractVisionEvidence]);
        let unavailable = BTreeSet::from([Capability::CheckEvidenceCompleteness]);
        let next = planner
            .next_capability(&empty_ctx(), &satisfied, &unavailable)
            .await;
        assert_eq!(next, Some(Capability::RetrieveSimilarCases));
    }

    #[tokio::test]
    async fn test_model_planner_accepts_valid_answer() {
        let planner = ModelPlanner::new(
            Arc::new(ScriptedModel("scan_risk".to_string())),
            CompletionConfig::default(),
        );
        let next = planner
            .next_capability(&empty_ctx(), &BTreeSet::new(), &BTreeSet::new())
            .await;
        assert_eq!(next, Some(Capability::ScanRisk));
    }

    #[tokio::test]
    async fn test_model_planner_rejects_unknown_tool() {
        let planner = ModelPlanner::new(
            Arc::new(ScriptedModel("call_my_cousin".to_string())),
            CompletionConfig::default(),
        );
        let next = planner
            .next_capability(&empty_ctx(), &BTreeSet::new(), &BTreeSet::new())
            .await;
        assert_eq!(next, None);
    }

    #[tokio::test]
    async fn test_model_planner_rejects_satisfied_capability() {
        let planner = ModelPlanner::new(
            Arc::new(ScriptedModel("extract_vision_evidence".to_string())),
            CompletionConfig::default(),
        );
        let satisfied = BTreeSet::from([Capability::ExtractVisionEvidence]);
        let next = planner
            .next_capability(&empty_ctx(), &satisfied, &BTreeSet::new())
            .await;
        assert_eq!(next, None);
    }

    // Full loop behavior (retries, degradation, budget exhaustion) is
    // exercised end to end in tests/pipeline.rs.
}
