//! Completeness-check adapter: a pure function over collected evidence.

use async_trait::async_trait;
use serde_json::json;

use super::{Capability, ContextUpdate, EvidenceContext, ToolAdapter, ToolError, ToolOutput};

/// Evidence-completeness tool adapter. No external calls.
#[derive(Default)]
pub struct CompletenessTool;

impl CompletenessTool {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ToolAdapter for CompletenessTool {
    fn capability(&self) -> Capability {
        Capability::CheckEvidenceCompleteness
    }

    fn input_refs(&self, ctx: &EvidenceContext) -> serde_json::Value {
        json!({
            "photo_ids": ctx.envelopes.iter().map(|e| e.photo_id.clone()).collect::<Vec<_>>(),
        })
    }

    async fn invoke(&self, ctx: &EvidenceContext) -> Result<ToolOutput, ToolError> {
        let report = precheck_core::assess(&ctx.envelopes);

        let summary = serde_json::to_value(&report)
            .map_err(|e| ToolError::Invalid(e.to_string()))?;

        Ok(ToolOutput {
            summary,
            confidence: None,
            update: ContextUpdate::Completeness(report),
        })
    }
}
