//! Historical-retrieval adapter.
//!
//! Wraps the [`Retriever`]; the outcome is always a tagged
//! [`HistoricalContext`], so an unavailable index narrows the downstream
//! context instead of failing the run.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use precheck_core::HistoricalContext;

use crate::retrieval::{build_query_text, Retriever};

use super::{Capability, ContextUpdate, EvidenceContext, ToolAdapter, ToolError, ToolOutput};

/// Similar-case retrieval tool adapter.
pub struct RetrievalTool {
    retriever: Arc<Retriever>,
}

impl RetrievalTool {
    pub fn new(retriever: Arc<Retriever>) -> Self {
        Self { retriever }
    }
}

#[async_trait]
impl ToolAdapter for RetrievalTool {
    fn capability(&self) -> Capability {
        Capability::RetrieveSimilarCases
    }

    fn input_refs(&self, ctx: &EvidenceContext) -> serde_json::Value {
        json!({
            "appraisal_id": ctx.appraisal.id,
            "photo_ids": ctx.envelopes.iter().map(|e| e.photo_id.clone()).collect::<Vec<_>>(),
        })
    }

    async fn invoke(&self, ctx: &EvidenceContext) -> Result<ToolOutput, ToolError> {
        let query = build_query_text(&ctx.appraisal.metadata, ctx.notes(), &ctx.envelopes);
        let outcome = self.retriever.similar_cases(&query).await;

        let summary = match &outcome {
            HistoricalContext::Available { cases } => json!({
                "available": true,
                "similar_count": cases.len(),
                "top_similarity": cases.first().map(|c| c.similarity),
            }),
            HistoricalContext::Absent { reason } => json!({
                "available": false,
                "reason": reason,
            }),
        };

        let confidence = match &outcome {
            HistoricalContext::Available { cases } => Some(json!({
                "similarities": cases.iter().map(|c| c.similarity).collect::<Vec<_>>(),
            })),
            HistoricalContext::Absent { .. } => None,
        };

        Ok(ToolOutput {
            summary,
            confidence,
            update: ContextUpdate::Historical(outcome),
        })
    }
}
