//! Vision-extraction adapter.
//!
//! For each uploaded artifact the adapter prefers the background worker's
//! cached extraction, waits a bounded interval for one that is still in
//! flight, and only then calls the vision model itself. A photo that cannot
//! be read degrades to an all-unknown envelope; it never fails the run.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use precheck_core::{validate_vin_check_digit, vin_charset_valid, VisionEnvelope};

use crate::providers::{ChatMessage, CompletionConfig, VisionModel};
use crate::store::{Datastore, ObjectStore};

use super::{Capability, ContextUpdate, EvidenceContext, ToolAdapter, ToolError, ToolOutput};

pub(crate) const PROMPT_VISION: &str = r#"You are a vision assistant for auto appraisals.
Analyze the photo and extract vehicle information.

For photo angle classification, use one of: "front", "rear", "left", "right", "interior", "odometer", "vin", "damage", or "unknown".

Return ONLY valid JSON matching this EXACT structure:
{
  "photo_id": "the-photo-id-provided",
  "extraction": {
    "photo_angle": {"angle": "front|rear|left|right|interior|odometer|vin|damage|unknown", "confidence": 0.0-1.0},
    "odometer": {"value": null or number, "unit": null or "miles"|"km", "confidence": 0.0-1.0},
    "vin": {"text": null or "VIN string", "confidence": 0.0-1.0},
    "damage": [{"description": "damage description", "severity": "minor|moderate|severe", "confidence": 0.0-1.0}]
  }
}

If you don't find odometer/VIN/damage, set those fields to null or an empty array. If uncertain, set confidence < 0.7."#;

const PROMPT_REPAIR: &str = "The previous response had validation errors: {errors}\n\nReturn only valid JSON matching the structure from the system prompt.";

/// Polling interval while waiting for an in-flight background extraction.
const EXTRACTION_POLL: Duration = Duration::from_millis(250);

/// Odometer values outside this range are implausible.
const ODOMETER_MAX: f64 = 500_000.0;

/// Plausibility check for an odometer reading. Returns the adjusted
/// confidence and an optional warning.
pub(crate) fn check_odometer_plausibility(
    value: Option<f64>,
    confidence: f64,
) -> (f64, Option<String>) {
    let Some(value) = value else {
        return (confidence, None);
    };

    if !(0.0..=ODOMETER_MAX).contains(&value) {
        return (
            0.0,
            Some(format!(
                "Odometer value {value} is outside plausible range (0-500,000)"
            )),
        );
    }

    // Round multiples of 10,000 at high confidence are a misread signal.
    if value > 0.0 && value % 10_000.0 == 0.0 && confidence > 0.8 {
        return (
            confidence * 0.7,
            Some(format!("Odometer value {value} is suspiciously round")),
        );
    }

    (confidence, None)
}

/// Plausibility check for a VIN: length, character set, check digit.
pub(crate) fn check_vin_plausibility(
    text: Option<&str>,
    confidence: f64,
) -> (f64, Option<String>) {
    let Some(text) = text else {
        return (confidence, None);
    };

    if text.len() != 17 {
        return (
            0.0,
            Some(format!(
                "VIN length {} is invalid (must be 17 characters)",
                text.len()
            )),
        );
    }

    if !vin_charset_valid(text) {
        return (
            confidence * 0.5,
            Some("VIN contains invalid characters (I, O, or Q)".to_string()),
        );
    }

    if !validate_vin_check_digit(text) {
        return (0.0, Some("VIN check digit validation failed".to_string()));
    }

    (confidence, None)
}

/// Apply both plausibility checks to a parsed envelope.
fn apply_plausibility(envelope: &mut VisionEnvelope) {
    let odometer = &mut envelope.extraction.odometer;
    let (confidence, warning) = check_odometer_plausibility(odometer.value, odometer.confidence);
    odometer.confidence = confidence;
    if let Some(w) = warning {
        envelope.plausibility_warnings.push(w);
    }

    let vin = &mut envelope.extraction.vin;
    let (confidence, warning) = check_vin_plausibility(vin.text.as_deref(), vin.confidence);
    vin.confidence = confidence;
    if let Some(w) = warning {
        envelope.plausibility_warnings.push(w);
    }
}

/// Per-photo extraction: one vision call plus a single repair retry when
/// the payload is not schema-valid JSON. Shared by the tool adapter and the
/// background extraction worker.
pub struct PhotoExtractor {
    model: Arc<dyn VisionModel>,
    completion: CompletionConfig,
}

impl PhotoExtractor {
    pub fn new(model: Arc<dyn VisionModel>, completion: CompletionConfig) -> Self {
        Self { model, completion }
    }

    /// Extract structured evidence from one photo. Never errors: an
    /// unreadable photo degrades to an all-unknown envelope.
    pub async fn extract(&self, photo_url: &str, photo_id: &str) -> VisionEnvelope {
        let mut messages = vec![
            ChatMessage::system(PROMPT_VISION),
            ChatMessage::user_with_image(
                format!("Analyze this appraisal photo. Photo ID: {photo_id}"),
                photo_url,
            ),
        ];

        let mut config = self.completion.clone();
        config.json_mode = true;

        let mut last_error = String::new();
        for attempt in 0..2 {
            let response = match self.model.complete(messages.clone(), &config).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(photo_id, attempt, error = %e, "vision call failed");
                    last_error = e.to_string();
                    continue;
                }
            };

            match serde_json::from_str::<VisionEnvelope>(&response.content) {
                Ok(mut envelope) => {
                    envelope.photo_id = photo_id.to_string();
                    apply_plausibility(&mut envelope);
                    return envelope;
                }
                Err(e) => {
                    debug!(photo_id, attempt, error = %e, "vision payload invalid, repairing");
                    last_error = e.to_string();
                    messages.push(ChatMessage::assistant(response.content));
                    messages.push(ChatMessage::user(
                        PROMPT_REPAIR.replace("{errors}", &last_error),
                    ));
                }
            }
        }

        VisionEnvelope::degraded(photo_id, last_error)
    }
}

/// Vision-extraction tool adapter.
pub struct VisionExtractionTool {
    extractor: Arc<PhotoExtractor>,
    store: Arc<dyn Datastore>,
    objects: Arc<dyn ObjectStore>,
    /// Bound on waiting for an in-flight background extraction.
    extraction_wait: Duration,
}

impl VisionExtractionTool {
    pub fn new(
        extractor: Arc<PhotoExtractor>,
        store: Arc<dyn Datastore>,
        objects: Arc<dyn ObjectStore>,
        extraction_wait: Duration,
    ) -> Self {
        Self {
            extractor,
            store,
            objects,
            extraction_wait,
        }
    }

    /// Resolve one artifact to an envelope: cached, awaited, or extracted.
    async fn resolve_artifact(&self, artifact_id: uuid::Uuid) -> VisionEnvelope {
        let deadline = tokio::time::Instant::now() + self.extraction_wait;

        loop {
            let artifact = match self.store.get_artifact(artifact_id).await {
                Ok(a) => a,
                Err(e) => return VisionEnvelope::degraded(artifact_id.to_string(), e.to_string()),
            };

            use precheck_core::ExtractionStatus::*;
            match artifact.extraction_status {
                Completed => {
                    if let Some(envelope) = artifact.vision_output {
                        return envelope;
                    }
                    // Completed without output should not happen; extract fresh.
                }
                Processing | Pending if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(EXTRACTION_POLL).await;
                    continue;
                }
                _ => {}
            }

            let url = self.objects.url_for(&artifact.storage_pointer);
            return self.extractor.extract(&url, &artifact.id.to_string()).await;
        }
    }
}

#[async_trait]
impl ToolAdapter for VisionExtractionTool {
    fn capability(&self) -> Capability {
        Capability::ExtractVisionEvidence
    }

    fn input_refs(&self, ctx: &EvidenceContext) -> serde_json::Value {
        json!({
            "artifact_ids": ctx.artifacts.iter().map(|a| a.id).collect::<Vec<_>>(),
        })
    }

    async fn invoke(&self, ctx: &EvidenceContext) -> Result<ToolOutput, ToolError> {
        // Photos resolve concurrently; order of the result follows the
        // artifact list, not completion order.
        let envelopes = futures::future::join_all(
            ctx.artifacts.iter().map(|a| self.resolve_artifact(a.id)),
        )
        .await;

        let degraded = envelopes
            .iter()
            .filter(|e| e.validation_error.is_some())
            .count();

        let confidence = json!({
            "angles": envelopes
                .iter()
                .map(|e| json!({
                    "photo_id": e.photo_id,
                    "angle": e.extraction.photo_angle.angle.as_str(),
                    "confidence": e.extraction.photo_angle.confidence,
                }))
                .collect::<Vec<_>>(),
        });

        Ok(ToolOutput {
            summary: json!({
                "photo_count": envelopes.len(),
                "degraded_count": degraded,
            }),
            confidence: Some(confidence),
            update: ContextUpdate::Vision(envelopes),
        })
    }
}
