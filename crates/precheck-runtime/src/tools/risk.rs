//! Risk-scanning adapter.
//!
//! Two layers: deterministic consistency checks between metadata and
//! extracted evidence, then a text-model pass over the aggregated context.
//! Model output is schema-validated and screened: flags that stray into
//! pricing or accusations are dropped and recorded as safety violations.
//! A model failure degrades to the deterministic flags alone.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use precheck_core::{EvidenceRef, HistoricalContext, RiskFlag, RiskScan, Severity};

use crate::providers::{ChatMessage, CompletionConfig, TextModel};

use super::{Capability, ContextUpdate, EvidenceContext, ToolAdapter, ToolError, ToolOutput};

pub(crate) const PROMPT_RISK: &str = r#"You are a risk and consistency checker for auto appraisals.

SAFETY CONSTRAINTS (CRITICAL):
1. You MUST NOT suggest prices, valuations, or monetary amounts
2. You MUST NOT accuse anyone of fraud or criminal activity
3. You MUST only flag inconsistencies or missing evidence
4. You MUST provide evidence references for every flag
5. You MUST surface uncertainty - if confidence is low, say so explicitly

Your job is to identify:
- Inconsistencies between photos, notes, and metadata
- Missing or unclear evidence
- Suspicious patterns that warrant human review
- Low-confidence extractions that need verification

If the context includes "similar_cases", these are historically similar
appraisals retrieved via semantic search. Use them to compare patterns,
validate expectations, and identify anomalies, citing them as
"based on similar historical cases".

Return your analysis as JSON with the following structure:
{
  "flags": [
    {
      "code": "EXAMPLE_CODE",
      "severity": "low|medium|high",
      "message": "Description of the issue",
      "evidence": [
        {"kind": "photo", "id": "photo_id_here", "description": "What was observed"}
      ]
    }
  ],
  "assumptions": ["List of assumptions made"],
  "unknowns": ["List of unknown factors"]
}

Each evidence object MUST have a "kind" field (one of: "photo", "metadata", "note", "vision", "similar_case")."#;

/// Terms that disqualify a flag message: pricing talk and accusations.
const FORBIDDEN_TERMS: [&str; 13] = [
    "price",
    "pricing",
    "valuation",
    "worth",
    "$",
    "dollar",
    "fraud",
    "fraudulent",
    "scam",
    "fake",
    "forged",
    "criminal",
    "illegal",
];

/// Mileage difference between metadata and photos that raises a flag.
const ODOMETER_MISMATCH_THRESHOLD: f64 = 100.0;

/// Shape of the model's JSON payload.
#[derive(Debug, Deserialize)]
struct ModelRiskScan {
    #[serde(default)]
    flags: Vec<RiskFlag>,
    #[serde(default)]
    assumptions: Vec<String>,
    #[serde(default)]
    unknowns: Vec<String>,
}

/// Deterministic checks between submitted metadata and extracted evidence.
/// Runs regardless of model availability.
pub(crate) fn check_metadata_consistency(ctx: &EvidenceContext) -> Vec<RiskFlag> {
    let mut flags = Vec::new();
    let metadata = &ctx.appraisal.metadata;

    if let Some(mileage) = metadata.mileage {
        let best = ctx
            .envelopes
            .iter()
            .filter_map(|e| {
                let odo = &e.extraction.odometer;
                odo.value
                    .filter(|_| odo.confidence > 0.0)
                    .map(|v| (v, odo.confidence))
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        if let Some((reading, _)) = best {
            if (mileage - reading).abs() > ODOMETER_MISMATCH_THRESHOLD {
                flags.push(RiskFlag {
                    code: "METADATA_ODOMETER_MISMATCH".to_string(),
                    severity: Severity::Medium,
                    message: format!(
                        "Metadata mileage ({mileage}) differs significantly from photo reading ({reading})"
                    ),
                    evidence: vec![
                        EvidenceRef {
                            kind: "metadata".to_string(),
                            id: Some("mileage".to_string()),
                            description: None,
                        },
                        EvidenceRef {
                            kind: "vision".to_string(),
                            id: None,
                            description: Some("best odometer reading".to_string()),
                        },
                    ],
                });
            }
        }
    }

    if let Some(vin) = &metadata.vin {
        let metadata_vin = vin.trim().to_ascii_uppercase();
        let best = ctx
            .envelopes
            .iter()
            .filter_map(|e| {
                let reading = &e.extraction.vin;
                reading
                    .text
                    .as_ref()
                    .filter(|_| reading.confidence > 0.0)
                    .map(|t| (t.trim().to_ascii_uppercase(), reading.confidence))
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        if let Some((extracted, _)) = best {
            if extracted != metadata_vin {
                flags.push(RiskFlag {
                    code: "METADATA_VIN_MISMATCH".to_string(),
                    severity: Severity::High,
                    message: format!(
                        "Metadata VIN ({metadata_vin}) does not match photo VIN ({extracted})"
                    ),
                    evidence: vec![
                        EvidenceRef {
                            kind: "metadata".to_string(),
                            id: Some("vin".to_string()),
                            description: None,
                        },
                        EvidenceRef {
                            kind: "vision".to_string(),
                            id: None,
                            description: Some("best identifier reading".to_string()),
                        },
                    ],
                });
            }
        }
    }

    flags
}

/// Drop flags whose message contains forbidden terms. Returns the surviving
/// flags and a description of each violation.
pub(crate) fn screen_flags(flags: Vec<RiskFlag>) -> (Vec<RiskFlag>, Vec<String>) {
    let mut kept = Vec::new();
    let mut violations = Vec::new();

    for flag in flags {
        let message = flag.message.to_lowercase();
        match FORBIDDEN_TERMS.iter().find(|t| message.contains(**t)) {
            Some(term) => violations.push(format!(
                "Flag '{}' contained forbidden term '{term}' and was dropped",
                flag.code
            )),
            None => kept.push(flag),
        }
    }

    (kept, violations)
}

/// Risk-scanning tool adapter.
pub struct RiskScanTool {
    model: Arc<dyn TextModel>,
    completion: CompletionConfig,
}

impl RiskScanTool {
    pub fn new(model: Arc<dyn TextModel>, completion: CompletionConfig) -> Self {
        Self { model, completion }
    }

    fn build_context_payload(ctx: &EvidenceContext) -> serde_json::Value {
        let mut payload = json!({
            "metadata": ctx.appraisal.metadata,
            "notes": ctx.notes().unwrap_or(""),
            "vision_outputs": ctx.envelopes,
        });

        if let Some(HistoricalContext::Available { cases }) = &ctx.historical {
            payload["similar_cases"] = json!({
                "count": cases.len(),
                "description": "Similar appraisals retrieved via semantic search",
                "cases": cases,
            });
        }

        payload
    }

    async fn model_scan(&self, ctx: &EvidenceContext) -> Result<ModelRiskScan, String> {
        let mut config = self.completion.clone();
        config.json_mode = true;

        let payload = Self::build_context_payload(ctx);
        let messages = vec![
            ChatMessage::system(PROMPT_RISK),
            ChatMessage::user(
                serde_json::to_string_pretty(&payload).map_err(|e| e.to_string())?,
            ),
        ];

        let response = self
            .model
            .complete(messages, &config)
            .await
            .map_err(|e| e.to_string())?;

        serde_json::from_str::<ModelRiskScan>(&response.content).map_err(|e| e.to_string())
    }
}

#[async_trait]
impl ToolAdapter for RiskScanTool {
    fn capability(&self) -> Capability {
        Capability::ScanRisk
    }

    fn input_refs(&self, ctx: &EvidenceContext) -> serde_json::Value {
        json!({
            "photo_ids": ctx.envelopes.iter().map(|e| e.photo_id.clone()).collect::<Vec<_>>(),
            "historical_available": ctx
                .historical
                .as_ref()
                .map(|h| h.is_available())
                .unwrap_or(false),
        })
    }

    async fn invoke(&self, ctx: &EvidenceContext) -> Result<ToolOutput, ToolError> {
        let deterministic = check_metadata_consistency(ctx);
        let used_historical_context = ctx
            .historical
            .as_ref()
            .map(|h| h.is_available())
            .unwrap_or(false);

        let mut scan = match self.model_scan(ctx).await {
            Ok(model_scan) => {
                let mut flags = model_scan.flags;
                flags.extend(deterministic);

                let without_evidence: Vec<String> = flags
                    .iter()
                    .filter(|f| f.evidence.is_empty())
                    .map(|f| f.code.clone())
                    .collect();

                let (flags, safety_violations) = screen_flags(flags);

                let mut unknowns = model_scan.unknowns;
                if !without_evidence.is_empty() {
                    unknowns.push(format!(
                        "Flags without evidence references: {}",
                        without_evidence.join(", ")
                    ));
                }

                RiskScan {
                    flags,
                    assumptions: model_scan.assumptions,
                    unknowns,
                    used_historical_context,
                    safety_violations,
                    scan_error: None,
                }
            }
            Err(error) => {
                warn!(%error, "risk model unavailable, deterministic checks only");
                RiskScan {
                    flags: deterministic,
                    assumptions: Vec::new(),
                    unknowns: vec!["Model-based risk scan unavailable".to_string()],
                    used_historical_context,
                    safety_violations: Vec::new(),
                    scan_error: Some(error),
                }
            }
        };

        scan.flags.sort_by(|a, b| b.severity.cmp(&a.severity));

        let high = scan.flags.iter().filter(|f| f.severity == Severity::High).count();
        let summary = json!({
            "flag_count": scan.flags.len(),
            "high_severity": high,
            "used_historical_context": scan.used_historical_context,
            "degraded": scan.scan_error.is_some(),
        });

        Ok(ToolOutput {
            summary,
            confidence: Some(json!({
                "assumptions": scan.assumptions.len(),
                "unknowns": scan.unknowns.len(),
            })),
            update: ContextUpdate::Risk(scan),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use precheck_core::{
        Appraisal, AngleReading, OdometerReading, PhotoAngle, VehicleMetadata, VinReading,
        VisionEnvelope, VisionExtraction,
    };
    use uuid::Uuid;

    fn ctx_with(metadata: VehicleMetadata, envelopes: Vec<VisionEnvelope>) -> EvidenceContext {
        let appraisal = Appraisal {
            id: Uuid::new_v4(),
            short_code: "RISK".to_string(),
            metadata,
            notes: None,
            latest_run_id: None,
            created_at: Utc::now(),
        };
        let mut ctx = EvidenceContext::new(appraisal, Vec::new());
        ctx.envelopes = envelopes;
        ctx
    }

    fn envelope_with(odometer: Option<f64>, vin: Option<&str>) -> VisionEnvelope {
        VisionEnvelope {
            photo_id: "p0".to_string(),
            extraction: VisionExtraction {
                photo_angle: AngleReading {
                    angle: PhotoAngle::Odometer,
                    confidence: 0.9,
                },
                odometer: OdometerReading {
                    value: odometer,
                    unit: None,
                    confidence: if odometer.is_some() { 0.9 } else { 0.0 },
                },
                vin: VinReading {
                    text: vin.map(str::to_string),
                    confidence: if vin.is_some() { 0.9 } else { 0.0 },
                },
                damage: Vec::new(),
            },
            plausibility_warnings: Vec::new(),
            validation_error: None,
        }
    }

    #[test]
    fn test_odometer_mismatch_flagged_medium() {
        let metadata = VehicleMetadata {
            mileage: Some(50_000.0),
            ..Default::default()
        };
        let ctx = ctx_with(metadata, vec![envelope_with(Some(62_000.0), None)]);

        let flags = check_metadata_consistency(&ctx);
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].code, "METADATA_ODOMETER_MISMATCH");
        assert_eq!(flags[0].severity, Severity::Medium);
        assert!(!flags[0].evidence.is_empty());
    }

    #[test]
    fn test_close_odometer_not_flagged() {
        let metadata = VehicleMetadata {
            mileage: Some(50_000.0),
            ..Default::default()
        };
        let ctx = ctx_with(metadata, vec![envelope_with(Some(50_060.0), None)]);
        assert!(check_metadata_consistency(&ctx).is_empty());
    }

    #[test]
    fn test_vin_mismatch_flagged_high() {
        let metadata = VehicleMetadata {
            vin: Some("1M8GDM9AXKP042788".to_string()),
            ..Default::default()
        };
        let ctx = ctx_with(metadata, vec![envelope_with(None, Some("5YJSA1E26MF000001"))]);

        let flags = check_metadata_consistency(&ctx);
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].code, "METADATA_VIN_MISMATCH");
        assert_eq!(flags[0].severity, Severity::High);
    }

    #[test]
    fn test_matching_vin_not_flagged() {
        let metadata = VehicleMetadata {
            vin: Some("1m8gdm9axkp042788".to_string()),
            ..Default::default()
        };
        let ctx = ctx_with(metadata, vec![envelope_with(None, Some("1M8GDM9AXKP042788"))]);
        assert!(check_metadata_consistency(&ctx).is_empty());
    }

    #[test]
    fn test_safety_screen_drops_pricing_and_accusations() {
        let flags = vec![
            RiskFlag {
                code: "OK_FLAG".to_string(),
                severity: Severity::Low,
                message: "Odometer photo is blurry".to_string(),
                evidence: Vec::new(),
            },
            RiskFlag {
                code: "PRICE_FLAG".to_string(),
                severity: Severity::High,
                message: "Asking price seems too high".to_string(),
                evidence: Vec::new(),
            },
            RiskFlag {
                code: "FRAUD_FLAG".to_string(),
                severity: Severity::High,
                message: "This looks like fraud".to_string(),
                evidence: Vec::new(),
            },
        ];

        let (kept, violations) = screen_flags(flags);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].code, "OK_FLAG");
        assert_eq!(violations.len(), 2);
    }
}
