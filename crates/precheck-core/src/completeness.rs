//! Evidence completeness: a pure check over the canonical angle checklist.
//!
//! No external calls. The report is derived entirely from the vision
//! envelopes collected so far, so the controller can run it at any point
//! in the tool sequence.

use serde::{Deserialize, Serialize};

use crate::domain::{PhotoAngle, VisionEnvelope, REQUIRED_ANGLES};
use crate::scoring::{score_angle_coverage, ScoringWeights};

/// Presence of a single evidence field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceStatus {
    Found,
    Missing,
}

/// Result of the completeness check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletenessReport {
    pub covered_angles: Vec<PhotoAngle>,
    pub missing_angles: Vec<PhotoAngle>,
    pub photo_count: usize,
    pub odometer_status: EvidenceStatus,
    pub identifier_status: EvidenceStatus,
    /// Human-readable list of what is still needed.
    pub missing_evidence: Vec<String>,
    pub is_complete: bool,
}

/// Assess completeness of the evidence collected so far.
pub fn assess(envelopes: &[VisionEnvelope]) -> CompletenessReport {
    let coverage = score_angle_coverage(envelopes, &ScoringWeights::default());

    let odometer_found = envelopes.iter().any(|e| {
        e.extraction.odometer.value.is_some() && e.extraction.odometer.confidence > 0.0
    });
    let identifier_found = envelopes
        .iter()
        .any(|e| e.extraction.vin.text.is_some() && e.extraction.vin.confidence > 0.0);

    let mut missing_evidence = Vec::new();
    if !coverage.missing.is_empty() {
        let names: Vec<&str> = coverage.missing.iter().map(|a| a.as_str()).collect();
        missing_evidence.push(format!("Missing photo angles: {}", names.join(", ")));
    }
    if !odometer_found {
        missing_evidence.push("Odometer reading unclear or missing".to_string());
    }
    if !identifier_found {
        missing_evidence.push("Vehicle identifier unclear or missing".to_string());
    }

    let is_complete = coverage.missing.is_empty() && odometer_found;

    CompletenessReport {
        covered_angles: coverage.covered,
        missing_angles: coverage.missing,
        photo_count: envelopes.len(),
        odometer_status: if odometer_found {
            EvidenceStatus::Found
        } else {
            EvidenceStatus::Missing
        },
        identifier_status: if identifier_found {
            EvidenceStatus::Found
        } else {
            EvidenceStatus::Missing
        },
        missing_evidence,
        is_complete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        AngleReading, OdometerReading, VinReading, VisionExtraction,
    };

    fn envelope(angle: PhotoAngle, conf: f64) -> VisionEnvelope {
        VisionEnvelope {
            photo_id: format!("photo-{}", angle.as_str()),
            extraction: VisionExtraction {
                photo_angle: AngleReading {
                    angle,
                    confidence: conf,
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
            validation_error: None,
        }
    }

    #[test]
    fn test_empty_evidence_is_incomplete() {
        let report = assess(&[]);
        assert_eq!(report.photo_count, 0);
        assert_eq!(report.missing_angles.len(), REQUIRED_ANGLES.len());
        assert_eq!(report.odometer_status, EvidenceStatus::Missing);
        assert!(!report.is_complete);
        assert_eq!(report.missing_evidence.len(), 3);
    }

    #[test]
    fn test_full_coverage_with_odometer_is_complete() {
        let mut envs: Vec<VisionEnvelope> = REQUIRED_ANGLES
            .iter()
            .map(|a| envelope(*a, 0.95))
            .collect();
        envs[5].extraction.odometer = OdometerReading {
            value: Some(88_000.0),
            unit: None,
            confidence: 0.8,
        };

        let report = assess(&envs);
        assert!(report.missing_angles.is_empty());
        assert_eq!(report.odometer_status, EvidenceStatus::Found);
        assert!(report.is_complete);
        // Identifier is a bonus, not a completeness requirement.
        assert_eq!(report.identifier_status, EvidenceStatus::Missing);
    }

    #[test]
    fn test_partial_coverage_lists_missing_angles() {
        let envs = vec![envelope(PhotoAngle::Front, 0.9), envelope(PhotoAngle::Rear, 0.9)];
        let report = assess(&envs);
        assert_eq!(report.covered_angles.len(), 2);
        assert_eq!(report.missing_angles.len(), 4);
        assert!(report.missing_evidence[0].contains("left"));
        assert!(!report.is_complete);
    }
}
