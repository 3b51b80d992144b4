//! Decision policy: threshold routing over the readiness score.
//!
//! The policy applies fixed rules over the score card:
//! 1. total ≥ ready threshold → READY
//! 2. total < escalate threshold → ESCALATE
//! 3. otherwise → NEEDS MORE EVIDENCE
//!
//! Risk flags already entered the total as a capped deduction, so routing
//! is a pure function of the card. These thresholds are routing machinery,
//! not a tuning toy.

use serde::{Deserialize, Serialize};

use crate::scoring::{ScoreCard, ANGLE_CONFIDENCE_FLOOR};

/// Routing thresholds. Part of the immutable runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionThresholds {
    /// Minimum total for a READY decision.
    pub ready: u32,
    /// Totals below this escalate to a senior reviewer.
    pub escalate_below: u32,
}

impl Default for DecisionThresholds {
    fn default() -> Self {
        Self {
            ready: 80,
            escalate_below: 50,
        }
    }
}

/// Final routing decision for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Ready,
    NeedsMoreEvidence,
    Escalate,
}

/// Recommended next action for the decision status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextAction {
    pub action: String,
    pub message: String,
}

/// The decision attached to a run's outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub status: DecisionStatus,
    pub score: u32,
    /// Ordered human-readable reasons for the routing.
    pub reasons: Vec<String>,
    pub next_action: NextAction,
}

/// Map a decision status to its next action.
pub fn route_action(status: DecisionStatus) -> NextAction {
    match status {
        DecisionStatus::Ready => NextAction {
            action: "route_to_adjuster_queue".to_string(),
            message: "Appraisal is ready for final decision processing".to_string(),
        },
        DecisionStatus::Escalate => NextAction {
            action: "route_to_senior_reviewer".to_string(),
            message: "Appraisal requires senior review".to_string(),
        },
        DecisionStatus::NeedsMoreEvidence => NextAction {
            action: "request_additional_evidence".to_string(),
            message: "Appraisal needs additional evidence before processing".to_string(),
        },
    }
}

/// What evidence is missing or weak, derived from the score breakdown.
/// Used as the reasons list for a NEEDS MORE EVIDENCE decision.
fn missing_evidence_reasons(card: &ScoreCard) -> Vec<String> {
    let mut reasons = Vec::new();

    let angles = &card.breakdown.angle_coverage;
    if !angles.missing.is_empty() {
        let names: Vec<&str> = angles.missing.iter().map(|a| a.as_str()).collect();
        reasons.push(format!("Missing photo angles: {}", names.join(", ")));
    }

    let odometer = &card.breakdown.odometer_confidence;
    if odometer.confidence < ANGLE_CONFIDENCE_FLOOR {
        reasons.push("Odometer reading unclear or missing".to_string());
    }

    let identifier = &card.breakdown.identifier_presence;
    if !identifier.present || identifier.confidence < ANGLE_CONFIDENCE_FLOOR {
        reasons.push("Vehicle identifier unclear or missing".to_string());
    }

    let notes = &card.breakdown.notes_quality;
    if notes.points < notes.max_points / 2 {
        reasons.push("Notes missing or insufficient detail".to_string());
    }

    if reasons.is_empty() {
        reasons.push(format!(
            "Score {} is below the readiness threshold",
            card.total
        ));
    }

    reasons
}

/// Apply the routing rules to a score card.
pub fn decide(card: &ScoreCard, thresholds: &DecisionThresholds) -> Decision {
    let total = card.total;
    tracing::debug!(total, ready = thresholds.ready, "routing decision");

    if total >= thresholds.ready {
        let mut reasons = vec![format!("Score {total} meets the readiness threshold")];
        let penalty = &card.breakdown.risk_penalty;
        if penalty.medium > 0 || penalty.low > 0 {
            reasons.push(format!(
                "Warning: {} non-blocking risk flag(s) present",
                penalty.medium + penalty.low
            ));
        }
        return Decision {
            status: DecisionStatus::Ready,
            score: total,
            reasons,
            next_action: route_action(DecisionStatus::Ready),
        };
    }

    if total < thresholds.escalate_below {
        let mut reasons = vec![format!(
            "Score {total} is below the escalation threshold ({})",
            thresholds.escalate_below
        )];
        let penalty = &card.breakdown.risk_penalty;
        if penalty.high > 0 {
            reasons.push(format!("{} high-severity risk flag(s)", penalty.high));
        }
        return Decision {
            status: DecisionStatus::Escalate,
            score: total,
            reasons,
            next_action: route_action(DecisionStatus::Escalate),
        };
    }

    Decision {
        status: DecisionStatus::NeedsMoreEvidence,
        score: total,
        reasons: missing_evidence_reasons(card),
        next_action: route_action(DecisionStatus::NeedsMoreEvidence),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RiskFlag, Severity, VisionEnvelope};
    use crate::scoring::{compute_score, ScoreInputs, ScoringWeights};

    fn card_for(envelopes: &[VisionEnvelope], notes: Option<&str>, flags: &[RiskFlag]) -> ScoreCard {
        compute_score(
            ScoreInputs {
                envelopes,
                notes,
                risk_flags: flags,
            },
            &ScoringWeights::default(),
        )
    }

    fn flag(severity: Severity) -> RiskFlag {
        RiskFlag {
            code: "X".to_string(),
            severity,
            message: "m".to_string(),
            evidence: Vec::new(),
        }
    }

    #[test]
    fn test_empty_evidence_escalates() {
        let card = card_for(&[], None, &[]);
        let decision = decide(&card, &DecisionThresholds::default());
        assert_eq!(decision.status, DecisionStatus::Escalate);
        assert_eq!(decision.score, 0);
    }

    #[test]
    fn test_mid_score_needs_more_evidence() {
        // Notes alone (20) plus nothing else lands below 50; craft a card in
        // the middle band from notes + a synthetic angle set.
        use crate::domain::{AngleReading, OdometerReading, PhotoAngle, VinReading, VisionExtraction};

        let envs: Vec<VisionEnvelope> = [
            PhotoAngle::Front,
            PhotoAngle::Rear,
            PhotoAngle::Left,
            PhotoAngle::Right,
            PhotoAngle::Interior,
        ]
        .iter()
        .map(|a| VisionEnvelope {
            photo_id: a.as_str().to_string(),
            extraction: VisionExtraction {
                photo_angle: AngleReading {
                    angle: *a,
                    confidence: 1.0,
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
        })
        .collect();

        let notes = "n".repeat(200);
        let card = card_for(&envs, Some(&notes), &[]);
        assert_eq!(card.total, 60); // 40 angles + 20 notes

        let decision = decide(&card, &DecisionThresholds::default());
        assert_eq!(decision.status, DecisionStatus::NeedsMoreEvidence);
        assert!(decision
            .reasons
            .iter()
            .any(|r| r.contains("odometer") || r.contains("Odometer")));
        assert_eq!(decision.next_action.action, "request_additional_evidence");
    }

    #[test]
    fn test_ready_mentions_non_blocking_flags() {
        let weights = ScoringWeights::default();
        let envs: Vec<VisionEnvelope> = crate::domain::REQUIRED_ANGLES
            .iter()
            .map(|a| {
                use crate::domain::{AngleReading, OdometerReading, VinReading, VisionExtraction};
                VisionEnvelope {
                    photo_id: a.as_str().to_string(),
                    extraction: VisionExtraction {
                        photo_angle: AngleReading {
                            angle: *a,
                            confidence: 1.0,
                        },
                        odometer: OdometerReading {
                            value: Some(10_000.0),
                            unit: None,
                            confidence: 1.0,
                        },
                        vin: VinReading {
                            text: Some("1M8GDM9AXKP042788".to_string()),
                            confidence: 1.0,
                        },
                        damage: Vec::new(),
                    },
                    plausibility_warnings: Vec::new(),
                    validation_error: None,
                }
            })
            .collect();
        let notes = "n".repeat(200);
        let card = compute_score(
            ScoreInputs {
                envelopes: &envs,
                notes: Some(&notes),
                risk_flags: &[flag(Severity::Low)],
            },
            &weights,
        );
        assert_eq!(card.total, 92); // 93 minus one low flag

        let decision = decide(&card, &DecisionThresholds::default());
        assert_eq!(decision.status, DecisionStatus::Ready);
        assert!(decision.reasons.iter().any(|r| r.contains("non-blocking")));
    }

    #[test]
    fn test_decision_is_deterministic() {
        let card = card_for(&[], Some("some moderately detailed notes here"), &[]);
        let a = decide(&card, &DecisionThresholds::default());
        let b = decide(&card, &DecisionThresholds::default());
        assert_eq!(a, b);
    }
}
