//! Readiness scoring: a fixed 100-point budget over the collected evidence.
//!
//! Scoring is a pure function of its inputs. No model calls, no clocks, no
//! randomness: identical evidence and risk flags always yield an identical
//! score, breakdown, and reasons. Audit reproducibility depends on this.
//!
//! Budget:
//! - angle coverage: 48 pts (8 per required angle, confidence-scaled)
//! - odometer confidence: 15 pts
//! - identifier presence: 10 pts
//! - notes quality: 20 pts
//! - risk-flag penalty: deduction, capped (7 pts by default)

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{
    DistanceUnit, PhotoAngle, RiskFlag, Severity, VisionEnvelope, REQUIRED_ANGLES,
};

/// Minimum classification confidence for an angle to count as covered.
pub const ANGLE_CONFIDENCE_FLOOR: f64 = 0.7;

/// Confidence damping when odometer units disagree across photos.
const ODOMETER_UNIT_DAMP: f64 = 0.3;

/// Confidence damping when odometer values spread by more than this.
const ODOMETER_VALUE_SPREAD: f64 = 100.0;
const ODOMETER_VALUE_DAMP: f64 = 0.5;

/// Confidence damping when photos disagree on the identifier text.
const IDENTIFIER_MISMATCH_DAMP: f64 = 0.8;

/// Point weights for the scoring budget. Constructed once at startup as
/// part of the runtime configuration; never mutated mid-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringWeights {
    /// Points per covered required angle.
    pub angle_points_each: u32,
    /// Maximum points for odometer confidence.
    pub odometer_max: u32,
    /// Maximum points for identifier presence.
    pub identifier_max: u32,
    /// Maximum points for notes quality.
    pub notes_max: u32,
    /// Cap on the total risk-flag deduction.
    pub risk_penalty_cap: u32,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            angle_points_each: 8,
            odometer_max: 15,
            identifier_max: 10,
            notes_max: 20,
            risk_penalty_cap: 7,
        }
    }
}

impl ScoringWeights {
    /// The full budget before deductions.
    pub fn max_total(&self) -> u32 {
        self.angle_points_each * REQUIRED_ANGLES.len() as u32
            + self.odometer_max
            + self.identifier_max
            + self.notes_max
    }
}

/// Inputs to the scoring function. Borrowed views over the evidence context.
#[derive(Debug, Clone, Copy)]
pub struct ScoreInputs<'a> {
    pub envelopes: &'a [VisionEnvelope],
    pub notes: Option<&'a str>,
    pub risk_flags: &'a [RiskFlag],
}

/// Angle-coverage category result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AngleCoverage {
    pub points: u32,
    pub max_points: u32,
    /// Required angles seen at or above the confidence floor, sorted.
    pub covered: Vec<PhotoAngle>,
    /// Required angles still missing, in checklist order.
    pub missing: Vec<PhotoAngle>,
    /// Best classification confidence per covered angle.
    pub confidence: BTreeMap<PhotoAngle, f64>,
    pub reason: String,
}

/// Odometer-confidence category result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OdometerScore {
    pub points: u32,
    pub max_points: u32,
    /// Consistency-adjusted confidence of the best reading.
    pub confidence: f64,
    pub value: Option<f64>,
    pub unit: Option<DistanceUnit>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub reason: String,
}

/// Identifier-presence category result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifierScore {
    pub points: u32,
    pub max_points: u32,
    pub present: bool,
    pub confidence: f64,
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub reason: String,
}

/// Notes-quality category result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotesScore {
    pub points: u32,
    pub max_points: u32,
    pub length: usize,
    pub reason: String,
}

/// Risk-flag deduction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskPenalty {
    /// Points deducted after the cap.
    pub points: u32,
    pub cap: u32,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub reason: String,
}

/// Per-category breakdown of the readiness score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub angle_coverage: AngleCoverage,
    pub odometer_confidence: OdometerScore,
    pub identifier_presence: IdentifierScore,
    pub notes_quality: NotesScore,
    pub risk_penalty: RiskPenalty,
}

/// Complete scoring result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreCard {
    /// Total score, 0–100.
    pub total: u32,
    pub max_total: u32,
    pub breakdown: ScoreBreakdown,
    /// Ordered human-readable reasons, one per category plus the penalty.
    pub reasons: Vec<String>,
}

/// Score required-angle coverage: `angle_points_each` per covered angle,
/// scaled by the best classification confidence for that angle.
pub fn score_angle_coverage(
    envelopes: &[VisionEnvelope],
    weights: &ScoringWeights,
) -> AngleCoverage {
    let max_points = weights.angle_points_each * REQUIRED_ANGLES.len() as u32;

    let mut confidence: BTreeMap<PhotoAngle, f64> = BTreeMap::new();
    for env in envelopes {
        let reading = &env.extraction.photo_angle;
        if reading.angle == PhotoAngle::Unknown || reading.confidence < ANGLE_CONFIDENCE_FLOOR {
            continue;
        }
        if !REQUIRED_ANGLES.contains(&reading.angle) {
            continue;
        }
        let entry = confidence.entry(reading.angle).or_insert(0.0);
        if reading.confidence > *entry {
            *entry = reading.confidence;
        }
    }

    let covered: Vec<PhotoAngle> = confidence.keys().copied().collect();
    let missing: Vec<PhotoAngle> = REQUIRED_ANGLES
        .iter()
        .copied()
        .filter(|a| !confidence.contains_key(a))
        .collect();

    let points: u32 = confidence
        .values()
        .map(|c| (weights.angle_points_each as f64 * c) as u32)
        .sum();

    let reason = if envelopes.is_empty() {
        "No photos provided".to_string()
    } else {
        let names: Vec<&str> = covered.iter().map(|a| a.as_str()).collect();
        format!(
            "Covered {}/{} required angles: {}",
            covered.len(),
            REQUIRED_ANGLES.len(),
            if names.is_empty() {
                "none".to_string()
            } else {
                names.join(", ")
            }
        )
    };

    AngleCoverage {
        points,
        max_points,
        covered,
        missing,
        confidence,
        reason,
    }
}

/// Score odometer confidence with cross-photo consistency checks.
pub fn score_odometer(envelopes: &[VisionEnvelope], weights: &ScoringWeights) -> OdometerScore {
    let max_points = weights.odometer_max;

    let readings: Vec<(&VisionEnvelope, f64, f64, Option<DistanceUnit>)> = envelopes
        .iter()
        .filter_map(|env| {
            let odo = &env.extraction.odometer;
            odo.value
                .filter(|_| odo.confidence > 0.0)
                .map(|v| (env, v, odo.confidence, odo.unit))
        })
        .collect();

    if readings.is_empty() {
        return OdometerScore {
            points: 0,
            max_points,
            confidence: 0.0,
            value: None,
            unit: None,
            warnings: Vec::new(),
            reason: "No odometer readings found".to_string(),
        };
    }

    let mut warnings = Vec::new();
    let mut damp: f64 = 0.0;

    let units: Vec<DistanceUnit> = readings.iter().filter_map(|r| r.3).collect();
    let unit_consistent = units.windows(2).all(|w| w[0] == w[1]);
    if !unit_consistent {
        damp = ODOMETER_UNIT_DAMP;
        warnings.push("Odometer units inconsistent across photos".to_string());
    }

    let values: Vec<f64> = readings.iter().map(|r| r.1).collect();
    if values.len() > 1 {
        let spread = values.iter().cloned().fold(f64::MIN, f64::max)
            - values.iter().cloned().fold(f64::MAX, f64::min);
        if spread > ODOMETER_VALUE_SPREAD {
            damp = damp.max(ODOMETER_VALUE_DAMP);
            warnings.push(format!(
                "Odometer values inconsistent (range: {spread:.0})"
            ));
        }
    }

    // Best-confidence reading wins; ties broken by first occurrence so the
    // result is stable for identical input ordering.
    let best = readings
        .iter()
        .max_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal))
        .unwrap();

    let adjusted = best.2 * (1.0 - damp);
    let points = (max_points as f64 * adjusted) as u32;

    OdometerScore {
        points,
        max_points,
        confidence: adjusted,
        value: Some(best.1),
        unit: best.3,
        warnings,
        reason: format!("Odometer confidence: {adjusted:.2}"),
    }
}

/// Score identifier (VIN) presence with cross-photo agreement checks.
pub fn score_identifier(envelopes: &[VisionEnvelope], weights: &ScoringWeights) -> IdentifierScore {
    let max_points = weights.identifier_max;

    let readings: Vec<(String, f64)> = envelopes
        .iter()
        .filter_map(|env| {
            let vin = &env.extraction.vin;
            vin.text
                .as_ref()
                .filter(|_| vin.confidence > 0.0)
                .map(|t| (t.trim().to_ascii_uppercase(), vin.confidence))
        })
        .collect();

    if readings.is_empty() {
        return IdentifierScore {
            points: 0,
            max_points,
            present: false,
            confidence: 0.0,
            text: None,
            warnings: Vec::new(),
            reason: "No identifier readings found".to_string(),
        };
    }

    let mut warnings = Vec::new();
    let mut damp: f64 = 0.0;

    let consistent = readings.windows(2).all(|w| w[0].0 == w[1].0);
    if !consistent {
        damp = IDENTIFIER_MISMATCH_DAMP;
        let mut distinct: Vec<&str> = readings.iter().map(|r| r.0.as_str()).collect();
        distinct.sort_unstable();
        distinct.dedup();
        warnings.push(format!(
            "Multiple different identifiers detected: {}",
            distinct.join(", ")
        ));
    }

    let best = readings
        .iter()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .unwrap();

    let adjusted = best.1 * (1.0 - damp);
    let points = (max_points as f64 * adjusted) as u32;

    IdentifierScore {
        points,
        max_points,
        present: true,
        confidence: adjusted,
        text: Some(best.0.clone()),
        warnings,
        reason: format!("Identifier confidence: {adjusted:.2}"),
    }
}

/// Score notes quality by presence and length tier.
pub fn score_notes(notes: Option<&str>, weights: &ScoringWeights) -> NotesScore {
    let max_points = weights.notes_max;
    let trimmed = notes.map(str::trim).unwrap_or("");
    let length = trimmed.chars().count();

    let (points, reason) = if length < 10 {
        (0, "Notes missing or too short")
    } else if length < 50 {
        (5, "Notes present but minimal")
    } else if length < 150 {
        (12, "Notes present with moderate detail")
    } else {
        (max_points, "Notes present with good detail")
    };

    NotesScore {
        points,
        max_points,
        length,
        reason: reason.to_string(),
    }
}

/// Compute the capped risk-flag deduction: high 4, medium 2, low 1.
pub fn risk_penalty(flags: &[RiskFlag], weights: &ScoringWeights) -> RiskPenalty {
    let high = flags.iter().filter(|f| f.severity == Severity::High).count();
    let medium = flags
        .iter()
        .filter(|f| f.severity == Severity::Medium)
        .count();
    let low = flags.iter().filter(|f| f.severity == Severity::Low).count();

    let raw = (high * 4 + medium * 2 + low) as u32;
    let points = raw.min(weights.risk_penalty_cap);

    let reason = if points == 0 {
        "No risk flags".to_string()
    } else {
        format!(
            "Risk deduction {points} ({high} high, {medium} medium, {low} low{})",
            if raw > points { ", capped" } else { "" }
        )
    };

    RiskPenalty {
        points,
        cap: weights.risk_penalty_cap,
        high,
        medium,
        low,
        reason,
    }
}

/// Aggregate all categories into the final score card.
///
/// Pure: same inputs always produce the same card, byte for byte.
pub fn compute_score(inputs: ScoreInputs<'_>, weights: &ScoringWeights) -> ScoreCard {
    let angle_coverage = score_angle_coverage(inputs.envelopes, weights);
    let odometer_confidence = score_odometer(inputs.envelopes, weights);
    let identifier_presence = score_identifier(inputs.envelopes, weights);
    let notes_quality = score_notes(inputs.notes, weights);
    let penalty = risk_penalty(inputs.risk_flags, weights);

    let earned = angle_coverage.points
        + odometer_confidence.points
        + identifier_presence.points
        + notes_quality.points;
    let total = earned.saturating_sub(penalty.points).min(weights.max_total());

    let mut reasons = vec![
        angle_coverage.reason.clone(),
        odometer_confidence.reason.clone(),
        identifier_presence.reason.clone(),
        notes_quality.reason.clone(),
    ];
    if penalty.points > 0 {
        reasons.push(penalty.reason.clone());
    }

    ScoreCard {
        total,
        max_total: weights.max_total(),
        breakdown: ScoreBreakdown {
            angle_coverage,
            odometer_confidence,
            identifier_presence,
            notes_quality,
            risk_penalty: penalty,
        },
        reasons,
    }
}
