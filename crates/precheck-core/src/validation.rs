//! Input validation for metadata, notes, idempotency keys, and VINs.
//!
//! Everything here runs before a run starts; a rejection here is a
//! `ValidationError` and nothing is persisted.

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::VehicleMetadata;

/// Maximum accepted notes length, in characters.
pub const MAX_NOTES_LEN: usize = 10_000;

/// VIN check-digit weights by position (ISO 3779).
const VIN_WEIGHTS: [u32; 17] = [8, 7, 6, 5, 4, 3, 2, 10, 0, 9, 8, 7, 6, 5, 4, 3, 2];

lazy_static! {
    /// Valid VIN characters: A–Z and 0–9, excluding I, O, Q.
    static ref VIN_CHARSET: Regex = Regex::new(r"^[A-HJ-NPR-Z0-9]{17}$").unwrap();
}

/// Rejection raised before any pipeline work begins.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("metadata validation failed: {}", .0.join("; "))]
    Metadata(Vec<String>),

    #[error("notes exceed maximum length of {max} characters (got {len})")]
    NotesTooLong { len: usize, max: usize },

    #[error("idempotency key is required")]
    MissingIdempotencyKey,

    #[error("idempotency key must be a valid UUID")]
    MalformedIdempotencyKey,

    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("artifact exceeds size limit of {max} bytes (got {size})")]
    ArtifactTooLarge { size: u64, max: u64 },

    #[error("appraisal already has the maximum of {max} photos")]
    TooManyArtifacts { max: usize },

    #[error("duplicate artifact content")]
    DuplicateArtifact,
}

/// Numeric transliteration of a VIN character, per ISO 3779.
fn vin_char_value(c: char) -> Option<u32> {
    match c {
        '0'..='9' => Some(c as u32 - '0' as u32),
        'A' => Some(1),
        'B' => Some(2),
        'C' => Some(3),
        'D' => Some(4),
        'E' => Some(5),
        'F' => Some(6),
        'G' => Some(7),
        'H' => Some(8),
        'J' => Some(1),
        'K' => Some(2),
        'L' => Some(3),
        'M' => Some(4),
        'N' => Some(5),
        'P' => Some(7),
        'R' => Some(9),
        'S' => Some(2),
        'T' => Some(3),
        'U' => Some(4),
        'V' => Some(5),
        'W' => Some(6),
        'X' => Some(7),
        'Y' => Some(8),
        'Z' => Some(9),
        _ => None,
    }
}

/// Validate the VIN check digit (9th character).
///
/// Returns false for any VIN that is not 17 characters, contains characters
/// outside the VIN alphabet, or whose computed check digit does not match.
pub fn validate_vin_check_digit(vin: &str) -> bool {
    let vin = vin.to_ascii_uppercase();
    if vin.len() != 17 {
        return false;
    }

    let mut total = 0u32;
    for (i, c) in vin.chars().enumerate() {
        if i == 8 {
            continue; // check-digit position
        }
        match vin_char_value(c) {
            Some(v) => total += v * VIN_WEIGHTS[i],
            None => return false,
        }
    }

    let check = total % 11;
    let expected = if check == 10 {
        'X'
    } else {
        char::from_digit(check, 10).unwrap_or('?')
    };

    vin.chars().nth(8) == Some(expected)
}

/// Whether the VIN uses only the legal character set (17 chars, no I/O/Q).
pub fn vin_charset_valid(vin: &str) -> bool {
    VIN_CHARSET.is_match(&vin.to_ascii_uppercase())
}

/// Validate an idempotency key: required, UUID format.
pub fn validate_idempotency_key(key: Option<&str>) -> Result<(), ValidationError> {
    let key = key.ok_or(ValidationError::MissingIdempotencyKey)?;
    if key.is_empty() {
        return Err(ValidationError::MissingIdempotencyKey);
    }
    Uuid::parse_str(key).map_err(|_| ValidationError::MalformedIdempotencyKey)?;
    Ok(())
}

/// Validate notes length. Notes are optional.
pub fn validate_notes(notes: Option<&str>) -> Result<(), ValidationError> {
    if let Some(n) = notes {
        if n.chars().count() > MAX_NOTES_LEN {
            return Err(ValidationError::NotesTooLong {
                len: n.chars().count(),
                max: MAX_NOTES_LEN,
            });
        }
    }
    Ok(())
}

/// Strip null bytes and control characters (keeping newlines and tabs) and
/// truncate to the maximum notes length.
pub fn sanitize_notes(notes: Option<&str>) -> Option<String> {
    notes.map(|n| {
        n.chars()
            .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
            .take(MAX_NOTES_LEN)
            .collect()
    })
}

/// Validate metadata bounds. Collects every violation rather than stopping
/// at the first, so callers can report them all at once.
pub fn validate_metadata(metadata: &VehicleMetadata) -> Result<(), ValidationError> {
    let mut errors = Vec::new();

    if let Some(year) = metadata.year {
        if !(1900..=2030).contains(&year) {
            errors.push(format!("year {year} must be between 1900 and 2030"));
        }
    }

    if let Some(mileage) = metadata.mileage {
        if mileage < 0.0 {
            errors.push("mileage cannot be negative".to_string());
        } else if mileage > 1_000_000.0 {
            errors.push("mileage cannot exceed 1,000,000".to_string());
        }
    }

    for (name, value) in [
        ("make", &metadata.make),
        ("model", &metadata.model),
        ("trim", &metadata.trim),
        ("color", &metadata.color),
    ] {
        if let Some(v) = value {
            if v.trim().is_empty() {
                errors.push(format!("{name} must not be blank when provided"));
            } else if v.len() > 100 {
                errors.push(format!("{name} exceeds 100 characters"));
            }
        }
    }

    if let Some(vin) = &metadata.vin {
        if vin.len() > 17 {
            errors.push(format!("vin length {} exceeds 17 characters", vin.len()));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::Metadata(errors))
    }
}
