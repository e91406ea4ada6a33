//! Registration Matcher - structural comparison of keys against patterns
//!
//! Segments are compared position by position from the left. For every
//! attribute of a pattern segment that applies at the requested stage:
//! - forbidden and present in the key segment: no match
//! - mandatory and absent: no match
//! - mandatory or optional and present: one point
//!
//! Key segments beyond the end of the pattern are unconstrained. A pattern
//! with more segments than the key never matches.

use super::key::{KeySegment, RegistrationKey};
use super::pattern::{AttributeMarker, PatternSegment, RegistrationPattern};

/// Compares one pattern segment with one key segment.
///
/// Returns the number of positive attribute hits, or `None` if a forbidden
/// attribute is present or a mandatory one is missing.
fn match_segment(key: &KeySegment, pattern: &PatternSegment, stage: Option<u8>) -> Option<u32> {
    let mut hits = 0u32;

    for attribute in pattern.attributes.iter().filter(|a| a.applies_at(stage)) {
        let present = key.contains(&attribute.name);
        match (attribute.marker, present) {
            (AttributeMarker::Forbidden, true) => return None,
            (AttributeMarker::Forbidden, false) => {}
            (AttributeMarker::Mandatory, false) => return None,
            (AttributeMarker::Mandatory, true) | (AttributeMarker::Optional, true) => hits += 1,
            (AttributeMarker::Optional, false) => {}
        }
    }

    Some(hits)
}

/// Structural match score of `key` against `pattern` at `stage`.
///
/// `None` means no match. A match without any attribute hits (for instance
/// against the empty pattern) scores 1 so that it still ranks above nothing.
pub fn match_score(key: &RegistrationKey, pattern: &RegistrationPattern, stage: Option<u8>) -> Option<u32> {
    let segments = pattern.segments();

    let hits = if pattern.is_any() {
        0
    } else if pattern.is_key_filter() {
        match_segment(key.last_segment(), &segments[0], stage)?
    } else {
        if segments.len() > key.segment_count() {
            return None;
        }
        let mut total = 0u32;
        for (key_segment, pattern_segment) in key.segments().iter().zip(segments) {
            total += match_segment(key_segment, pattern_segment, stage)?;
        }
        total
    };

    Some(hits.max(1))
}

/// Whether `key` satisfies `pattern` at `stage`
pub fn matches(key: &RegistrationKey, pattern: &RegistrationPattern, stage: Option<u8>) -> bool {
    match_score(key, pattern, stage).is_some()
}

/// Text form of [`matches`]; malformed input never matches.
pub fn matches_text(key: &str, pattern: &str, stage: Option<u8>) -> bool {
    let key = match RegistrationKey::parse(key) {
        Ok(key) => key,
        Err(_) => return false,
    };
    match RegistrationPattern::parse(pattern) {
        Ok(pattern) => matches(&key, &pattern, stage),
        Err(err) => {
            tracing::debug!("Pattern rejected as non-match: {}", err);
            false
        }
    }
}

impl RegistrationPattern {
    /// See [`matches`]
    pub fn matches(&self, key: &RegistrationKey, stage: Option<u8>) -> bool {
        matches(key, self, stage)
    }

    /// See [`match_score`]
    pub fn score(&self, key: &RegistrationKey, stage: Option<u8>) -> Option<u32> {
        match_score(key, self, stage)
    }
}
