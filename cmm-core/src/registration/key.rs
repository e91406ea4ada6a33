//! Parsed registration keys
//!
//! A provider announces itself with a key such as
//! `org/oyranos/openicc/icc._lcm2.7_gpu`. Segments are separated by `/`,
//! attributes inside a segment by `.`. Attributes in keys may carry the same
//! marker and stage prefixes that patterns use; they are stripped here and
//! only the bare names take part in matching.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CMMError, Result};

/// Character that starts an optional attribute
pub const OPTIONAL_MARKER: char = '_';
/// Character that starts a forbidden attribute
pub const FORBIDDEN_MARKER: char = '-';
/// Character that starts an explicitly mandatory attribute
pub const MANDATORY_MARKER: char = '+';

/// Splits a leading `<stage digit><marker>` or `<marker>` prefix.
///
/// Returns the stage number (4 to 9), the marker character and the rest.
pub(crate) fn split_prefix(token: &str) -> (Option<u8>, Option<char>, &str) {
    let mut chars = token.chars();
    let first = chars.next();
    let second = chars.next();

    match (first, second) {
        (Some(d @ '4'..='9'), Some(m)) if is_marker(m) => {
            let stage = d as u8 - b'0';
            (Some(stage), Some(m), &token[2..])
        }
        (Some(m), _) if is_marker(m) => (None, Some(m), &token[1..]),
        _ => (None, None, token),
    }
}

pub(crate) fn is_marker(c: char) -> bool {
    c == OPTIONAL_MARKER || c == FORBIDDEN_MARKER || c == MANDATORY_MARKER
}

/// One attribute of a key segment with its markers removed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAttribute {
    /// Bare attribute name
    pub name: String,
    /// Marked with `_` in the key text, naming an implementation detail
    pub implementation: bool,
}

/// One `/`-separated segment of a key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySegment {
    pub attributes: Vec<KeyAttribute>,
}

impl KeySegment {
    fn parse(text: &str) -> Self {
        let attributes = text
            .split('.')
            .filter(|raw| !raw.is_empty())
            .filter_map(|raw| {
                let (_, marker, name) = split_prefix(raw);
                if name.is_empty() {
                    return None;
                }
                Some(KeyAttribute {
                    name: name.to_string(),
                    implementation: marker == Some(OPTIONAL_MARKER),
                })
            })
            .collect();
        Self { attributes }
    }

    /// Whether the segment carries an attribute with this bare name
    pub fn contains(&self, name: &str) -> bool {
        self.attributes.iter().any(|a| a.name == name)
    }

    /// First attribute name, or empty for an empty segment
    pub fn name(&self) -> &str {
        self.attributes.first().map(|a| a.name.as_str()).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

/// A provider's registration key, parsed once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RegistrationKey {
    text: String,
    segments: Vec<KeySegment>,
}

impl RegistrationKey {
    /// Parse key text.
    ///
    /// Keys are lenient: empty attributes are skipped. A key with no
    /// attributes at all is rejected.
    pub fn parse(text: &str) -> Result<Self> {
        let segments: Vec<KeySegment> = text.split('/').map(KeySegment::parse).collect();

        if segments.iter().all(KeySegment::is_empty) {
            return Err(CMMError::format(text, "registration key has no attributes"));
        }

        Ok(Self {
            text: text.to_string(),
            segments,
        })
    }

    /// Original key text
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn segments(&self) -> &[KeySegment] {
        &self.segments
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Last segment, the one single-segment patterns are compared against
    pub fn last_segment(&self) -> &KeySegment {
        // parse() guarantees at least one segment
        &self.segments[self.segments.len() - 1]
    }

    /// Key name: the first attribute of the last segment
    ///
    /// `org/oyranos/openicc/icc._lcm2` has the key name `icc`.
    pub fn key_name(&self) -> &str {
        self.last_segment().name()
    }

    /// Canonical text with implementation (`_`) attributes and all markers
    /// removed. Two providers with equal stripped keys are doubles of the
    /// same functionality.
    pub fn strip_implementation_attributes(&self) -> String {
        self.segments
            .iter()
            .map(|segment| {
                segment
                    .attributes
                    .iter()
                    .filter(|a| !a.implementation)
                    .map(|a| a.name.as_str())
                    .collect::<Vec<_>>()
                    .join(".")
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl fmt::Display for RegistrationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl std::str::FromStr for RegistrationKey {
    type Err = CMMError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RegistrationKey {
    type Error = CMMError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<RegistrationKey> for String {
    fn from(key: RegistrationKey) -> Self {
        key.text
    }
}

/// Extracts the key name from property-style text such as
/// `org/oyranos/openicc/manufacturer` or `rendering_intent`.
pub fn key_name_of(text: &str) -> &str {
    let last = text.rsplit('/').next().unwrap_or(text);
    let first = last.split('.').next().unwrap_or(last);
    let (_, _, name) = split_prefix(first);
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_segments_and_attributes() {
        let key = RegistrationKey::parse("org/oyranos/openicc/icc._lcm2.7_gpu").unwrap();
        assert_eq!(key.segment_count(), 4);
        let last = key.last_segment();
        assert!(last.contains("icc"));
        assert!(last.contains("lcm2"));
        assert!(last.contains("gpu"));
        assert!(!last.contains("_lcm2"));
        assert_eq!(key.key_name(), "icc");
    }

    #[test]
    fn test_strip_implementation_attributes() {
        let a = RegistrationKey::parse("org/oyranos/openicc/icc._lcm2").unwrap();
        let b = RegistrationKey::parse("org/oyranos/openicc/icc._lcms").unwrap();
        let c = RegistrationKey::parse("org/oyranos/openicc/icc.lcms").unwrap();
        assert_eq!(
            a.strip_implementation_attributes(),
            b.strip_implementation_attributes()
        );
        assert_ne!(
            a.strip_implementation_attributes(),
            c.strip_implementation_attributes()
        );
        assert_eq!(a.strip_implementation_attributes(), "org/oyranos/openicc/icc");
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(RegistrationKey::parse("").is_err());
        assert!(RegistrationKey::parse("//.").is_err());
    }

    #[test]
    fn test_lenient_empty_attributes() {
        let key = RegistrationKey::parse("org//d/app..X").unwrap();
        assert_eq!(key.segment_count(), 4);
        assert!(key.segments()[1].is_empty());
        assert_eq!(key.last_segment().attributes.len(), 2);
    }

    #[test]
    fn test_key_name_of_property_text() {
        assert_eq!(key_name_of("org/oyranos/openicc/manufacturer"), "manufacturer");
        assert_eq!(key_name_of("rendering_intent"), "rendering_intent");
        assert_eq!(key_name_of("//color/icc.lcms"), "icc");
    }

    #[test]
    fn test_serde_round_trip_keeps_text() {
        let key = RegistrationKey::parse("org/oyranos/d/t/app.X.Y").unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"org/oyranos/d/t/app.X.Y\"");
        let back: RegistrationKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
