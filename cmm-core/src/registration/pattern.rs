//! Parsed registration patterns
//!
//! ```text
//!   //color/icc.lcms._fast.-legacy.7_gpu
//!   │ │     │   │    │     │       └─ optional, only compared at stage 7
//!   │ │     │   │    │     └─ forbidden
//!   │ │     │   │    └─ optional, feeds ranking
//!   │ │     │   └─ mandatory
//!   │ │     └─ mandatory segment name
//!   └─┴─ empty segments are wildcards
//! ```
//!
//! A `+` inside an attribute starts another explicitly mandatory attribute,
//! so `app+X` is the same request as `app.+X`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CMMError, Result};

use super::key::{split_prefix, FORBIDDEN_MARKER, MANDATORY_MARKER, OPTIONAL_MARKER};

/// How a pattern attribute constrains a key segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeMarker {
    /// Must be present (unmarked or `+`)
    Mandatory,
    /// May be present, counts towards the score (`_`)
    Optional,
    /// Must be absent (`-`)
    Forbidden,
}

impl AttributeMarker {
    fn from_char(c: Option<char>) -> Self {
        match c {
            Some(OPTIONAL_MARKER) => AttributeMarker::Optional,
            Some(FORBIDDEN_MARKER) => AttributeMarker::Forbidden,
            _ => AttributeMarker::Mandatory,
        }
    }
}

/// One attribute of a pattern segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternAttribute {
    pub name: String,
    pub marker: AttributeMarker,
    /// Stage this attribute is bound to, if any
    pub stage: Option<u8>,
}

impl PatternAttribute {
    /// Stage-bound attributes take part only when the stages agree
    pub fn applies_at(&self, stage: Option<u8>) -> bool {
        match self.stage {
            None => true,
            Some(bound) => stage == Some(bound),
        }
    }
}

/// One `/`-separated segment of a pattern; no attributes means wildcard
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSegment {
    pub attributes: Vec<PatternAttribute>,
}

impl PatternSegment {
    pub fn is_wildcard(&self) -> bool {
        self.attributes.is_empty()
    }

    fn parse(segment: &str, text: &str) -> Result<Self> {
        if segment.is_empty() {
            return Ok(Self::default());
        }

        let mut attributes = Vec::new();
        for token in segment.split('.') {
            if token.is_empty() {
                return Err(CMMError::format(text, format!("empty attribute in '{}'", segment)));
            }
            parse_token(token, text, &mut attributes)?;
        }
        Ok(Self { attributes })
    }
}

fn parse_token(token: &str, text: &str, out: &mut Vec<PatternAttribute>) -> Result<()> {
    let (stage, marker, rest) = split_prefix(token);
    let mut parts = rest.split(MANDATORY_MARKER);

    let first = parts.next().unwrap_or("");
    if first.is_empty() {
        return Err(CMMError::format(
            text,
            format!("marker without attribute name in '{}'", token),
        ));
    }
    out.push(PatternAttribute {
        name: first.to_string(),
        marker: AttributeMarker::from_char(marker),
        stage,
    });

    for part in parts {
        if part.is_empty() {
            return Err(CMMError::format(text, format!("dangling '+' in '{}'", token)));
        }
        if part.starts_with(OPTIONAL_MARKER) || part.starts_with(FORBIDDEN_MARKER) {
            return Err(CMMError::format(text, format!("conflicting markers in '{}'", token)));
        }
        out.push(PatternAttribute {
            name: part.to_string(),
            marker: AttributeMarker::Mandatory,
            stage: None,
        });
    }
    Ok(())
}

/// A capability request, parsed once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RegistrationPattern {
    text: String,
    segments: Vec<PatternSegment>,
    key_filter: bool,
}

impl RegistrationPattern {
    /// Parse pattern text, rejecting malformed attribute lists
    pub fn parse(text: &str) -> Result<Self> {
        if text.is_empty() {
            return Ok(Self::any());
        }

        let segments = text
            .split('/')
            .map(|segment| PatternSegment::parse(segment, text))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            text: text.to_string(),
            key_filter: !text.contains('/'),
            segments,
        })
    }

    /// The empty pattern, matching every key
    pub fn any() -> Self {
        Self {
            text: String::new(),
            segments: Vec::new(),
            key_filter: false,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn segments(&self) -> &[PatternSegment] {
        &self.segments
    }

    /// Matches everything
    pub fn is_any(&self) -> bool {
        self.segments.iter().all(PatternSegment::is_wildcard)
    }

    /// Pattern without `/`, compared against a key's last segment only
    pub fn is_key_filter(&self) -> bool {
        self.key_filter
    }
}

impl Default for RegistrationPattern {
    fn default() -> Self {
        Self::any()
    }
}

impl fmt::Display for RegistrationPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl std::str::FromStr for RegistrationPattern {
    type Err = CMMError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RegistrationPattern {
    type Error = CMMError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<RegistrationPattern> for String {
    fn from(pattern: RegistrationPattern) -> Self {
        pattern.text
    }
}
