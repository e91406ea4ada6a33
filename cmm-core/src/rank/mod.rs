//! Rank Evaluator - weighted key/value scoring of providers
//!
//! Each provider declares a [`RankTable`]. At resolution time the table is
//! scored against a [`PropertySnapshot`] (device or backend properties):
//!
//! ```text
//! entry "manufacturer" {match: 10, mismatch: -2, absent: 0}
//!
//!   snapshot manufacturer=EPSON, provider expects EPSON   →  +10
//!   snapshot manufacturer=HP                              →   -2
//!   snapshot without manufacturer                         →    0
//! ```
//!
//! The sum over all entries is the rank. Ranking is pure and does not depend
//! on entry or snapshot ordering.

mod value;

pub use value::{values_match, DEFAULT_FUZZY_DELTA};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::registration::key_name_of;

/// One weighted rule of a rank table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankEntry {
    /// Property key name
    pub key: String,
    /// Value the provider prefers; `None` accepts any value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    /// Added when the property is present and matches
    pub match_value: i32,
    /// Added when the property is present and differs
    #[serde(default)]
    pub mismatch_value: i32,
    /// Added when the property is absent
    #[serde(default)]
    pub absent_value: i32,
}

impl RankEntry {
    pub fn new(key: impl Into<String>, match_value: i32, mismatch_value: i32, absent_value: i32) -> Self {
        Self {
            key: key_name_of(&key.into()).to_string(),
            expected: None,
            match_value,
            mismatch_value,
            absent_value,
        }
    }

    /// Set the preferred value
    pub fn expecting(mut self, value: impl Into<String>) -> Self {
        self.expected = Some(value.into());
        self
    }
}

/// A provider's rank table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RankTable {
    entries: Vec<RankEntry>,
}

impl RankTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry
    pub fn with_entry(mut self, entry: RankEntry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn entries(&self) -> &[RankEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<RankEntry> for RankTable {
    fn from_iter<I: IntoIterator<Item = RankEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Properties a provider is ranked against
///
/// Keys are normalized to their key name, so `org/oyranos/openicc/manufacturer`
/// and `manufacturer` address the same property.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertySnapshot {
    properties: BTreeMap<String, String>,
}

impl PropertySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a property, replacing any previous value
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.properties.insert(key_name_of(key).to_string(), value.into());
    }

    /// Builder form of [`insert`](Self::insert)
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key_name_of(key)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

}

impl<'a> FromIterator<(&'a str, &'a str)> for PropertySnapshot {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        let mut snapshot = Self::new();
        for (key, value) in iter {
            snapshot.insert(key, value);
        }
        snapshot
    }
}

/// Outcome of one rank entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankOutcome {
    Match,
    Mismatch,
    Absent,
}

/// Contribution of one entry to a rank
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankContribution {
    pub key: String,
    pub outcome: RankOutcome,
    pub value: i32,
}

/// Scores rank tables against property snapshots
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RankEvaluator {
    /// Relative delta for numeric values; `None` compares strings exactly
    pub fuzzy: Option<f64>,
}

impl RankEvaluator {
    /// Exact string comparison
    pub fn exact() -> Self {
        Self { fuzzy: None }
    }

    /// Numeric comparison within `delta`
    pub fn fuzzy(delta: f64) -> Self {
        Self { fuzzy: Some(delta) }
    }

    fn outcome(
        &self,
        entry: &RankEntry,
        declared: Option<&PropertySnapshot>,
        snapshot: &PropertySnapshot,
    ) -> RankOutcome {
        let expected = entry
            .expected
            .as_deref()
            .or_else(|| declared.and_then(|d| d.get(&entry.key)));

        match snapshot.get(&entry.key) {
            None => RankOutcome::Absent,
            Some(actual) => match expected {
                None => RankOutcome::Match,
                Some(expected) if values_match(expected, actual, self.fuzzy) => RankOutcome::Match,
                Some(_) => RankOutcome::Mismatch,
            },
        }
    }

    /// Per-entry contributions, in table order
    pub fn score_breakdown(
        &self,
        table: &RankTable,
        declared: Option<&PropertySnapshot>,
        snapshot: &PropertySnapshot,
    ) -> Vec<RankContribution> {
        table
            .entries
            .iter()
            .map(|entry| {
                let outcome = self.outcome(entry, declared, snapshot);
                let value = match outcome {
                    RankOutcome::Match => entry.match_value,
                    RankOutcome::Mismatch => entry.mismatch_value,
                    RankOutcome::Absent => entry.absent_value,
                };
                RankContribution {
                    key: entry.key.clone(),
                    outcome,
                    value,
                }
            })
            .collect()
    }

    /// Sum of all entry contributions
    pub fn rank(&self, table: &RankTable, snapshot: &PropertySnapshot) -> i32 {
        self.rank_declared(table, None, snapshot)
    }

    /// Like [`rank`](Self::rank), with entries lacking an expected value
    /// taking it from the provider's `declared` properties
    pub fn rank_declared(
        &self,
        table: &RankTable,
        declared: Option<&PropertySnapshot>,
        snapshot: &PropertySnapshot,
    ) -> i32 {
        table
            .entries
            .iter()
            .map(|entry| match self.outcome(entry, declared, snapshot) {
                RankOutcome::Match => entry.match_value,
                RankOutcome::Mismatch => entry.mismatch_value,
                RankOutcome::Absent => entry.absent_value,
            })
            .fold(0i32, i32::saturating_add)
    }
}

/// Rank with exact value comparison
pub fn rank(table: &RankTable, snapshot: &PropertySnapshot) -> i32 {
    RankEvaluator::exact().rank(table, snapshot)
}
