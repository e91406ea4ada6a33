//! Registration keys, patterns and the structural matcher
//!
//! ```text
//! ┌──────────────────────┐   parse once   ┌──────────────────────┐
//! │ "org/oyranos/d/app.X"│ ─────────────► │   RegistrationKey    │──┐
//! └──────────────────────┘                └──────────────────────┘  │  match_score(stage)
//! ┌──────────────────────┐   parse once   ┌──────────────────────┐  ├──────────────► Option<u32>
//! │   "//d/app+X._fast"  │ ─────────────► │ RegistrationPattern  │──┘
//! └──────────────────────┘                └──────────────────────┘
//! ```
//!
//! Parsing happens at the boundary; matching works on the structured form
//! and never fails. Malformed patterns are reported by
//! [`RegistrationPattern::parse`] as `FormatError`.

mod key;
mod matcher;
mod pattern;

pub use key::{key_name_of, KeyAttribute, KeySegment, RegistrationKey};
pub use matcher::{match_score, matches, matches_text};
pub use pattern::{AttributeMarker, PatternAttribute, PatternSegment, RegistrationPattern};
