//! Canonical segment patterns for resource and action matching
//!
//! Patterns are normalized into segments at policy-write time so that
//! evaluation is a deterministic segment walk, never a regex compile on the
//! hot path. Segments are split on `:` and `/`, e.g. `doc:42` or
//! `api/payments/refund`.

use crate::error::{AuthzError, Result};
use serde::{Deserialize, Serialize};

/// One normalized pattern segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Segment {
    /// Must equal this literal exactly
    Literal(String),

    /// Matches exactly one segment (`*` in a non-final position)
    Any,

    /// Matches the remainder, including nothing (`*` or `**` in final position)
    Rest,
}

/// A resource or action pattern in canonical segment form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SegmentPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl SegmentPattern {
    /// Parse and normalize a pattern. Rejects empty patterns and empty
    /// segments so evaluation never sees a malformed pattern.
    pub fn parse(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(AuthzError::InvalidPolicy("empty pattern".to_string()));
        }

        let parts: Vec<&str> = split_segments(pattern);
        let last = parts.len() - 1;
        let mut segments = Vec::with_capacity(parts.len());

        for (i, part) in parts.iter().enumerate() {
            let segment = match *part {
                "" => {
                    return Err(AuthzError::InvalidPolicy(format!(
                        "empty segment in pattern '{}'",
                        pattern
                    )))
                }
                "*" if i == last => Segment::Rest,
                "**" if i == last => Segment::Rest,
                "*" => Segment::Any,
                "**" => {
                    return Err(AuthzError::InvalidPolicy(format!(
                        "'**' only allowed as final segment in '{}'",
                        pattern
                    )))
                }
                literal if literal.contains('*') => {
                    return Err(AuthzError::InvalidPolicy(format!(
                        "wildcard must be a whole segment in '{}'",
                        pattern
                    )))
                }
                literal => Segment::Literal(literal.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    /// Match a concrete value against this pattern
    pub fn matches(&self, value: &str) -> bool {
        let parts = split_segments(value);
        let mut vi = 0;

        for segment in &self.segments {
            match segment {
                Segment::Rest => return true,
                Segment::Any => {
                    if vi >= parts.len() {
                        return false;
                    }
                    vi += 1;
                }
                Segment::Literal(lit) => {
                    if vi >= parts.len() || parts[vi] != lit.as_str() {
                        return false;
                    }
                    vi += 1;
                }
            }
        }

        vi == parts.len()
    }

    /// Count of literal segments. Used for decision logging only; conflict
    /// resolution orders by priority, not specificity.
    pub fn specificity(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count()
    }

    /// Original pattern text
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn split_segments(value: &str) -> Vec<&str> {
    value.split(|c| c == ':' || c == '/').collect()
}

impl TryFrom<String> for SegmentPattern {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        SegmentPattern::parse(&value).map_err(|e| e.to_string())
    }
}

impl From<SegmentPattern> for String {
    fn from(pattern: SegmentPattern) -> Self {
        pattern.raw
    }
}
