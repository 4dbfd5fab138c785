//! Core domain model for roster: participation records, identifier
//! normalization, and collection id parsing.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "roster-core";

/// One participant and the most recent event it is associated with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipationRecord {
    pub participant_id: String,
    pub event_id: String,
}

impl ParticipationRecord {
    pub fn new(participant_id: impl Into<String>, event_id: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            event_id: event_id.into(),
        }
    }
}

/// Identifier as it arrives on the wire: the listing API mixes integers and strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawIdentifier {
    Integer(i64),
    Unsigned(u64),
    Float(f64),
    Text(String),
    Other(JsonValue),
}

impl RawIdentifier {
    /// Canonical decimal string, or `None` when the value cannot identify anything.
    pub fn normalize(&self) -> Option<String> {
        match self {
            RawIdentifier::Integer(v) => Some(v.to_string()),
            RawIdentifier::Unsigned(v) => Some(v.to_string()),
            RawIdentifier::Float(v) => {
                // 2^53: beyond this an f64 no longer holds every integer.
                if v.is_finite() && v.fract() == 0.0 && v.abs() < 9_007_199_254_740_992.0 {
                    Some(format!("{}", *v as i64))
                } else {
                    None
                }
            }
            RawIdentifier::Text(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
            RawIdentifier::Other(_) => None,
        }
    }
}

impl From<i64> for RawIdentifier {
    fn from(value: i64) -> Self {
        RawIdentifier::Integer(value)
    }
}

impl From<&str> for RawIdentifier {
    fn from(value: &str) -> Self {
        RawIdentifier::Text(value.to_string())
    }
}

pub fn normalize_identifier(raw: Option<&RawIdentifier>) -> Option<String> {
    raw.and_then(RawIdentifier::normalize)
}

/// Key of one listing to paginate (an event id on the upstream API).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionId(String);

impl CollectionId {
    /// Accepts a token made only of ASCII digits, after trimming.
    pub fn parse(token: &str) -> Option<Self> {
        let token = token.trim();
        if !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()) {
            Some(Self(token.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Split free-form operator input on newlines and commas, keep numeric tokens,
/// drop repeats while preserving first-seen order.
pub fn parse_collection_ids(input: &str) -> Vec<CollectionId> {
    let mut seen = HashSet::new();
    input
        .split(['\n', '\r', ','])
        .filter_map(CollectionId::parse)
        .filter(|id| seen.insert(id.clone()))
        .collect()
}
