//! Correlation matching between recorded and incoming field snapshots.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::fields::FieldSnapshot;
use crate::error::ThrottleError;

/// How the configured fields are combined to decide "same client".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum MatchMethod {
    /// Every field of the recorded request must coincide
    And,
    /// At least one non-empty field must coincide
    Or,
}

impl MatchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMethod::And => "and",
            MatchMethod::Or => "or",
        }
    }

    /// Decide whether `incoming` originates from the same client as `stored`.
    ///
    /// `And`: every field present in `stored` is present in `incoming` with an
    /// equal value. `Or`: some field of `stored` is non-empty, present in
    /// `incoming` and equal there. Empty values never act as wildcards.
    pub fn matches(&self, stored: &FieldSnapshot, incoming: &FieldSnapshot) -> bool {
        match self {
            MatchMethod::And => stored
                .iter()
                .all(|(name, value)| incoming.get(name) == Some(value)),
            MatchMethod::Or => stored.iter().any(|(name, value)| {
                !value.is_empty() && incoming.get(name) == Some(value)
            }),
        }
    }
}

impl FromStr for MatchMethod {
    type Err = ThrottleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "and" => Ok(MatchMethod::And),
            "or" => Ok(MatchMethod::Or),
            _ => Err(ThrottleError::UnknownMatchMethod(s.to_string())),
        }
    }
}

impl TryFrom<String> for MatchMethod {
    type Error = ThrottleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MatchMethod> for &'static str {
    fn from(method: MatchMethod) -> Self {
        method.as_str()
    }
}

impl fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
