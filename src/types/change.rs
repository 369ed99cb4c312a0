//! Change record types for the replication log
//!
//! A change record is an immutable entry in the append-only change log.
//! Records are keyed by their timestamp, which defines the total order
//! peers replay them in.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Width of the zero-padded decimal form used as a storage key.
pub const TIMESTAMP_KEY_WIDTH: usize = 20;

/// Collision-free change timestamp
///
/// The value is a coarse wall-clock reading in milliseconds multiplied by
/// [`Timestamp::TICKS_PER_MILLI`], plus a sub-tick counter that breaks ties
/// between writes landing in the same millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Sub-tick slots available inside one millisecond
    pub const TICKS_PER_MILLI: u64 = 1000;

    pub const ZERO: Timestamp = Timestamp(0);

    /// Build a timestamp from a millisecond clock reading with no sub-tick
    pub fn from_millis(millis: u64) -> Self {
        Timestamp(millis.saturating_mul(Self::TICKS_PER_MILLI))
    }

    /// Millisecond component (the coarse clock reading)
    pub fn millis(&self) -> u64 {
        self.0 / Self::TICKS_PER_MILLI
    }

    /// Next timestamp in total order
    pub fn successor(&self) -> Self {
        Timestamp(self.0 + 1)
    }

    /// Encode as a fixed-width key so lexical order equals numeric order
    pub fn to_key(&self) -> String {
        format!("{:0width$}", self.0, width = TIMESTAMP_KEY_WIDTH)
    }

    /// Decode a key produced by [`Timestamp::to_key`]
    pub fn from_key(key: &str) -> Option<Self> {
        if key.len() != TIMESTAMP_KEY_WIDTH || !key.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        key.parse().ok().map(Timestamp)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Timestamp {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Timestamp)
    }
}

/// Kind of mutation recorded in the change log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// A key was written
    Put,
    /// A key was removed
    Delete,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeType::Put => write!(f, "put"),
            ChangeType::Delete => write!(f, "delete"),
        }
    }
}

/// One logged mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Position in the change log
    pub timestamp: Timestamp,

    /// Put or delete
    #[serde(rename = "type")]
    pub change_type: ChangeType,

    /// Key in the primary store
    pub key: String,
}

impl ChangeRecord {
    pub fn new(timestamp: Timestamp, change_type: ChangeType, key: impl Into<String>) -> Self {
        Self {
            timestamp,
            change_type,
            key: key.into(),
        }
    }

    /// Serialize to a JSON string (store value / wire item)
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from a JSON string
    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}
