//! Shared types for oplogtail
//!
//! This crate contains the oplog data model used across the oplogtail crates:
//! log positions, raw entries, their presentation form and namespace matching.

mod namespace;

pub use namespace::NamespaceMatcher;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

// ============================================================================
// Log Position
// ============================================================================

/// Logical position in the oplog
///
/// Seconds since the epoch plus a counter ordering the entries written within
/// the same second. Positions compare by seconds first, then by increment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogPosition {
    #[serde(rename = "t")]
    seconds: u32,
    #[serde(rename = "i")]
    increment: u32,
}

impl LogPosition {
    pub fn new(seconds: u32, increment: u32) -> Self {
        Self { seconds, increment }
    }

    /// Position at the start of the given second
    pub fn from_seconds(seconds: u32) -> Self {
        Self::new(seconds, 0)
    }

    /// Position anchored to the current wall-clock second
    pub fn now() -> Self {
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self::from_seconds(u32::try_from(seconds).unwrap_or(u32::MAX))
    }

    pub fn seconds(&self) -> u32 {
        self.seconds
    }

    pub fn increment(&self) -> u32 {
        self.increment
    }

    /// Wall-clock time of the seconds component
    pub fn timestamp(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(i64::from(self.seconds), 0).unwrap_or_default()
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.seconds, self.increment)
    }
}

/// Error returned when a resume point string cannot be understood
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsePositionError(String);

impl fmt::Display for ParsePositionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid oplog position '{}': expected seconds or an ISO date", self.0)
    }
}

impl std::error::Error for ParsePositionError {}

impl FromStr for LogPosition {
    type Err = ParsePositionError;

    /// Parse a resume point
    ///
    /// Strings containing `-` are read as an ISO date or date-time, anything
    /// else as seconds since the epoch (fractions are dropped). Zero means now.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || ParsePositionError(s.to_string());

        if s.contains('-') {
            let seconds = if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                dt.timestamp()
            } else if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
                dt.and_utc().timestamp()
            } else if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                date.and_hms_opt(0, 0, 0)
                    .map(|dt| dt.and_utc().timestamp())
                    .ok_or_else(invalid)?
            } else {
                return Err(invalid());
            };
            let seconds = u32::try_from(seconds).map_err(|_| invalid())?;
            return Ok(Self::from_seconds(seconds));
        }

        let seconds: f64 = s.parse().map_err(|_| invalid())?;
        if !seconds.is_finite() || seconds < 0.0 || seconds > f64::from(u32::MAX) {
            return Err(invalid());
        }
        match seconds.trunc() as u32 {
            0 => Ok(Self::now()),
            n => Ok(Self::from_seconds(n)),
        }
    }
}

// ============================================================================
// Oplog Entries
// ============================================================================

/// Semantic kind of an oplog operation
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
    Noop,
    /// Operation code with no known meaning, passed through unchanged
    Other(String),
}

impl OperationKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Noop => "noop",
            Self::Other(code) => code,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for OperationKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// A raw oplog record as produced by the store
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position of the record in the log
    #[serde(rename = "ts")]
    pub position: LogPosition,

    /// Raw operation code (`i`, `u`, `d`, `n`, ...)
    pub op: String,

    /// Target namespace (`database.collection`)
    #[serde(rename = "ns", default)]
    pub namespace: String,

    /// Opaque operation identifier
    #[serde(rename = "h", default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<Value>,

    /// Operation document
    #[serde(rename = "o", default, skip_serializing_if = "Option::is_none")]
    pub document: Option<Value>,

    /// Criteria document identifying the target of updates
    #[serde(rename = "o2", default, skip_serializing_if = "Option::is_none")]
    pub criteria: Option<Value>,
}

impl LogEntry {
    /// Create an entry with no payload documents
    pub fn new(position: LogPosition, op: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            position,
            op: op.into(),
            namespace: namespace.into(),
            operation_id: None,
            document: None,
            criteria: None,
        }
    }

    pub fn with_document(mut self, document: Value) -> Self {
        self.document = Some(document);
        self
    }

    pub fn with_criteria(mut self, criteria: Value) -> Self {
        self.criteria = Some(criteria);
        self
    }

    pub fn with_operation_id(mut self, operation_id: Value) -> Self {
        self.operation_id = Some(operation_id);
        self
    }

    /// Identifier of the targeted document
    ///
    /// Taken from the criteria document's `_id`, falling back to the
    /// operation document's `_id`.
    pub fn target_id(&self) -> Option<&Value> {
        fn id_of(doc: Option<&Value>) -> Option<&Value> {
            doc.and_then(|d| d.get("_id")).filter(|v| !v.is_null())
        }
        id_of(self.criteria.as_ref()).or_else(|| id_of(self.document.as_ref()))
    }
}

/// Human-oriented view of a [`LogEntry`]
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresentationEntry {
    pub namespace: String,
    pub operation: OperationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<Value>,
    pub timestamp: DateTime<Utc>,
    pub ts: LogPosition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub criteria: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}
