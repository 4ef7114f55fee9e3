use serde_json::Value;

use oplogtail_types::{LogEntry, LogPosition, NamespaceMatcher};

/// Server-side restriction applied on top of the position bound
#[derive(Clone, Debug)]
pub enum QueryFilter {
    /// Every entry
    All,

    /// Entries whose namespace matches the pattern
    Namespace(NamespaceMatcher),

    /// Caller-supplied query document, interpreted by the store
    Raw(Value),
}

impl QueryFilter {
    /// Build the filter from the tail configuration. A raw document wins
    /// over the namespace pattern.
    pub fn from_parts(namespace: Option<&NamespaceMatcher>, raw: Option<&Value>) -> Self {
        match (raw, namespace) {
            (Some(raw), _) => Self::Raw(raw.clone()),
            (None, Some(matcher)) if !matcher.matches_everything() => {
                Self::Namespace(matcher.clone())
            }
            _ => Self::All,
        }
    }
}

/// Query for entries strictly after a position
#[derive(Clone, Debug)]
pub struct OplogQuery {
    pub after: LogPosition,
    pub filter: QueryFilter,
}

impl OplogQuery {
    pub fn new(after: LogPosition, filter: QueryFilter) -> Self {
        Self { after, filter }
    }

    /// Position bound only. Raw filters are left to the store.
    pub fn admits(&self, entry: &LogEntry) -> bool {
        entry.position > self.after
    }
}

/// Cursor behaviour requested from the store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CursorOptions {
    /// Keep the cursor open after the last entry
    pub tailable: bool,

    /// Block waiting for new data instead of returning empty batches
    pub await_data: bool,

    /// Disable the server's idle cursor timeout
    pub no_cursor_timeout: bool,

    /// Optimise the scan for oplog replay
    pub oplog_replay: bool,

    /// Retries of transient network reads (`None` is unlimited)
    pub max_retries: Option<u32>,
}

impl CursorOptions {
    /// Options for continuously tailing the oplog
    pub fn tailing() -> Self {
        Self {
            tailable: true,
            await_data: true,
            no_cursor_timeout: true,
            oplog_replay: true,
            max_retries: None,
        }
    }

    /// Options for a one-shot read
    pub fn single_pass() -> Self {
        Self {
            tailable: false,
            await_data: false,
            no_cursor_timeout: false,
            oplog_replay: false,
            max_retries: Some(0),
        }
    }
}
