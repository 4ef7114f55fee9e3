use thiserror::Error;

use oplogtail_store::StoreError;

/// Server code reported when a cursor was killed or has expired
const CURSOR_NOT_FOUND: i32 = 43;

/// Messages of cursors the server timed out
const CURSOR_TIMEOUT_SIGNATURES: [&str; 2] = ["cursor timed out", "cursor killed or timed out"];

/// Errors surfaced by the tailing engine
#[derive(Debug, Error)]
pub enum TailError {
    #[error("no usable oplog connection: {0}")]
    Connection(StoreError),

    /// The cursor expired; recovered by re-tailing, never surfaced
    #[error("oplog cursor expired: {0}")]
    TransientStream(StoreError),

    #[error("oplog stream failed: {0}")]
    Stream(StoreError),

    #[error("no oplog entry found")]
    NoMatchingEntry,

    #[error("invalid namespace pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("oplog tail has been destroyed")]
    Destroyed,
}

impl TailError {
    /// Wrap a failure reported while reading the log
    pub fn from_stream(err: StoreError) -> Self {
        match classify_error(&err) {
            ErrorClass::Transient => Self::TransientStream(err),
            ErrorClass::Fatal => Self::Stream(err),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStream(_))
    }
}

/// How the engine reacts to a stream failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Re-tail from the last delivered position
    Transient,
    /// Surface to listeners and halt
    Fatal,
}

/// Decide whether a store failure is an expired cursor
pub fn classify_error(err: &StoreError) -> ErrorClass {
    if err.code() == Some(CURSOR_NOT_FOUND) {
        return ErrorClass::Transient;
    }
    let message = err.to_string();
    if CURSOR_TIMEOUT_SIGNATURES.iter().any(|s| message.contains(s)) {
        ErrorClass::Transient
    } else {
        ErrorClass::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_messages_are_transient() {
        let err = StoreError::cursor("cursor killed or timed out");
        assert_eq!(classify_error(&err), ErrorClass::Transient);

        let err = StoreError::cursor("Executor error: cursor timed out (id 12)");
        assert_eq!(classify_error(&err), ErrorClass::Transient);
    }

    #[test]
    fn test_cursor_not_found_code_is_transient() {
        let err = StoreError::Cursor {
            message: "cursor id 7 not found".to_string(),
            code: Some(CURSOR_NOT_FOUND),
        };
        assert!(TailError::from_stream(err).is_transient());
    }

    #[test]
    fn test_other_errors_are_fatal() {
        assert_eq!(classify_error(&StoreError::cursor("socket closed")), ErrorClass::Fatal);
        assert_eq!(classify_error(&StoreError::cursor("cursor killed")), ErrorClass::Fatal);
        assert_eq!(
            classify_error(&StoreError::Connect("timed out".to_string())),
            ErrorClass::Fatal
        );
        assert!(!TailError::from_stream(StoreError::Closed).is_transient());
    }
}
