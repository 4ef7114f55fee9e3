use thiserror::Error;

/// Errors reported by an oplog store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("failed to connect to oplog database: {0}")]
    Connect(String),

    #[error("oplog query failed: {0}")]
    Query(String),

    /// Failure reading from an open cursor, with the server error code if any
    #[error("{message}")]
    Cursor { message: String, code: Option<i32> },

    #[error("malformed oplog entry: {0}")]
    Decode(String),

    #[error("connection is closed")]
    Closed,
}

impl StoreError {
    /// Cursor failure without a server error code
    pub fn cursor(message: impl Into<String>) -> Self {
        Self::Cursor {
            message: message.into(),
            code: None,
        }
    }

    /// Server error code, if the store reported one
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Cursor { code, .. } => *code,
            _ => None,
        }
    }
}
