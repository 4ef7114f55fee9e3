use std::sync::Arc;

use oplogtail_types::OperationKind;

use crate::classify::OplogPayload;
use crate::error::TailError;

/// Name of a signal listeners can register for
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Signal {
    Connect,
    Disconnect,
    Destroy,
    TailStart,
    TailEnd,
    End,
    Error,
    /// Every delivered entry
    Op,
    Insert,
    Update,
    Delete,
    Noop,
    /// Entries with an unrecognised operation code
    Other(String),
}

impl Signal {
    pub fn name(&self) -> &str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Destroy => "destroy",
            Self::TailStart => "tail-start",
            Self::TailEnd => "tail-end",
            Self::End => "end",
            Self::Error => "error",
            Self::Op => "op",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Noop => "noop",
            Self::Other(code) => code,
        }
    }
}

impl From<&OperationKind> for Signal {
    fn from(kind: &OperationKind) -> Self {
        match kind {
            OperationKind::Insert => Self::Insert,
            OperationKind::Update => Self::Update,
            OperationKind::Delete => Self::Delete,
            OperationKind::Noop => Self::Noop,
            OperationKind::Other(code) => Self::Other(code.clone()),
        }
    }
}

/// Event handed to listeners
#[derive(Clone, Debug)]
pub enum TailEvent {
    Connect,
    Disconnect,
    Destroy,
    TailStart,
    TailEnd,
    End,
    Error(Arc<TailError>),
    /// A delivered entry, for `op` and the kind-specific signal
    Op(Arc<OplogPayload>),
}

impl TailEvent {
    /// Signal a lifecycle event is emitted under
    pub fn signal(&self) -> Signal {
        match self {
            Self::Connect => Signal::Connect,
            Self::Disconnect => Signal::Disconnect,
            Self::Destroy => Signal::Destroy,
            Self::TailStart => Signal::TailStart,
            Self::TailEnd => Signal::TailEnd,
            Self::End => Signal::End,
            Self::Error(_) => Signal::Error,
            Self::Op(_) => Signal::Op,
        }
    }

    pub fn payload(&self) -> Option<&OplogPayload> {
        match self {
            Self::Op(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&TailError> {
        match self {
            Self::Error(err) => Some(err),
            _ => None,
        }
    }
}
