//! Oplog tailing engine for oplogtail
//!
//! [`OplogTail`] follows the oplog from a tracked position and dispatches
//! every entry to listeners registered per [`Signal`]. Expired cursors are
//! reopened transparently from the last delivered position. [`SubFilter`]s
//! re-emit the subset of entries whose namespace matches a pattern.

mod classify;
mod emitter;
mod error;
mod event;
mod filter;
mod options;
mod stream;
mod tail;

pub use classify::{OplogPayload, classify, present};
pub use emitter::{Emitter, Listener, ListenerHandle};
pub use error::{ErrorClass, TailError, classify_error};
pub use event::{Signal, TailEvent};
pub use filter::SubFilter;
pub use options::{Since, TailOptions};
pub use stream::{StreamRequest, last_entry, open as open_stream};
pub use tail::{OplogTail, StreamId, TailState};

// Re-export types used in our public API
pub use oplogtail_store::{
    Connector, LogEntry, LogPosition, NamespaceMatcher, OplogConnection, StoreError,
};
pub use oplogtail_types::{OperationKind, PresentationEntry};
