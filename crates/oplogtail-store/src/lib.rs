//! Oplog store connections for oplogtail
//!
//! This crate is the boundary to the database that holds the oplog. The
//! engine only sees the traits below: a [`Connector`] creates connections, an
//! [`OplogConnection`] hands out collections, and an [`OplogCollection`] opens
//! tailable cursors and looks up the newest entry.

mod error;
mod memory;
#[cfg(feature = "mongodb")]
mod mongo;
mod options;
mod query;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

pub use error::StoreError;
pub use memory::{MemoryOplog, StreamFault};
#[cfg(feature = "mongodb")]
pub use mongo::MongoConnector;
pub use options::{ConnectOptions, TlsSettings};
pub use query::{CursorOptions, OplogQuery, QueryFilter};

// Re-export types used in our public API
pub use oplogtail_types::{LogEntry, LogPosition, NamespaceMatcher};

/// Default name of the oplog collection
pub const DEFAULT_OPLOG_COLLECTION: &str = "oplog.rs";

/// Ordered, possibly endless sequence of entries read from a cursor.
/// Dropping the stream closes the cursor.
pub type EntryStream = BoxStream<'static, Result<LogEntry, StoreError>>;

/// Creates connections to an oplog store
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn OplogConnection>, StoreError>;
}

/// An open connection to the database holding the oplog
#[async_trait]
pub trait OplogConnection: Send + Sync {
    /// Get a handle to a collection of log entries
    fn collection(&self, name: &str) -> Result<Arc<dyn OplogCollection>, StoreError>;

    /// Close the connection
    async fn close(&self, force: bool) -> Result<(), StoreError>;
}

/// A collection of log entries
#[async_trait]
pub trait OplogCollection: Send + Sync {
    /// Open a cursor over the entries matching `query`
    async fn find(
        &self,
        query: &OplogQuery,
        options: &CursorOptions,
    ) -> Result<EntryStream, StoreError>;

    /// Most recently written entry, optionally restricted to a namespace
    async fn find_last(
        &self,
        namespace: Option<&NamespaceMatcher>,
    ) -> Result<Option<LogEntry>, StoreError>;
}
