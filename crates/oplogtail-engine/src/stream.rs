//! Opens tailing cursors over the oplog collection

use serde_json::Value;
use tracing::debug;

use oplogtail_store::{
    CursorOptions, EntryStream, LogEntry, LogPosition, NamespaceMatcher, OplogConnection,
    OplogQuery, QueryFilter, StoreError,
};

use crate::error::TailError;

/// Parameters of a tailing cursor
#[derive(Clone, Copy, Debug)]
pub struct StreamRequest<'a> {
    /// Only entries strictly after this position are delivered
    pub after: LogPosition,
    pub namespace: Option<&'a NamespaceMatcher>,
    pub raw_filter: Option<&'a Value>,
    pub collection: &'a str,
}

/// Open a tailing, await-data cursor for `request`
pub async fn open(
    connection: Option<&dyn OplogConnection>,
    request: &StreamRequest<'_>,
) -> Result<EntryStream, TailError> {
    let connection = connection.ok_or(TailError::Connection(StoreError::Closed))?;
    let collection = connection
        .collection(request.collection)
        .map_err(TailError::Connection)?;

    let filter = QueryFilter::from_parts(request.namespace, request.raw_filter);
    let query = OplogQuery::new(request.after, filter);
    debug!(after = %request.after, collection = request.collection, "opening oplog stream");

    collection
        .find(&query, &CursorOptions::tailing())
        .await
        .map_err(TailError::from_stream)
}

/// Newest entry, restricted to `namespace` when given
pub async fn last_entry(
    connection: Option<&dyn OplogConnection>,
    namespace: Option<&NamespaceMatcher>,
    collection: &str,
) -> Result<Option<LogEntry>, TailError> {
    let connection = connection.ok_or(TailError::Connection(StoreError::Closed))?;
    let collection = connection
        .collection(collection)
        .map_err(TailError::Connection)?;
    collection
        .find_last(namespace)
        .await
        .map_err(TailError::from_stream)
}
