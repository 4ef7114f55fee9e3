use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::debug;

use oplogtail_types::{LogEntry, LogPosition, NamespaceMatcher};

use crate::{
    Connector, CursorOptions, EntryStream, OplogCollection, OplogConnection, OplogQuery,
    QueryFilter, StoreError,
};

/// Fault delivered to the next cursor that polls the log
#[derive(Debug)]
pub enum StreamFault {
    /// The cursor yields this error
    Error(StoreError),
    /// The cursor reports end of data
    End,
}

/// In-process oplog
///
/// Entries get strictly increasing positions as they are appended. Every
/// collection name resolves to the same log. Cursors opened through the
/// [`Connector`] impl follow new entries as they arrive.
#[derive(Clone)]
pub struct MemoryOplog {
    shared: Arc<Shared>,
}

struct Shared {
    /// Entries ordered by position
    entries: RwLock<Vec<LogEntry>>,

    /// Last assigned position
    last: Mutex<LogPosition>,

    /// Next generated document id
    next_id: AtomicU64,

    /// Bumped on every append or fault
    changes: watch::Sender<u64>,

    /// Pending cursor faults
    faults: Mutex<VecDeque<StreamFault>>,

    /// Error returned by the next connect attempts
    connect_failure: Mutex<Option<String>>,

    connects: AtomicUsize,
    closes: AtomicUsize,
    cursors_opened: AtomicUsize,
    cursors_live: AtomicUsize,
}

impl MemoryOplog {
    /// Create an empty log
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                entries: RwLock::new(Vec::new()),
                last: Mutex::new(LogPosition::new(0, 0)),
                next_id: AtomicU64::new(1),
                changes,
                faults: Mutex::new(VecDeque::new()),
                connect_failure: Mutex::new(None),
                connects: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                cursors_opened: AtomicUsize::new(0),
                cursors_live: AtomicUsize::new(0),
            }),
        }
    }

    /// Record an insert. Documents without an `_id` get a generated one.
    pub fn insert(&self, namespace: &str, mut document: Value) -> LogEntry {
        if let Some(fields) = document.as_object_mut() {
            if !fields.contains_key("_id") {
                let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
                fields.insert("_id".to_string(), json!(id));
            }
        }
        self.record(|position| LogEntry::new(position, "i", namespace).with_document(document))
    }

    /// Record an update of the document with the given id
    pub fn update(&self, namespace: &str, id: Value, update: Value) -> LogEntry {
        self.record(|position| {
            LogEntry::new(position, "u", namespace)
                .with_document(update)
                .with_criteria(json!({ "_id": id }))
        })
    }

    /// Record a delete of the document with the given id
    pub fn delete(&self, namespace: &str, id: Value) -> LogEntry {
        self.record(|position| {
            LogEntry::new(position, "d", namespace).with_document(json!({ "_id": id }))
        })
    }

    /// Record a no-op carrying a message
    pub fn noop(&self, message: &str) -> LogEntry {
        self.record(|position| LogEntry::new(position, "n", "").with_document(json!({ "msg": message })))
    }

    /// Record an arbitrary operation code
    pub fn append(&self, op: &str, namespace: &str, document: Option<Value>) -> LogEntry {
        self.record(|position| {
            let entry = LogEntry::new(position, op, namespace);
            match document {
                Some(document) => entry.with_document(document),
                None => entry,
            }
        })
    }

    /// Queue a fault for the next cursor poll
    pub fn inject(&self, fault: StreamFault) {
        self.shared.faults.lock().push_back(fault);
        self.shared.changes.send_modify(|version| *version += 1);
    }

    /// Make connect attempts fail until cleared with `None`
    pub fn fail_connect(&self, message: Option<&str>) {
        *self.shared.connect_failure.lock() = message.map(str::to_string);
    }

    /// Snapshot of all entries
    pub fn entries(&self) -> Vec<LogEntry> {
        self.shared.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.shared.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.entries.read().is_empty()
    }

    /// Number of successful connects
    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Number of connection closes
    pub fn close_count(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    /// Number of cursors ever opened
    pub fn cursors_opened(&self) -> usize {
        self.shared.cursors_opened.load(Ordering::SeqCst)
    }

    /// Number of cursors not yet dropped
    pub fn live_cursors(&self) -> usize {
        self.shared.cursors_live.load(Ordering::SeqCst)
    }

    fn record(&self, build: impl FnOnce(LogPosition) -> LogEntry) -> LogEntry {
        let entry = {
            let mut entries = self.shared.entries.write();
            let position = self.shared.next_position();
            let entry = build(position);
            entries.push(entry.clone());
            entry
        };
        self.shared.changes.send_modify(|version| *version += 1);
        entry
    }
}

impl Default for MemoryOplog {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    fn next_position(&self) -> LogPosition {
        let now = LogPosition::now();
        let mut last = self.last.lock();
        let next = if now.seconds() > last.seconds() {
            LogPosition::new(now.seconds(), 1)
        } else {
            LogPosition::new(last.seconds(), last.increment() + 1)
        };
        *last = next;
        next
    }

    fn next_after(&self, after: LogPosition, filter: &QueryFilter) -> Option<LogEntry> {
        let entries = self.entries.read();
        let start = entries.partition_point(|e| e.position <= after);
        entries[start..]
            .iter()
            .find(|e| filter_matches(filter, e))
            .cloned()
    }

    fn take_fault(&self) -> Option<StreamFault> {
        self.faults.lock().pop_front()
    }
}

fn filter_matches(filter: &QueryFilter, entry: &LogEntry) -> bool {
    match filter {
        QueryFilter::All => true,
        QueryFilter::Namespace(matcher) => matcher.is_match(&entry.namespace),
        QueryFilter::Raw(raw) => raw_matches(raw, entry),
    }
}

/// Raw filters are equality conditions on (dotted) entry fields
fn raw_matches(raw: &Value, entry: &LogEntry) -> bool {
    let Some(conditions) = raw.as_object() else {
        return false;
    };
    let Ok(doc) = serde_json::to_value(entry) else {
        return false;
    };
    conditions
        .iter()
        .all(|(path, expected)| lookup(&doc, path) == Some(expected))
}

fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |value, key| value.get(key))
}

#[async_trait]
impl Connector for MemoryOplog {
    async fn connect(&self) -> Result<Arc<dyn OplogConnection>, StoreError> {
        if let Some(message) = self.shared.connect_failure.lock().clone() {
            return Err(StoreError::Connect(message));
        }
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryConnection {
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    closed: AtomicBool,
}

#[async_trait]
impl OplogConnection for MemoryConnection {
    fn collection(&self, _name: &str) -> Result<Arc<dyn OplogCollection>, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(Arc::new(MemoryCollection {
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn close(&self, _force: bool) -> Result<(), StoreError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct MemoryCollection {
    shared: Arc<Shared>,
}

/// Keeps the live cursor count accurate
struct CursorGuard(Arc<Shared>);

impl Drop for CursorGuard {
    fn drop(&mut self) {
        self.0.cursors_live.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Cursor {
    shared: Arc<Shared>,
    after: LogPosition,
    filter: QueryFilter,
    tailable: bool,
    changes: watch::Receiver<u64>,
    _guard: CursorGuard,
}

#[async_trait]
impl OplogCollection for MemoryCollection {
    async fn find(
        &self,
        query: &OplogQuery,
        options: &CursorOptions,
    ) -> Result<EntryStream, StoreError> {
        self.shared.cursors_opened.fetch_add(1, Ordering::SeqCst);
        self.shared.cursors_live.fetch_add(1, Ordering::SeqCst);
        debug!(after = %query.after, "memory cursor opened");

        let cursor = Cursor {
            shared: Arc::clone(&self.shared),
            after: query.after,
            filter: query.filter.clone(),
            tailable: options.tailable,
            changes: self.shared.changes.subscribe(),
            _guard: CursorGuard(Arc::clone(&self.shared)),
        };

        let stream = futures::stream::unfold(cursor, |mut cursor| async move {
            loop {
                if let Some(fault) = cursor.shared.take_fault() {
                    return match fault {
                        StreamFault::Error(err) => Some((Err(err), cursor)),
                        StreamFault::End => None,
                    };
                }
                if let Some(entry) = cursor.shared.next_after(cursor.after, &cursor.filter) {
                    cursor.after = entry.position;
                    return Some((Ok(entry), cursor));
                }
                if !cursor.tailable || cursor.changes.changed().await.is_err() {
                    return None;
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn find_last(
        &self,
        namespace: Option<&NamespaceMatcher>,
    ) -> Result<Option<LogEntry>, StoreError> {
        let entries = self.shared.entries.read();
        Ok(entries
            .iter()
            .rev()
            .find(|e| namespace.is_none_or(|m| m.is_match(&e.namespace)))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn open(log: &MemoryOplog, query: OplogQuery) -> EntryStream {
        let connection = log.connect().await.unwrap();
        let collection = connection.collection("oplog.rs").unwrap();
        collection.find(&query, &CursorOptions::tailing()).await.unwrap()
    }

    async fn next(stream: &mut EntryStream) -> Option<Result<LogEntry, StoreError>> {
        timeout(Duration::from_secs(2), stream.next()).await.unwrap()
    }

    #[test]
    fn test_positions_strictly_increase() {
        let log = MemoryOplog::new();
        let a = log.insert("db.a", json!({"n": 1}));
        let b = log.insert("db.a", json!({"n": 2}));
        let c = log.noop("tick");
        assert!(a.position < b.position);
        assert!(b.position < c.position);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_insert_generates_id() {
        let log = MemoryOplog::new();
        let entry = log.insert("db.a", json!({"n": "JB"}));
        let doc = entry.document.unwrap();
        assert!(doc.get("_id").is_some());

        let entry = log.insert("db.a", json!({"_id": "mine"}));
        assert_eq!(entry.document.unwrap()["_id"], "mine");
    }

    #[test]
    fn test_update_and_delete_shapes() {
        let log = MemoryOplog::new();
        let update = log.update("db.c", json!(5), json!({"$set": {"n": "US"}}));
        assert_eq!(update.op, "u");
        assert_eq!(update.criteria, Some(json!({"_id": 5})));

        let delete = log.delete("db.c", json!(5));
        assert_eq!(delete.op, "d");
        assert_eq!(delete.document, Some(json!({"_id": 5})));
    }

    #[tokio::test]
    async fn test_cursor_follows_new_entries() {
        let log = MemoryOplog::new();
        let first = log.insert("db.a", json!({"c": 1}));
        let mut stream = open(&log, OplogQuery::new(LogPosition::new(0, 0), QueryFilter::All)).await;
        assert_eq!(next(&mut stream).await.unwrap().unwrap(), first);

        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.insert("db.a", json!({"c": 2}));
        });
        let second = next(&mut stream).await.unwrap().unwrap();
        assert_eq!(second.document.unwrap()["c"], 2);
    }

    #[tokio::test]
    async fn test_cursor_starts_after_position() {
        let log = MemoryOplog::new();
        let first = log.insert("db.a", json!({"c": 1}));
        let second = log.insert("db.a", json!({"c": 2}));
        let mut stream = open(&log, OplogQuery::new(first.position, QueryFilter::All)).await;
        assert_eq!(next(&mut stream).await.unwrap().unwrap(), second);
    }

    #[tokio::test]
    async fn test_namespace_and_raw_filters() {
        let log = MemoryOplog::new();
        log.insert("db.f2", json!({"n": "L2"}));
        let wanted = log.insert("db.f1", json!({"n": "L1"}));
        log.delete("db.f1", json!(1));

        let matcher = NamespaceMatcher::compile("*.f1").unwrap();
        let mut stream = open(
            &log,
            OplogQuery::new(LogPosition::new(0, 0), QueryFilter::Namespace(matcher)),
        )
        .await;
        assert_eq!(next(&mut stream).await.unwrap().unwrap(), wanted);

        let raw = json!({"op": "d", "o._id": 1});
        let mut stream = open(&log, OplogQuery::new(LogPosition::new(0, 0), QueryFilter::Raw(raw))).await;
        assert_eq!(next(&mut stream).await.unwrap().unwrap().op, "d");
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let log = MemoryOplog::new();
        let mut stream = open(&log, OplogQuery::new(LogPosition::now(), QueryFilter::All)).await;
        assert_eq!(log.live_cursors(), 1);

        log.inject(StreamFault::Error(StoreError::cursor("cursor killed or timed out")));
        let err = next(&mut stream).await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "cursor killed or timed out");

        log.inject(StreamFault::End);
        assert!(next(&mut stream).await.is_none());
        drop(stream);
        assert_eq!(log.live_cursors(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_and_close() {
        let log = MemoryOplog::new();
        log.fail_connect(Some("connection refused"));
        assert!(matches!(log.connect().await, Err(StoreError::Connect(_))));

        log.fail_connect(None);
        let connection = log.connect().await.unwrap();
        connection.close(true).await.unwrap();
        connection.close(true).await.unwrap();
        assert_eq!(log.close_count(), 1);
        assert!(matches!(connection.collection("oplog.rs"), Err(StoreError::Closed)));
    }

    #[tokio::test]
    async fn test_find_last() {
        let log = MemoryOplog::new();
        let connection = log.connect().await.unwrap();
        let collection = connection.collection("oplog.rs").unwrap();
        assert!(collection.find_last(None).await.unwrap().is_none());

        let a = log.insert("db.a", json!({}));
        let b = log.insert("db.b", json!({}));
        assert_eq!(collection.find_last(None).await.unwrap(), Some(b));
        let matcher = NamespaceMatcher::compile("db.a").unwrap();
        assert_eq!(collection.find_last(Some(&matcher)).await.unwrap(), Some(a));
    }
}
