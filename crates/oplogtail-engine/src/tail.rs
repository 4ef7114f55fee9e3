use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures::StreamExt;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use oplogtail_store::{
    Connector, DEFAULT_OPLOG_COLLECTION, EntryStream, LogEntry, LogPosition, NamespaceMatcher,
    OplogConnection, StoreError,
};

use crate::classify::{OplogPayload, classify};
use crate::emitter::{Emitter, ListenerHandle};
use crate::error::TailError;
use crate::event::{Signal, TailEvent};
use crate::filter::SubFilter;
use crate::options::{Since, TailOptions};
use crate::stream::{self, StreamRequest};

/// Identifier of one tailing cursor
pub type StreamId = u64;

/// Lifecycle state of an [`OplogTail`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TailState {
    Idle,
    Connecting,
    Streaming,
    Stopped,
    Destroyed,
}

enum ConnectionSource {
    /// Connected on demand, closed on destroy
    Owned(Arc<dyn Connector>),
    /// Supplied by the caller and never closed here
    External,
}

struct ActiveStream {
    id: StreamId,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

struct Session {
    connection: Option<Arc<dyn OplogConnection>>,
    stream: Option<ActiveStream>,
    /// Stopped stream tasks that may still be dispatching
    retired: Vec<JoinHandle<()>>,
}

/// Resilient oplog tail
///
/// Streams entries strictly after the tracked position and dispatches them
/// to listeners. Expired cursors are reopened from the last delivered
/// position without surfacing an error. Clones share the same engine.
#[derive(Clone)]
pub struct OplogTail {
    inner: Arc<TailInner>,
}

struct TailInner {
    source: ConnectionSource,
    namespace: Option<NamespaceMatcher>,
    raw_filter: Option<Value>,
    collection: String,
    pretty: bool,

    /// Last delivered position
    position: RwLock<LogPosition>,
    /// Resolve the start position from the newest entry on next start
    resolve_last_entry: AtomicBool,

    state: RwLock<TailState>,
    session: Mutex<Session>,
    /// Serializes start attempts
    start_lock: tokio::sync::Mutex<()>,
    /// Bumped by every stop; invalidates in-flight starts
    stop_epoch: AtomicU64,
    next_stream_id: AtomicU64,

    ignore: AtomicBool,
    destroyed: AtomicBool,

    listeners: Emitter<TailEvent>,
    /// Delivered payloads for sub-filters
    filters: Emitter<Arc<OplogPayload>>,
}

impl OplogTail {
    /// Create a tail that connects through `connector` and owns the connection
    pub fn new(connector: Arc<dyn Connector>, options: TailOptions) -> Result<Self, TailError> {
        Self::build(ConnectionSource::Owned(connector), None, options)
    }

    /// Create a tail over an existing connection. The connection is left
    /// open on destroy.
    pub fn with_connection(
        connection: Arc<dyn OplogConnection>,
        options: TailOptions,
    ) -> Result<Self, TailError> {
        Self::build(ConnectionSource::External, Some(connection), options)
    }

    fn build(
        source: ConnectionSource,
        connection: Option<Arc<dyn OplogConnection>>,
        options: TailOptions,
    ) -> Result<Self, TailError> {
        let namespace = options
            .namespace
            .as_deref()
            .map(NamespaceMatcher::compile)
            .transpose()?;

        let (position, resolve_last_entry) = match options.since {
            Since::Now => (LogPosition::now(), false),
            Since::Position(position) => (position, false),
            Since::LastEntry => (LogPosition::now(), true),
        };

        debug!(
            namespace = namespace.as_ref().map(NamespaceMatcher::pattern),
            %position,
            "oplog tail created"
        );

        Ok(Self {
            inner: Arc::new(TailInner {
                source,
                namespace,
                raw_filter: options.filter,
                collection: options
                    .collection
                    .unwrap_or_else(|| DEFAULT_OPLOG_COLLECTION.to_string()),
                pretty: options.pretty,
                position: RwLock::new(position),
                resolve_last_entry: AtomicBool::new(resolve_last_entry),
                state: RwLock::new(TailState::Idle),
                session: Mutex::new(Session {
                    connection,
                    stream: None,
                    retired: Vec::new(),
                }),
                start_lock: tokio::sync::Mutex::new(()),
                stop_epoch: AtomicU64::new(0),
                next_stream_id: AtomicU64::new(0),
                ignore: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                listeners: Emitter::new(),
                filters: Emitter::new(),
            }),
        })
    }

    /// Begin streaming. Returns the active stream, which is the existing one
    /// if already streaming, or `None` when the start failed or was
    /// superseded by [`stop`](Self::stop). Failures are emitted as `error`.
    pub async fn start(&self) -> Option<StreamId> {
        self.inner.start().await
    }

    /// Halt streaming. The connection and position are kept so a later
    /// start resumes after the last delivered entry.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Stop, close an owned connection, emit `destroy` and drop every
    /// listener. Idempotent.
    pub async fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.stop();
        inner.disconnect().await;
        *inner.state.write() = TailState::Destroyed;

        info!("oplog tail destroyed");
        inner.emit(TailEvent::Destroy);
        inner.listeners.remove_all();
        inner.filters.remove_all();
    }

    /// Whether the newest matching entry is at `expected`, or at the tracked
    /// position when `expected` is `None`.
    ///
    /// An empty log counts as current unless a position was given, in which
    /// case [`TailError::NoMatchingEntry`] is returned.
    pub async fn is_current(&self, expected: Option<LogPosition>) -> Result<bool, TailError> {
        let inner = &self.inner;
        if inner.is_destroyed() {
            return Err(TailError::Destroyed);
        }
        let connection = inner.connection().await?;
        let last = stream::last_entry(
            Some(connection.as_ref()),
            inner.namespace.as_ref(),
            &inner.collection,
        )
        .await?;

        match (last, expected) {
            (None, Some(_)) => Err(TailError::NoMatchingEntry),
            (None, None) => Ok(true),
            (Some(entry), expected) => {
                Ok(entry.position == expected.unwrap_or_else(|| self.position()))
            }
        }
    }

    /// Create a sub-filter delivering the entries whose namespace matches
    /// `pattern`
    pub fn filter(&self, pattern: &str) -> Result<SubFilter, TailError> {
        if self.inner.is_destroyed() {
            return Err(TailError::Destroyed);
        }
        SubFilter::attach(&self.inner.filters, pattern)
    }

    pub fn on<F>(&self, signal: Signal, listener: F) -> ListenerHandle
    where
        F: Fn(&TailEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.on(signal, listener)
    }

    pub fn once<F>(&self, signal: Signal, listener: F) -> ListenerHandle
    where
        F: Fn(&TailEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.once(signal, listener)
    }

    /// Drop every entry without dispatching it or advancing the position
    pub fn set_ignore(&self, ignore: bool) {
        self.inner.ignore.store(ignore, Ordering::SeqCst);
    }

    pub fn is_ignored(&self) -> bool {
        self.inner.ignore.load(Ordering::SeqCst)
    }

    /// Position of the last delivered entry
    pub fn position(&self) -> LogPosition {
        *self.inner.position.read()
    }

    pub fn state(&self) -> TailState {
        *self.inner.state.read()
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        self.inner.session.lock().stream.as_ref().map(|s| s.id)
    }

    /// Number of attached sub-filters
    pub fn filter_count(&self) -> usize {
        self.inner.filters.listener_count(&Signal::Op)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session.lock().connection.is_some()
    }

    pub fn namespace(&self) -> Option<&NamespaceMatcher> {
        self.inner.namespace.as_ref()
    }

    pub fn is_pretty(&self) -> bool {
        self.inner.pretty
    }
}

impl std::fmt::Debug for OplogTail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OplogTail")
            .field("namespace", &self.inner.namespace)
            .field("collection", &self.inner.collection)
            .field("position", &self.position())
            .field("state", &self.state())
            .finish()
    }
}

/// Releases a stream whose task exits without doing so itself, as when a
/// listener panics
struct StreamGuard {
    inner: Arc<TailInner>,
    id: StreamId,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if self.inner.release(self.id) {
            warn!(stream = self.id, "oplog stream task exited unexpectedly");
        }
    }
}

impl TailInner {
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: TailState) {
        let mut current = self.state.write();
        if *current != TailState::Destroyed {
            *current = state;
        }
    }

    fn emit(&self, event: TailEvent) {
        self.listeners.emit(&event.signal(), &event);
    }

    /// Boxed so the stream task can re-enter it after an expired cursor
    fn start(self: &Arc<Self>) -> BoxFuture<'static, Option<StreamId>> {
        let this = Arc::clone(self);
        async move {
            let _starting = this.start_lock.lock().await;
            loop {
                if this.is_destroyed() {
                    warn!("start called on a destroyed oplog tail");
                    return None;
                }
                let active = this.session.lock().stream.as_ref().map(|s| s.id);
                if let Some(id) = active {
                    return Some(id);
                }
                // A stopped task must finish its dispatch before the position is read
                this.join_retired().await;

                let epoch = this.stop_epoch.load(Ordering::SeqCst);
                this.set_state(TailState::Connecting);
                let opened = this.open().await;

                if this.stop_epoch.load(Ordering::SeqCst) != epoch || this.is_destroyed() {
                    debug!("stopped while connecting; discarding stream");
                    this.set_state(TailState::Stopped);
                    return None;
                }

                match opened {
                    Ok(stream) => return Some(this.install(stream, epoch)),
                    Err(err) if err.is_transient() => {
                        debug!(error = %err, "cursor timed out - retailing");
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to start oplog tail");
                        this.set_state(TailState::Stopped);
                        this.emit(TailEvent::Error(Arc::new(err)));
                        return None;
                    }
                }
            }
        }
        .boxed()
    }

    async fn join_retired(&self) {
        let retired = std::mem::take(&mut self.session.lock().retired);
        for task in retired {
            if let Err(err) = task.await {
                if err.is_panic() {
                    warn!("stopped stream task panicked");
                }
            }
        }
    }

    async fn connection(&self) -> Result<Arc<dyn OplogConnection>, TailError> {
        let existing = self.session.lock().connection.clone();
        if let Some(connection) = existing {
            return Ok(connection);
        }
        let ConnectionSource::Owned(connector) = &self.source else {
            return Err(TailError::Connection(StoreError::Closed));
        };

        let connection = connector.connect().await.map_err(TailError::Connection)?;
        // Checked under the session lock so destroy never misses a connection
        let stored = {
            let mut session = self.session.lock();
            if self.is_destroyed() {
                Err(TailError::Destroyed)
            } else if let Some(existing) = &session.connection {
                Ok(Some(Arc::clone(existing)))
            } else {
                session.connection = Some(Arc::clone(&connection));
                Ok(None)
            }
        };

        match stored {
            Ok(None) => {
                info!("connected to oplog database");
                self.emit(TailEvent::Connect);
                Ok(connection)
            }
            surplus => {
                if let Err(err) = connection.close(true).await {
                    debug!(error = %err, "failed to close surplus connection");
                }
                surplus.map(|existing| existing.unwrap_or(connection))
            }
        }
    }

    async fn open(&self) -> Result<EntryStream, TailError> {
        let connection = self.connection().await?;

        if self.resolve_last_entry.swap(false, Ordering::SeqCst) {
            let last = stream::last_entry(
                Some(connection.as_ref()),
                self.namespace.as_ref(),
                &self.collection,
            )
            .await;
            match last {
                Ok(Some(entry)) => *self.position.write() = entry.position,
                Ok(None) => {}
                Err(err) => {
                    self.resolve_last_entry.store(true, Ordering::SeqCst);
                    return Err(err);
                }
            }
        }

        let request = StreamRequest {
            after: *self.position.read(),
            namespace: self.namespace.as_ref(),
            raw_filter: self.raw_filter.as_ref(),
            collection: &self.collection,
        };
        stream::open(Some(connection.as_ref()), &request).await
    }

    fn install(self: &Arc<Self>, stream: EntryStream, epoch: u64) -> StreamId {
        let id = self.next_stream_id.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        self.session.lock().stream = Some(ActiveStream {
            id,
            cancel: cancel.clone(),
            task: None,
        });
        self.set_state(TailState::Streaming);

        let after = *self.position.read();
        info!(stream = id, %after, "oplog stream started");
        self.emit(TailEvent::TailStart);

        let task = self.spawn_stream(id, epoch, stream, cancel);
        let mut session = self.session.lock();
        match session.stream.as_mut().filter(|active| active.id == id) {
            Some(active) => active.task = Some(task),
            // Stopped from a tail-start listener
            None => session.retired.push(task),
        }
        id
    }

    fn spawn_stream(
        self: &Arc<Self>,
        id: StreamId,
        epoch: u64,
        mut stream: EntryStream,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(self);

        tokio::spawn(async move {
            let _guard = StreamGuard {
                inner: Arc::clone(&inner),
                id,
            };
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = stream.next() => next,
                };

                match next {
                    Some(Ok(entry)) => inner.deliver(entry, &cancel),
                    Some(Err(err)) => {
                        drop(stream);
                        inner.stream_failed(id, epoch, &cancel, err).await;
                        return;
                    }
                    None => {
                        inner.stream_ended(id);
                        break;
                    }
                }
            }
            trace!(stream = id, "stream task finished");
        })
    }

    fn deliver(&self, entry: LogEntry, cancel: &CancellationToken) {
        // Left for the next stream, which resumes after the tracked position
        if cancel.is_cancelled() {
            trace!(position = %entry.position, "dropping entry from stopped stream");
            return;
        }
        if self.ignore.load(Ordering::SeqCst) {
            trace!(position = %entry.position, "ignoring entry");
            return;
        }
        {
            let mut position = self.position.write();
            if entry.position > *position {
                *position = entry.position;
            }
        }

        trace!(position = %entry.position, ns = %entry.namespace, op = %entry.op, "incoming entry");
        let kind = classify(&entry.op);
        let payload = Arc::new(OplogPayload::new(entry, self.pretty));
        let event = TailEvent::Op(Arc::clone(&payload));

        self.listeners.emit(&Signal::Op, &event);
        self.listeners.emit(&Signal::from(&kind), &event);
        self.filters.emit(&Signal::Op, &payload);
    }

    /// Forget stream `id` if it is still the active one
    fn release(&self, id: StreamId) -> bool {
        let released = {
            let mut session = self.session.lock();
            if session.stream.as_ref().is_some_and(|s| s.id == id) {
                session.stream = None;
                true
            } else {
                false
            }
        };
        if released {
            self.set_state(TailState::Stopped);
        }
        released
    }

    fn stream_ended(&self, id: StreamId) {
        if !self.release(id) {
            return;
        }
        info!(stream = id, "oplog stream ended");
        self.emit(TailEvent::End);
        self.emit(TailEvent::TailEnd);
    }

    async fn stream_failed(
        self: &Arc<Self>,
        id: StreamId,
        epoch: u64,
        cancel: &CancellationToken,
        err: StoreError,
    ) {
        let active = self.release(id);
        let err = TailError::from_stream(err);

        if !active
            || cancel.is_cancelled()
            || self.stop_epoch.load(Ordering::SeqCst) != epoch
            || self.is_destroyed()
        {
            debug!(stream = id, error = %err, "stream failed after stop");
            return;
        }

        if err.is_transient() {
            debug!(stream = id, error = %err, "cursor timed out - retailing");
            self.start().await;
        } else {
            warn!(stream = id, error = %err, "oplog stream failed");
            self.emit(TailEvent::Error(Arc::new(err)));
        }
    }

    fn stop(&self) {
        self.stop_epoch.fetch_add(1, Ordering::SeqCst);
        let active = self.session.lock().stream.take();
        if let Some(active) = active {
            active.cancel.cancel();
            if let Some(task) = active.task {
                task.abort();
                self.session.lock().retired.push(task);
            }
            debug!(stream = active.id, "oplog stream stopped");
        }
        self.set_state(TailState::Stopped);
    }

    async fn disconnect(&self) {
        if matches!(self.source, ConnectionSource::External) {
            debug!("leaving external connection open");
            return;
        }
        let connection = self.session.lock().connection.take();
        let Some(connection) = connection else {
            return;
        };

        if let Err(err) = connection.close(true).await {
            warn!(error = %err, "failed to close oplog connection");
        }
        info!("disconnected from oplog database");
        self.emit(TailEvent::Disconnect);
    }
}
