use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, trace};

use oplogtail_store::NamespaceMatcher;

use crate::classify::OplogPayload;
use crate::emitter::{Emitter, ListenerHandle};
use crate::error::TailError;
use crate::event::{Signal, TailEvent};

/// Namespace-scoped view over an engine's entries
///
/// Receives every entry the engine delivers and re-emits those whose
/// namespace matches its pattern as `op` plus the kind-specific signal.
/// Dropping the filter destroys it.
pub struct SubFilter {
    shared: Arc<FilterShared>,
    registration: ListenerHandle,
}

struct FilterShared {
    matcher: NamespaceMatcher,
    ignore: AtomicBool,
    destroyed: AtomicBool,
    listeners: Emitter<TailEvent>,
}

impl SubFilter {
    pub(crate) fn attach(
        source: &Emitter<Arc<OplogPayload>>,
        pattern: &str,
    ) -> Result<Self, TailError> {
        let matcher = NamespaceMatcher::compile(pattern)?;
        debug!(pattern = matcher.pattern(), "initializing filter");

        let shared = Arc::new(FilterShared {
            matcher,
            ignore: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            listeners: Emitter::new(),
        });

        let weak: Weak<FilterShared> = Arc::downgrade(&shared);
        let registration = source.on(Signal::Op, move |payload: &Arc<OplogPayload>| {
            if let Some(shared) = weak.upgrade() {
                shared.forward(payload);
            }
        });

        Ok(Self {
            shared,
            registration,
        })
    }

    pub fn on<F>(&self, signal: Signal, listener: F) -> ListenerHandle
    where
        F: Fn(&TailEvent) + Send + Sync + 'static,
    {
        self.shared.listeners.on(signal, listener)
    }

    pub fn once<F>(&self, signal: Signal, listener: F) -> ListenerHandle
    where
        F: Fn(&TailEvent) + Send + Sync + 'static,
    {
        self.shared.listeners.once(signal, listener)
    }

    /// Drop matching entries instead of emitting them
    pub fn set_ignore(&self, ignore: bool) {
        self.shared.ignore.store(ignore, Ordering::SeqCst);
    }

    pub fn is_ignored(&self) -> bool {
        self.shared.ignore.load(Ordering::SeqCst)
    }

    pub fn pattern(&self) -> &str {
        self.shared.matcher.pattern()
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }

    /// Emit `destroy`, detach from the engine and drop every listener.
    /// Idempotent, and safe after the engine itself was destroyed.
    pub fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(pattern = self.pattern(), "removing filter bindings");
        self.shared
            .listeners
            .emit(&Signal::Destroy, &TailEvent::Destroy);
        self.registration.remove();
        self.shared.listeners.remove_all();
    }
}

impl Drop for SubFilter {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for SubFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubFilter")
            .field("pattern", &self.pattern())
            .field("ignore", &self.is_ignored())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl FilterShared {
    fn forward(&self, payload: &Arc<OplogPayload>) {
        if self.destroyed.load(Ordering::SeqCst) || self.ignore.load(Ordering::SeqCst) {
            return;
        }
        if !self.matcher.is_match(payload.namespace()) {
            return;
        }

        trace!(pattern = self.matcher.pattern(), ns = payload.namespace(), "filter match");
        let event = TailEvent::Op(Arc::clone(payload));
        self.listeners.emit(&Signal::Op, &event);
        self.listeners.emit(&Signal::from(&payload.kind()), &event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OplogTail, TailOptions};
    use oplogtail_store::MemoryOplog;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn collect(filter: &SubFilter, signal: Signal) -> mpsc::UnboundedReceiver<TailEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        filter.on(signal, move |event| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    async fn recv_ns(rx: &mut mpsc::UnboundedReceiver<TailEvent>) -> String {
        let event = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("listener dropped");
        event.payload().unwrap().namespace().to_string()
    }

    async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<TailEvent>) {
        let next = timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(!matches!(next, Ok(Some(_))), "unexpected event: {:?}", next);
    }

    async fn started(log: &MemoryOplog) -> OplogTail {
        let tail = OplogTail::new(Arc::new(log.clone()), TailOptions::default()).unwrap();
        tail.start().await.unwrap();
        tail
    }

    #[tokio::test]
    async fn test_filter_by_collection() {
        let log = MemoryOplog::new();
        let tail = started(&log).await;
        let e1 = tail.filter("*.e1").unwrap();
        let mut e1_ops = collect(&e1, Signal::Op);
        let mut e1_inserts = collect(&e1, Signal::Insert);

        log.insert("optest.e2", json!({"c": 1}));
        log.insert("optest.e1", json!({"c": 2}));
        log.insert("other.e1", json!({"c": 3}));

        assert_eq!(recv_ns(&mut e1_ops).await, "optest.e1");
        assert_eq!(recv_ns(&mut e1_ops).await, "other.e1");
        assert_eq!(recv_ns(&mut e1_inserts).await, "optest.e1");
        assert_quiet(&mut e1_ops).await;
    }

    #[tokio::test]
    async fn test_filter_exact_namespace() {
        let log = MemoryOplog::new();
        let tail = started(&log).await;
        let filter = tail.filter("optest.cs").unwrap();
        let mut ops = collect(&filter, Signal::Op);

        log.insert("optest.css", json!({}));
        log.insert("optest.cs", json!({}));
        log.insert("OPTEST.CS", json!({}));

        assert_eq!(recv_ns(&mut ops).await, "optest.cs");
        assert_eq!(recv_ns(&mut ops).await, "OPTEST.CS");
        assert_quiet(&mut ops).await;
    }

    #[tokio::test]
    async fn test_ignored_filter_drops_entries() {
        let log = MemoryOplog::new();
        let tail = started(&log).await;
        let filter = tail.filter("*.f").unwrap();
        let mut ops = collect(&filter, Signal::Op);
        let (tx, mut parent_ops) = mpsc::unbounded_channel();
        tail.on(Signal::Op, move |event| {
            let _ = tx.send(event.clone());
        });

        filter.set_ignore(true);
        log.insert("optest.f", json!({}));
        assert_eq!(recv_ns(&mut parent_ops).await, "optest.f");
        assert_quiet(&mut ops).await;

        filter.set_ignore(false);
        log.insert("optest.f", json!({}));
        assert_eq!(recv_ns(&mut ops).await, "optest.f");
    }

    #[tokio::test]
    async fn test_destroy_detaches_filter() {
        let log = MemoryOplog::new();
        let tail = started(&log).await;
        let filter = tail.filter("*.g").unwrap();
        let sibling = tail.filter("*.g").unwrap();
        let mut ops = collect(&filter, Signal::Op);
        let mut sibling_ops = collect(&sibling, Signal::Op);
        let mut destroys = collect(&filter, Signal::Destroy);

        filter.destroy();
        assert!(filter.is_destroyed());
        assert!(destroys.try_recv().is_ok());
        assert_eq!(tail.filter_count(), 1);

        log.insert("optest.g", json!({}));
        assert_eq!(recv_ns(&mut sibling_ops).await, "optest.g");
        assert_quiet(&mut ops).await;

        filter.destroy();
        assert!(destroys.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_drop_detaches_filter() {
        let log = MemoryOplog::new();
        let tail = started(&log).await;
        let filter = tail.filter("*").unwrap();
        assert_eq!(tail.filter_count(), 1);
        drop(filter);
        assert_eq!(tail.filter_count(), 0);
    }

    #[tokio::test]
    async fn test_destroy_after_engine_destroyed() {
        let log = MemoryOplog::new();
        let tail = started(&log).await;
        let filter = tail.filter("*.h").unwrap();
        let mut destroys = collect(&filter, Signal::Destroy);

        tail.destroy().await;
        filter.destroy();
        assert!(destroys.try_recv().is_ok());
        assert!(matches!(tail.filter("*.h"), Err(TailError::Destroyed)));
    }

    #[tokio::test]
    async fn test_filter_accessors() {
        let log = MemoryOplog::new();
        let tail = OplogTail::new(Arc::new(log), TailOptions::default()).unwrap();
        let filter = tail.filter("optest.*").unwrap();
        assert_eq!(filter.pattern(), "optest.*");
        assert!(!filter.is_ignored());
    }
}
