//! Event dispatch to registered per-kind handlers.
//!
//! Every change applied to a kind's store is offered to that kind's handler,
//! if one was registered at construction. Delivery is gated on the
//! coordinator-wide bidirectional-sync flag and serialized per kind through
//! an advisory lock, so same-kind events never overlap while unrelated kinds
//! proceed independently. Handler failures are logged and swallowed; they
//! are never retried and never affect other events.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use kube::api::DynamicObject;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::coordinator::ClusterHandle;

/// Fixed identity under which dispatch locks are taken and handler callbacks
/// run.
pub const SYSTEM_IDENTITY: &str = "sysadmin";

/// System-level credential passed to every handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemCredential {
    /// Identity the callback acts as.
    pub identity: String,
}

impl SystemCredential {
    /// The fixed system credential.
    pub fn system() -> Self {
        Self {
            identity: SYSTEM_IDENTITY.to_string(),
        }
    }
}

/// The payload of one delivered change.
#[derive(Debug, Clone)]
pub enum Change {
    /// A new object appeared.
    Added(Arc<DynamicObject>),
    /// An existing object changed.
    Updated {
        /// Previously stored version.
        old: Arc<DynamicObject>,
        /// Newly delivered version.
        new: Arc<DynamicObject>,
    },
    /// An object disappeared.
    Deleted(Arc<DynamicObject>),
}

/// One change delivered by a kind's subscription, tagged with the kind it
/// originated from.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Resource kind the change originated from.
    pub kind: String,
    /// The change payload.
    pub change: Change,
}

/// Everything a handler callback receives besides the event payload.
#[derive(Clone)]
pub struct DispatchContext {
    /// System-level credential the callback acts under.
    pub credential: SystemCredential,
    /// The cluster the event originated from.
    pub cluster: Arc<dyn ClusterHandle>,
    /// The resource manager (the registered handler itself).
    pub manager: Arc<dyn ResourceHandler>,
}

impl std::fmt::Debug for DispatchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchContext")
            .field("credential", &self.credential)
            .field("cluster", &self.cluster.name())
            .finish()
    }
}

/// Per-kind callbacks invoked for remote object changes.
///
/// Implementations may fail; failures are isolated per event and logged at
/// the dispatch boundary.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// A remote object was created (or seen for the first time).
    async fn on_create(&self, ctx: &DispatchContext, obj: &DynamicObject) -> anyhow::Result<()>;

    /// A remote object was updated.
    async fn on_update(
        &self,
        ctx: &DispatchContext,
        old: &DynamicObject,
        new: &DynamicObject,
    ) -> anyhow::Result<()>;

    /// A remote object was deleted.
    async fn on_delete(&self, ctx: &DispatchContext, obj: &DynamicObject) -> anyhow::Result<()>;
}

/// Advisory lock key for serializing same-kind dispatch.
fn lock_key(kind: &str, credential: &SystemCredential) -> String {
    format!("{}/{}", kind, credential.identity)
}

/// Forwards change events to registered handlers.
///
/// The handler map is frozen at construction. The bidirectional-sync flag is
/// coordinator-wide and read once per delivered event (a per-event snapshot,
/// `SeqCst`), before the advisory lock is taken.
pub struct EventDispatcher {
    handlers: HashMap<String, Arc<dyn ResourceHandler>>,
    locks: HashMap<String, Arc<Mutex<()>>>,
    sync_enabled: AtomicBool,
    credential: SystemCredential,
    cluster: Arc<dyn ClusterHandle>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("kinds", &self.handlers.keys().collect::<Vec<_>>())
            .field("sync_enabled", &self.sync_enabled)
            .finish()
    }
}

impl EventDispatcher {
    /// Creates a dispatcher with an explicit kind-to-handler map.
    ///
    /// Bidirectional sync starts disabled; events are dropped until
    /// [`EventDispatcher::enable_sync`] is called.
    pub(crate) fn new(
        handlers: HashMap<String, Arc<dyn ResourceHandler>>,
        cluster: Arc<dyn ClusterHandle>,
    ) -> Self {
        let credential = SystemCredential::system();
        let locks = handlers
            .keys()
            .map(|kind| {
                (
                    lock_key(kind, &credential),
                    Arc::new(Mutex::new(())),
                )
            })
            .collect();
        Self {
            handlers,
            locks,
            sync_enabled: AtomicBool::new(false),
            credential,
            cluster,
        }
    }

    pub(crate) fn enable_sync(&self) {
        self.sync_enabled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn disable_sync(&self) {
        self.sync_enabled.store(false, Ordering::SeqCst);
    }

    /// Whether delivered events are currently forwarded to handlers.
    pub fn sync_enabled(&self) -> bool {
        self.sync_enabled.load(Ordering::SeqCst)
    }

    /// Offers one change event to its kind's handler.
    ///
    /// No-op when the kind has no handler or bidirectional sync is disabled.
    /// The per-kind lock guard is released on every exit path, including a
    /// failing or panicking handler.
    pub(crate) async fn dispatch(&self, event: ChangeEvent) {
        let Some(handler) = self.handlers.get(&event.kind) else {
            return;
        };
        if !self.sync_enabled.load(Ordering::SeqCst) {
            debug!(kind = %event.kind, "bidirectional sync disabled, dropping event");
            return;
        }
        let Some(lock) = self.locks.get(&lock_key(&event.kind, &self.credential)) else {
            return;
        };
        let _guard = lock.lock().await;

        let ctx = DispatchContext {
            credential: self.credential.clone(),
            cluster: Arc::clone(&self.cluster),
            manager: Arc::clone(handler),
        };
        let result = match &event.change {
            Change::Added(obj) => handler.on_create(&ctx, obj).await,
            Change::Updated { old, new } => handler.on_update(&ctx, old, new).await,
            Change::Deleted(obj) => handler.on_delete(&ctx, obj).await,
        };
        if let Err(e) = result {
            error!(kind = %event.kind, error = %e, "event handler failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::coordinator::ClusterRef;
    use crate::test_utils::{RecordingHandler, pod_object};

    fn dispatcher_with(
        kind: &str,
        handler: Arc<dyn ResourceHandler>,
    ) -> Arc<EventDispatcher> {
        let mut handlers: HashMap<String, Arc<dyn ResourceHandler>> = HashMap::new();
        handlers.insert(kind.to_string(), handler);
        let cluster: Arc<dyn ClusterHandle> = Arc::new(ClusterRef::new("c-1", "test-cluster"));
        Arc::new(EventDispatcher::new(handlers, cluster))
    }

    fn added(kind: &str, name: &str) -> ChangeEvent {
        ChangeEvent {
            kind: kind.to_string(),
            change: Change::Added(Arc::new(pod_object("default", name, "1"))),
        }
    }

    #[tokio::test]
    async fn events_are_dropped_while_sync_is_disabled() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = dispatcher_with("Pod", handler.clone());

        dispatcher.dispatch(added("Pod", "web-0")).await;
        assert_eq!(handler.calls(), Vec::<String>::new());

        dispatcher.enable_sync();
        dispatcher.dispatch(added("Pod", "web-1")).await;
        assert_eq!(handler.calls(), vec!["create:web-1"]);
    }

    #[tokio::test]
    async fn events_without_a_handler_are_ignored() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = dispatcher_with("Pod", handler.clone());
        dispatcher.enable_sync();

        dispatcher.dispatch(added("Secret", "token")).await;
        assert_eq!(handler.calls(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn handler_failure_is_swallowed() {
        let handler = Arc::new(RecordingHandler::failing());
        let dispatcher = dispatcher_with("Pod", handler.clone());
        dispatcher.enable_sync();

        dispatcher.dispatch(added("Pod", "web-0")).await;
        // The failure must not poison later dispatches.
        dispatcher.dispatch(added("Pod", "web-1")).await;
        assert_eq!(handler.calls(), vec!["create:web-0", "create:web-1"]);
    }

    #[tokio::test]
    async fn same_kind_dispatch_is_serialized_in_order() {
        let handler = Arc::new(RecordingHandler::with_delay(Duration::from_millis(30)));
        let dispatcher = dispatcher_with("Pod", handler.clone());
        dispatcher.enable_sync();

        // Start the slow first dispatch, then race a second one against it.
        let d1 = Arc::clone(&dispatcher);
        let first = tokio::spawn(async move { d1.dispatch(added("Pod", "web-0")).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let d2 = Arc::clone(&dispatcher);
        let second = tokio::spawn(async move { d2.dispatch(added("Pod", "web-1")).await });

        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(handler.calls(), vec!["create:web-0", "create:web-1"]);
    }

    #[tokio::test]
    async fn different_kinds_are_not_serialized_against_each_other() {
        let slow = Arc::new(RecordingHandler::with_delay(Duration::from_millis(50)));
        let fast = Arc::new(RecordingHandler::default());
        let mut handlers: HashMap<String, Arc<dyn ResourceHandler>> = HashMap::new();
        handlers.insert("Pod".to_string(), slow.clone() as Arc<dyn ResourceHandler>);
        handlers.insert("Job".to_string(), fast.clone() as Arc<dyn ResourceHandler>);
        let cluster: Arc<dyn ClusterHandle> = Arc::new(ClusterRef::new("c-1", "test-cluster"));
        let dispatcher = Arc::new(EventDispatcher::new(handlers, cluster));
        dispatcher.enable_sync();

        let d1 = Arc::clone(&dispatcher);
        let pod = tokio::spawn(async move { d1.dispatch(added("Pod", "web-0")).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        // The Job event completes while the Pod handler is still sleeping.
        dispatcher.dispatch(added("Job", "backup")).await;
        assert_eq!(fast.calls(), vec!["create:backup"]);
        assert_eq!(slow.calls(), Vec::<String>::new());
        pod.await.unwrap();
        assert_eq!(slow.calls(), vec!["create:web-0"]);
    }

    #[tokio::test]
    async fn disable_takes_effect_for_later_events() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = dispatcher_with("Pod", handler.clone());
        dispatcher.enable_sync();

        dispatcher.dispatch(added("Pod", "web-0")).await;
        dispatcher.disable_sync();
        dispatcher.dispatch(added("Pod", "web-1")).await;
        assert_eq!(handler.calls(), vec!["create:web-0"]);
    }
}
