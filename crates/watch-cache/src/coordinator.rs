//! Cache coordinator: bring-up, sync barrier, steady state and teardown.
//!
//! One coordinator exists per managed cluster connection. Bring-up resolves
//! the catalog, runs a "watch" permission check for every descriptor, starts
//! one subscription task per kind, then blocks on the sync barrier until
//! every subscription has applied its initial listing. Only then is the
//! coordinator returned; a permission failure or cancellation during
//! bring-up cancels everything and returns an error instead.

use std::collections::HashMap;
use std::sync::Arc;

use kube::Client;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::access::{AccessReviewer, SelfSubjectAccessReviewer};
use crate::catalog::{ResourceCatalog, ResourceDescriptor};
use crate::dispatch::{EventDispatcher, ResourceHandler};
use crate::error::CacheError;
use crate::store::{Lister, WatchStore};
use crate::subscription::{KubeStreamSource, StreamSource, run_subscription};

/// Handle to the cluster a coordinator mirrors, passed through to handler
/// callbacks.
pub trait ClusterHandle: Send + Sync {
    /// Stable cluster identifier.
    fn id(&self) -> &str;
    /// Display name of the cluster.
    fn name(&self) -> &str;
}

/// Plain value implementation of [`ClusterHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRef {
    id: String,
    name: String,
}

impl ClusterRef {
    /// Creates a cluster reference from its id and display name.
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
        }
    }
}

impl ClusterHandle for ClusterRef {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }
}

struct SubscriptionHandle {
    descriptor: ResourceDescriptor,
    store: Arc<WatchStore>,
    synced: watch::Receiver<bool>,
}

/// Bring-up configuration for a [`CacheCoordinator`].
///
/// The catalog and the kind-to-handler map are frozen once `build` is
/// called; no subscription is added or removed afterwards.
pub struct CacheBuilder {
    catalog: ResourceCatalog,
    handlers: HashMap<String, Arc<dyn ResourceHandler>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for CacheBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheBuilder")
            .field("catalog", &self.catalog)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CacheBuilder {
    /// Starts a builder over the given catalog.
    pub fn new(catalog: ResourceCatalog) -> Self {
        Self {
            catalog,
            handlers: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Registers the handler invoked for one kind's change events. The kind
    /// must name a catalog entry; `build` rejects handlers for kinds that
    /// have no subscription.
    pub fn handler(mut self, kind: &str, handler: Arc<dyn ResourceHandler>) -> Self {
        self.handlers.insert(kind.to_string(), handler);
        self
    }

    /// Uses an external cancellation token for bring-up and steady state, so
    /// a process-wide shutdown can abort a coordinator that is still
    /// syncing.
    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Performs permission checks, starts all subscriptions and blocks until
    /// every one has applied its initial listing.
    ///
    /// Fatal outcomes: [`CacheError::PermissionDenied`],
    /// [`CacheError::PermissionCheckFailed`] and [`CacheError::NotSynced`].
    /// On any of them no coordinator is returned and every already-started
    /// subscription is cancelled.
    pub async fn build(
        self,
        cluster: Arc<dyn ClusterHandle>,
        client: Client,
    ) -> Result<CacheCoordinator, CacheError> {
        let reviewer = SelfSubjectAccessReviewer::new(client.clone());
        let source = KubeStreamSource::new(client);
        self.build_with(cluster, &reviewer, &source).await
    }

    /// Bring-up against explicit reviewer and stream-source capabilities.
    pub async fn build_with(
        self,
        cluster: Arc<dyn ClusterHandle>,
        reviewer: &dyn AccessReviewer,
        source: &dyn StreamSource,
    ) -> Result<CacheCoordinator, CacheError> {
        // A handler for an uncataloged kind would never fire; surface the
        // mismatch instead of dropping every event silently.
        for kind in self.handlers.keys() {
            if !self.catalog.descriptors().iter().any(|d| d.kind == *kind) {
                return Err(CacheError::DescriptorNotFound(kind.clone()));
            }
        }

        // All permission checks run before any subscription starts, so a
        // denial never leaves half a coordinator behind.
        for descriptor in self.catalog.descriptors() {
            let decision = reviewer.check(descriptor, "watch", "").await?;
            if !decision.allowed {
                return Err(CacheError::PermissionDenied {
                    descriptor: descriptor.coordinates(),
                    reason: decision.reason,
                });
            }
        }

        let cancel = self.cancel;
        let dispatcher = Arc::new(EventDispatcher::new(self.handlers, Arc::clone(&cluster)));
        let mut subscriptions = HashMap::new();
        let mut tasks = Vec::new();
        for descriptor in self.catalog.descriptors() {
            let store = Arc::new(WatchStore::new(&descriptor.kind));
            let (synced_tx, synced_rx) = watch::channel(false);
            let stream = source.open(descriptor);
            tasks.push(tokio::spawn(run_subscription(
                descriptor.clone(),
                stream,
                Arc::clone(&store),
                Arc::clone(&dispatcher),
                synced_tx,
                cancel.clone(),
            )));
            subscriptions.insert(
                descriptor.kind.clone(),
                SubscriptionHandle {
                    descriptor: descriptor.clone(),
                    store,
                    synced: synced_rx,
                },
            );
        }

        info!(cluster = cluster.name(), "waiting for cache sync");
        for handle in subscriptions.values() {
            let mut synced = handle.synced.clone();
            let result = tokio::select! {
                () = cancel.cancelled() => Err(CacheError::NotSynced),
                changed = synced.wait_for(|synced| *synced) => {
                    // A closed channel means the subscription task died
                    // before its initial listing completed.
                    changed.map(|_| ()).map_err(|_| CacheError::NotSynced)
                }
            };
            if let Err(e) = result {
                error!(
                    cluster = cluster.name(),
                    kind = %handle.descriptor.kind,
                    "cache sync aborted"
                );
                cancel.cancel();
                for task in tasks {
                    let _ = task.await;
                }
                return Err(e);
            }
        }
        info!(cluster = cluster.name(), "cache sync complete");

        Ok(CacheCoordinator {
            catalog: self.catalog,
            subscriptions,
            tasks: std::sync::Mutex::new(tasks),
            cancel,
            dispatcher,
        })
    }
}

/// Live watch cache for one managed cluster.
///
/// Returned by [`CacheBuilder::build`] only after every subscription has
/// synced; serves lister reads and dispatches events until [`stop`] is
/// called.
///
/// [`stop`]: CacheCoordinator::stop
pub struct CacheCoordinator {
    catalog: ResourceCatalog,
    subscriptions: HashMap<String, SubscriptionHandle>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    dispatcher: Arc<EventDispatcher>,
}

impl std::fmt::Debug for CacheCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCoordinator")
            .field("kinds", &self.subscriptions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CacheCoordinator {
    /// Resolves a kind or plural resource name to its descriptor.
    pub fn resolve(&self, kind_or_resource: &str) -> Result<&ResourceDescriptor, CacheError> {
        self.catalog.resolve(kind_or_resource)
    }

    /// Read accessor for one kind, looked up by kind or plural resource
    /// name. The typed/dynamic distinction is invisible here.
    pub fn lister(&self, kind_or_resource: &str) -> Result<Lister, CacheError> {
        let descriptor = self.catalog.resolve(kind_or_resource)?;
        let handle = self
            .subscriptions
            .get(&descriptor.kind)
            .ok_or_else(|| CacheError::DescriptorNotFound(kind_or_resource.to_string()))?;
        Ok(Lister::new(Arc::clone(&handle.store)))
    }

    /// Starts forwarding delivered events to registered handlers.
    pub fn enable_bidirectional_sync(&self) {
        self.dispatcher.enable_sync();
    }

    /// Stops forwarding delivered events; the cache keeps updating.
    pub fn disable_bidirectional_sync(&self) {
        self.dispatcher.disable_sync();
    }

    /// Whether events are currently forwarded to handlers.
    pub fn bidirectional_sync_enabled(&self) -> bool {
        self.dispatcher.sync_enabled()
    }

    /// Raises the shared cancellation signal and waits for every
    /// subscription loop to exit. Idempotent; an in-flight handler
    /// invocation is allowed to finish, so callers needing a shutdown bound
    /// should wrap this in their own timeout.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        if tasks.is_empty() {
            return;
        }
        info!("stopping watch cache");
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl Drop for CacheCoordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
