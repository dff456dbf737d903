//! Watch subscriptions.
//!
//! One long-lived subscription runs per cataloged resource kind: an initial
//! full listing followed by an unbounded stream of change notifications,
//! treated as one logical source (list-then-watch). Each subscription's
//! delivery loop is its store's single writer and forwards derived changes
//! to the dispatcher. All loops observe one shared cancellation signal.

use std::collections::HashMap;
use std::sync::Arc;

use futures::TryStreamExt;
use futures::stream::{BoxStream, StreamExt};
use kube::api::{Api, DynamicObject};
use kube::{Client, Resource};
use kube_runtime::{WatchStreamExt, watcher};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{AccessPath, ResourceDescriptor};
use crate::dispatch::EventDispatcher;
use crate::store::{ObjectKey, WatchStore};

/// The change stream for one resource kind: watcher events over the uniform
/// dynamic object representation, regardless of access path.
pub type WatchStream = BoxStream<'static, Result<watcher::Event<DynamicObject>, watcher::Error>>;

/// Opens the change stream for a descriptor.
///
/// Abstracted from the cluster client so subscriptions can be driven from
/// scripted streams in tests.
pub trait StreamSource: Send + Sync {
    /// Opens one list-then-watch stream for `descriptor`.
    fn open(&self, descriptor: &ResourceDescriptor) -> WatchStream;
}

/// [`StreamSource`] backed by a live cluster connection.
///
/// Typed descriptors are watched through their compiled-in schema and erased
/// to the dynamic representation; dynamic descriptors are watched through
/// the generic API directly. Both paths relist and resume on desync instead
/// of terminating.
#[derive(Clone)]
pub struct KubeStreamSource {
    client: Client,
}

impl std::fmt::Debug for KubeStreamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStreamSource").finish()
    }
}

impl KubeStreamSource {
    /// Creates a stream source for the cluster behind `client`.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn typed<K>(&self, descriptor: &ResourceDescriptor) -> WatchStream
    where
        K: Resource<DynamicType = ()>
            + Clone
            + std::fmt::Debug
            + Serialize
            + DeserializeOwned
            + Send
            + 'static,
    {
        let api: Api<K> = Api::all_with(self.client.clone(), &());
        let descriptor = descriptor.clone();
        watcher(api, watcher::Config::default())
            .default_backoff()
            .map_ok(move |event| match event {
                watcher::Event::Init => watcher::Event::Init,
                watcher::Event::InitApply(obj) => {
                    watcher::Event::InitApply(erase(&obj, &descriptor))
                }
                watcher::Event::InitDone => watcher::Event::InitDone,
                watcher::Event::Apply(obj) => watcher::Event::Apply(erase(&obj, &descriptor)),
                watcher::Event::Delete(obj) => watcher::Event::Delete(erase(&obj, &descriptor)),
            })
            .boxed()
    }

    fn dynamic(&self, descriptor: &ResourceDescriptor) -> WatchStream {
        let resource = descriptor.api_resource();
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed()
    }
}

impl StreamSource for KubeStreamSource {
    fn open(&self, descriptor: &ResourceDescriptor) -> WatchStream {
        use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
        use k8s_openapi::api::batch::v1::Job;
        use k8s_openapi::api::core::v1::{
            ConfigMap, Endpoints, Event as CoreEvent, LimitRange, Namespace, Node,
            PersistentVolume, PersistentVolumeClaim, Pod, ReplicationController, ResourceQuota,
            Secret, Service, ServiceAccount,
        };
        use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
        use k8s_openapi::api::storage::v1::StorageClass;

        if descriptor.access == AccessPath::Dynamic {
            return self.dynamic(descriptor);
        }
        match descriptor.kind.as_str() {
            "Pod" => self.typed::<Pod>(descriptor),
            "Event" => self.typed::<CoreEvent>(descriptor),
            "ConfigMap" => self.typed::<ConfigMap>(descriptor),
            "Secret" => self.typed::<Secret>(descriptor),
            "Service" => self.typed::<Service>(descriptor),
            "Namespace" => self.typed::<Namespace>(descriptor),
            "Node" => self.typed::<Node>(descriptor),
            "Endpoints" => self.typed::<Endpoints>(descriptor),
            "LimitRange" => self.typed::<LimitRange>(descriptor),
            "ResourceQuota" => self.typed::<ResourceQuota>(descriptor),
            "ServiceAccount" => self.typed::<ServiceAccount>(descriptor),
            "PersistentVolume" => self.typed::<PersistentVolume>(descriptor),
            "PersistentVolumeClaim" => self.typed::<PersistentVolumeClaim>(descriptor),
            "ReplicationController" => self.typed::<ReplicationController>(descriptor),
            "Deployment" => self.typed::<Deployment>(descriptor),
            "DaemonSet" => self.typed::<DaemonSet>(descriptor),
            "StatefulSet" => self.typed::<StatefulSet>(descriptor),
            "ReplicaSet" => self.typed::<ReplicaSet>(descriptor),
            "Job" => self.typed::<Job>(descriptor),
            "StorageClass" => self.typed::<StorageClass>(descriptor),
            "Role" => self.typed::<Role>(descriptor),
            "RoleBinding" => self.typed::<RoleBinding>(descriptor),
            "ClusterRole" => self.typed::<ClusterRole>(descriptor),
            "ClusterRoleBinding" => self.typed::<ClusterRoleBinding>(descriptor),
            other => {
                warn!(
                    kind = other,
                    "no compiled-in schema for typed descriptor, falling back to dynamic path"
                );
                self.dynamic(descriptor)
            }
        }
    }
}

/// Converts a typed object into the uniform dynamic representation, keeping
/// its metadata and serializing the rest of the payload.
fn erase<K>(obj: &K, descriptor: &ResourceDescriptor) -> DynamicObject
where
    K: Resource + Serialize,
{
    let mut dynamic = DynamicObject::new(
        obj.meta().name.as_deref().unwrap_or_default(),
        &descriptor.api_resource(),
    );
    dynamic.metadata = obj.meta().clone();
    let mut data = serde_json::to_value(obj)
        .unwrap_or_else(|_| serde_json::Value::Object(serde_json::Map::new()));
    if let serde_json::Value::Object(map) = &mut data {
        // Carried in the envelope already.
        map.remove("apiVersion");
        map.remove("kind");
        map.remove("metadata");
    }
    dynamic.data = data;
    dynamic
}

/// Delivery loop for one subscription.
///
/// Runs until the cancellation signal fires or the stream ends. Stream error
/// items are logged and skipped; the backoff-wrapped watcher relists on its
/// own. The synced flag is sent once the initial listing has been fully
/// applied and never reverts.
pub(crate) async fn run_subscription(
    descriptor: ResourceDescriptor,
    mut stream: WatchStream,
    store: Arc<WatchStore>,
    dispatcher: Arc<EventDispatcher>,
    synced_tx: watch::Sender<bool>,
    cancel: CancellationToken,
) {
    info!(kind = %descriptor.kind, "starting watch subscription");
    let mut snapshot: Option<HashMap<ObjectKey, Arc<DynamicObject>>> = None;

    loop {
        let item = tokio::select! {
            () = cancel.cancelled() => break,
            item = stream.next() => item,
        };
        let Some(item) = item else {
            warn!(kind = %descriptor.kind, "watch stream ended");
            break;
        };
        let event = match item {
            Ok(event) => event,
            Err(e) => {
                warn!(kind = %descriptor.kind, error = %e, "watch stream error");
                continue;
            }
        };

        let changes = match event {
            watcher::Event::Init => {
                debug!(kind = %descriptor.kind, "initial listing started");
                snapshot = Some(HashMap::new());
                Vec::new()
            }
            watcher::Event::InitApply(obj) => {
                if let Some(pending) = snapshot.as_mut() {
                    pending.insert(ObjectKey::of(&obj), Arc::new(obj));
                }
                Vec::new()
            }
            watcher::Event::InitDone => {
                let changes = match snapshot.take() {
                    Some(pending) => store.replace(pending),
                    None => Vec::new(),
                };
                store.mark_synced();
                // Offer listing-derived changes before releasing the sync
                // barrier, so bring-up completes with no dispatch in flight.
                for change in changes {
                    dispatcher.dispatch(change).await;
                }
                // Receiver may be gone once bring-up has completed.
                let _ = synced_tx.send(true);
                info!(kind = %descriptor.kind, objects = store.len(), "initial listing applied");
                Vec::new()
            }
            watcher::Event::Apply(obj) => vec![store.upsert(obj)],
            watcher::Event::Delete(obj) => vec![store.remove(obj)],
        };

        for change in changes {
            dispatcher.dispatch(change).await;
        }
    }
    debug!(kind = %descriptor.kind, "watch subscription stopped");
}
