//! Test utilities for unit testing the watch cache.
//!
//! This module provides helpers for creating test objects, recording
//! handlers, and scripted replacements for the cluster-facing seams.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use kube::api::DynamicObject;
use kube_runtime::watcher;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::access::{AccessDecision, AccessReviewer};
use crate::catalog::{ResourceCatalog, ResourceDescriptor};
use crate::dispatch::{DispatchContext, ResourceHandler};
use crate::error::CacheError;
use crate::subscription::{StreamSource, WatchStream};

/// A dynamic Pod object with the given namespace, name and resource version.
pub fn pod_object(namespace: &str, name: &str, resource_version: &str) -> DynamicObject {
    let descriptor = pod_descriptor();
    let mut obj = DynamicObject::new(name, &descriptor.api_resource()).within(namespace);
    obj.metadata.resource_version = Some(resource_version.to_string());
    obj
}

/// The typed Pod descriptor.
pub fn pod_descriptor() -> ResourceDescriptor {
    ResourceDescriptor::typed("Pod", "", "v1", "pods")
}

/// A small catalog for coordinator tests: typed Pod and Job, plus a typed
/// Secret.
pub fn small_catalog() -> ResourceCatalog {
    ResourceCatalog::new(vec![
        pod_descriptor(),
        ResourceDescriptor::typed("Job", "batch", "v1", "jobs"),
        ResourceDescriptor::typed("Secret", "", "v1", "secrets"),
    ])
    .unwrap()
}

type WatchItem = Result<watcher::Event<DynamicObject>, watcher::Error>;

fn receiver_stream(rx: UnboundedReceiver<WatchItem>) -> impl futures::Stream<Item = WatchItem> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
}

/// A watch stream fed from a channel, for driving a subscription loop by
/// hand.
pub fn channel_stream() -> (UnboundedSender<WatchItem>, WatchStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, receiver_stream(rx).boxed())
}

/// Handler that records every invocation as `"<op>:<name>"`.
#[derive(Default)]
pub struct RecordingHandler {
    calls: Mutex<Vec<String>>,
    delay: Option<Duration>,
    fail: bool,
}

impl RecordingHandler {
    /// Handler whose callbacks sleep before recording, to expose ordering.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Handler whose callbacks record and then fail.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// All recorded invocations, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Polls until at least `count` invocations were recorded.
    pub async fn wait_for_calls(&self, count: usize, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.calls.lock().unwrap().len() < count {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {count} handler calls, got {:?}",
                self.calls()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn record(&self, op: &str, obj: &DynamicObject) -> anyhow::Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let name = obj.metadata.name.as_deref().unwrap_or("<unknown>");
        self.calls.lock().unwrap().push(format!("{op}:{name}"));
        if self.fail {
            anyhow::bail!("handler rejected {op} for {name}");
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceHandler for RecordingHandler {
    async fn on_create(&self, _ctx: &DispatchContext, obj: &DynamicObject) -> anyhow::Result<()> {
        self.record("create", obj).await
    }

    async fn on_update(
        &self,
        _ctx: &DispatchContext,
        _old: &DynamicObject,
        new: &DynamicObject,
    ) -> anyhow::Result<()> {
        self.record("update", new).await
    }

    async fn on_delete(&self, _ctx: &DispatchContext, obj: &DynamicObject) -> anyhow::Result<()> {
        self.record("delete", obj).await
    }
}

/// Reviewer with a fixed verdict per kind: allowed by default, denied or
/// erroring where configured.
#[derive(Default)]
pub struct StaticReviewer {
    denied: HashMap<String, String>,
    failing: Vec<String>,
}

impl StaticReviewer {
    /// Reviewer that allows everything.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Denies the given kind with a reason.
    pub fn deny(mut self, kind: &str, reason: &str) -> Self {
        self.denied.insert(kind.to_string(), reason.to_string());
        self
    }

    /// Makes the check itself fail for the given kind.
    pub fn fail_check(mut self, kind: &str) -> Self {
        self.failing.push(kind.to_string());
        self
    }
}

#[async_trait]
impl AccessReviewer for StaticReviewer {
    async fn check(
        &self,
        descriptor: &ResourceDescriptor,
        _verb: &str,
        _namespace: &str,
    ) -> Result<AccessDecision, CacheError> {
        if self.failing.contains(&descriptor.kind) {
            return Err(CacheError::PermissionCheckFailed {
                descriptor: descriptor.coordinates(),
                source: kube::Error::Api(kube::error::ErrorResponse {
                    status: "Failure".to_string(),
                    message: "authorization webhook unreachable".to_string(),
                    reason: "InternalError".to_string(),
                    code: 500,
                }),
            });
        }
        match self.denied.get(&descriptor.kind) {
            Some(reason) => Ok(AccessDecision {
                allowed: false,
                reason: reason.clone(),
            }),
            None => Ok(AccessDecision {
                allowed: true,
                reason: String::new(),
            }),
        }
    }
}

/// Per-kind behavior of a [`ScriptedSource`] stream.
#[derive(Clone)]
pub enum StreamScript {
    /// Initial listing with the given objects, then an open channel the test
    /// can feed through [`ScriptedSource::send`].
    Listing(Vec<DynamicObject>),
    /// Initial listing never completes; the stream stays open.
    Stalled,
    /// The stream ends immediately without ever syncing.
    Ended,
}

/// Stream source whose per-kind behavior is scripted by the test.
pub struct ScriptedSource {
    scripts: HashMap<String, StreamScript>,
    senders: Mutex<HashMap<String, UnboundedSender<WatchItem>>>,
}

impl ScriptedSource {
    /// Source where every kind syncs with an empty listing.
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            senders: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the behavior for one kind.
    pub fn script(mut self, kind: &str, script: StreamScript) -> Self {
        self.scripts.insert(kind.to_string(), script);
        self
    }

    /// Feeds a live event into an open kind stream. Returns false once the
    /// subscription loop has gone away.
    pub fn send(&self, kind: &str, event: watcher::Event<DynamicObject>) -> bool {
        let senders = self.senders.lock().unwrap();
        match senders.get(kind) {
            Some(tx) => tx.send(Ok(event)).is_ok(),
            None => false,
        }
    }
}

impl StreamSource for ScriptedSource {
    fn open(&self, descriptor: &ResourceDescriptor) -> WatchStream {
        let script = self
            .scripts
            .get(&descriptor.kind)
            .cloned()
            .unwrap_or(StreamScript::Listing(Vec::new()));
        match script {
            StreamScript::Ended => stream::empty().boxed(),
            StreamScript::Stalled => stream::iter(vec![Ok(watcher::Event::Init)])
                .chain(stream::pending())
                .boxed(),
            StreamScript::Listing(objects) => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.senders
                    .lock()
                    .unwrap()
                    .insert(descriptor.kind.clone(), tx);
                let mut head: Vec<WatchItem> = vec![Ok(watcher::Event::Init)];
                head.extend(
                    objects
                        .into_iter()
                        .map(|obj| Ok(watcher::Event::InitApply(obj))),
                );
                head.push(Ok(watcher::Event::InitDone));
                stream::iter(head).chain(receiver_stream(rx)).boxed()
            }
        }
    }
}
