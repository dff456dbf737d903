//! Per-kind cache store and read accessors.
//!
//! Each subscription owns exactly one [`WatchStore`] and is its only writer;
//! reads go through [`Lister`] handles and are safe for unlimited concurrent
//! callers. Consistency with the remote source is eventual: a read reflects
//! the most recently applied event for that kind, nothing stronger.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use kube::api::DynamicObject;

use crate::dispatch::{Change, ChangeEvent};

/// Namespace/name index key for one stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// Object namespace; `None` for cluster-scoped objects.
    pub namespace: Option<String>,
    /// Object name.
    pub name: String,
}

impl ObjectKey {
    /// Key of a dynamic object, from its metadata.
    pub fn of(obj: &DynamicObject) -> Self {
        Self {
            namespace: obj.metadata.namespace.clone(),
            name: obj.metadata.name.clone().unwrap_or_default(),
        }
    }
}

type ObjectMap = HashMap<ObjectKey, Arc<DynamicObject>>;

/// Indexed in-memory view of one resource kind.
///
/// Mutated only by the owning subscription's delivery loop; the synced flag
/// is monotonic and set once the initial listing has been fully applied.
#[derive(Debug)]
pub struct WatchStore {
    kind: String,
    objects: RwLock<ObjectMap>,
    synced: AtomicBool,
}

impl WatchStore {
    /// Creates an empty, unsynced store for `kind`.
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            objects: RwLock::new(HashMap::new()),
            synced: AtomicBool::new(false),
        }
    }

    /// The resource kind this store mirrors.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Whether the initial listing has been applied. Monotonic.
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    fn event(&self, change: Change) -> ChangeEvent {
        ChangeEvent {
            kind: self.kind.clone(),
            change,
        }
    }

    /// Applies a delivered object, returning the derived change.
    pub(crate) fn upsert(&self, obj: DynamicObject) -> ChangeEvent {
        let key = ObjectKey::of(&obj);
        let new = Arc::new(obj);
        let old = {
            let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
            objects.insert(key, Arc::clone(&new))
        };
        match old {
            Some(old) => self.event(Change::Updated { old, new }),
            None => self.event(Change::Added(new)),
        }
    }

    /// Removes a delivered object, returning the derived change.
    ///
    /// The deleted payload is the stored version when present, otherwise the
    /// version carried by the delete notification itself.
    pub(crate) fn remove(&self, obj: DynamicObject) -> ChangeEvent {
        let key = ObjectKey::of(&obj);
        let stored = {
            let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
            objects.remove(&key)
        };
        self.event(Change::Deleted(stored.unwrap_or_else(|| Arc::new(obj))))
    }

    /// Swaps in a full listing snapshot and diffs it against the previous
    /// contents, so relists after a desync produce neither gaps nor
    /// duplicates.
    pub(crate) fn replace(&self, snapshot: ObjectMap) -> Vec<ChangeEvent> {
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        let previous = std::mem::replace(&mut *objects, snapshot);

        let mut changes = Vec::new();
        for (key, new) in objects.iter() {
            match previous.get(key) {
                None => changes.push(self.event(Change::Added(Arc::clone(new)))),
                Some(old) if old.metadata.resource_version != new.metadata.resource_version => {
                    changes.push(self.event(Change::Updated {
                        old: Arc::clone(old),
                        new: Arc::clone(new),
                    }));
                }
                Some(_) => {}
            }
        }
        for (key, old) in previous {
            if !objects.contains_key(&key) {
                changes.push(self.event(Change::Deleted(old)));
            }
        }
        changes
    }

    /// Marks the initial listing as applied. Never reverts.
    pub(crate) fn mark_synced(&self) {
        self.synced.store(true, Ordering::SeqCst);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ObjectMap> {
        self.objects.read().unwrap_or_else(|e| e.into_inner())
    }

    /// The most recently applied version of an object, if present.
    pub fn get(&self, namespace: Option<&str>, name: &str) -> Option<Arc<DynamicObject>> {
        let key = ObjectKey {
            namespace: namespace.map(ToString::to_string),
            name: name.to_string(),
        };
        self.read().get(&key).cloned()
    }

    /// All objects currently stored for this kind.
    pub fn list_all(&self) -> Vec<Arc<DynamicObject>> {
        self.read().values().cloned().collect()
    }

    /// All objects within one namespace.
    pub fn list(&self, namespace: &str) -> Vec<Arc<DynamicObject>> {
        self.read()
            .iter()
            .filter(|(key, _)| key.namespace.as_deref() == Some(namespace))
            .map(|(_, obj)| Arc::clone(obj))
            .collect()
    }

    /// Number of objects currently stored.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the store holds no objects.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

/// Read-only handle onto one kind's store.
#[derive(Debug, Clone)]
pub struct Lister {
    store: Arc<WatchStore>,
}

impl Lister {
    pub(crate) fn new(store: Arc<WatchStore>) -> Self {
        Self { store }
    }

    /// The resource kind this lister serves.
    pub fn kind(&self) -> &str {
        self.store.kind()
    }

    /// The most recently applied version of an object, if present.
    pub fn get(&self, namespace: Option<&str>, name: &str) -> Option<Arc<DynamicObject>> {
        self.store.get(namespace, name)
    }

    /// All objects within one namespace.
    pub fn list(&self, namespace: &str) -> Vec<Arc<DynamicObject>> {
        self.store.list(namespace)
    }

    /// All objects for this kind, across namespaces.
    pub fn list_all(&self) -> Vec<Arc<DynamicObject>> {
        self.store.list_all()
    }
}
