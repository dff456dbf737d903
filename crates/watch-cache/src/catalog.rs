//! Resource catalog.
//!
//! Static description of every subscribable resource kind: its API
//! coordinates and whether it must be accessed through the dynamic (untyped)
//! path. The catalog is plain configuration passed into construction, so
//! several coordinators (one per managed cluster) can coexist without any
//! process-wide state.

use kube::api::ApiResource;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// How a resource kind is accessed on the wire.
///
/// `Typed` kinds have a compiled-in schema (k8s-openapi); `Dynamic` kinds are
/// watched through the generic object representation only. The flag is fixed
/// configuration, never inferred at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessPath {
    /// Statically typed access via a compiled-in schema.
    Typed,
    /// Untyped access via the generic object representation.
    Dynamic,
}

/// API coordinates for one subscribable resource kind.
///
/// Immutable once the catalog is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Kind name, e.g. `Pod`.
    pub kind: String,
    /// API group; empty for the core group.
    #[serde(default)]
    pub group: String,
    /// API version within the group, e.g. `v1`.
    pub version: String,
    /// Plural resource name, e.g. `pods`.
    pub resource: String,
    /// Typed or dynamic access path.
    pub access: AccessPath,
}

impl ResourceDescriptor {
    /// Descriptor for a kind with a compiled-in schema.
    pub fn typed(kind: &str, group: &str, version: &str, resource: &str) -> Self {
        Self {
            kind: kind.to_string(),
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
            access: AccessPath::Typed,
        }
    }

    /// Descriptor for a kind accessed through the dynamic path.
    pub fn dynamic(kind: &str, group: &str, version: &str, resource: &str) -> Self {
        Self {
            access: AccessPath::Dynamic,
            ..Self::typed(kind, group, version, resource)
        }
    }

    /// `group/version`, or just `version` for the core group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Human-readable coordinates used in errors and log lines.
    pub fn coordinates(&self) -> String {
        format!("{}/{}/{}", self.group, self.version, self.resource)
    }

    /// The kube `ApiResource` for this descriptor.
    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: self.api_version(),
            kind: self.kind.clone(),
            plural: self.resource.clone(),
        }
    }
}

/// Ordered set of resource descriptors the coordinator subscribes to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCatalog {
    descriptors: Vec<ResourceDescriptor>,
}

impl ResourceCatalog {
    /// Builds a catalog from an explicit descriptor list.
    ///
    /// Rejects duplicate kind names: every descriptor gets at most one
    /// subscription, so two entries for the same kind would be ambiguous.
    pub fn new(descriptors: Vec<ResourceDescriptor>) -> Result<Self, CacheError> {
        for (i, d) in descriptors.iter().enumerate() {
            if descriptors[..i].iter().any(|prev| prev.kind == d.kind) {
                return Err(CacheError::InvalidCatalog(format!(
                    "duplicate descriptor for kind {}",
                    d.kind
                )));
            }
        }
        Ok(Self { descriptors })
    }

    /// Parses a catalog from its YAML representation.
    pub fn from_yaml(input: &str) -> Result<Self, CacheError> {
        let catalog: Self = serde_yaml::from_str(input)
            .map_err(|e| CacheError::InvalidCatalog(e.to_string()))?;
        Self::new(catalog.descriptors)
    }

    /// The built-in descriptor set covering the standard workload, config,
    /// storage and RBAC kinds. Ingress, CronJob and HorizontalPodAutoscaler
    /// go through the dynamic path.
    pub fn default_set() -> Self {
        Self {
            descriptors: vec![
                ResourceDescriptor::typed("Pod", "", "v1", "pods"),
                ResourceDescriptor::typed("Event", "", "v1", "events"),
                ResourceDescriptor::typed("ConfigMap", "", "v1", "configmaps"),
                ResourceDescriptor::typed("Secret", "", "v1", "secrets"),
                ResourceDescriptor::typed("Service", "", "v1", "services"),
                ResourceDescriptor::typed("Namespace", "", "v1", "namespaces"),
                ResourceDescriptor::typed("Node", "", "v1", "nodes"),
                ResourceDescriptor::typed("Endpoints", "", "v1", "endpoints"),
                ResourceDescriptor::typed("LimitRange", "", "v1", "limitranges"),
                ResourceDescriptor::typed("ResourceQuota", "", "v1", "resourcequotas"),
                ResourceDescriptor::typed("ServiceAccount", "", "v1", "serviceaccounts"),
                ResourceDescriptor::typed(
                    "ReplicationController",
                    "",
                    "v1",
                    "replicationcontrollers",
                ),
                ResourceDescriptor::typed("PersistentVolume", "", "v1", "persistentvolumes"),
                ResourceDescriptor::typed(
                    "PersistentVolumeClaim",
                    "",
                    "v1",
                    "persistentvolumeclaims",
                ),
                ResourceDescriptor::typed("Deployment", "apps", "v1", "deployments"),
                ResourceDescriptor::typed("DaemonSet", "apps", "v1", "daemonsets"),
                ResourceDescriptor::typed("StatefulSet", "apps", "v1", "statefulsets"),
                ResourceDescriptor::typed("ReplicaSet", "apps", "v1", "replicasets"),
                ResourceDescriptor::typed("Job", "batch", "v1", "jobs"),
                ResourceDescriptor::typed("StorageClass", "storage.k8s.io", "v1", "storageclasses"),
                ResourceDescriptor::typed("Role", "rbac.authorization.k8s.io", "v1", "roles"),
                ResourceDescriptor::typed(
                    "RoleBinding",
                    "rbac.authorization.k8s.io",
                    "v1",
                    "rolebindings",
                ),
                ResourceDescriptor::typed(
                    "ClusterRole",
                    "rbac.authorization.k8s.io",
                    "v1",
                    "clusterroles",
                ),
                ResourceDescriptor::typed(
                    "ClusterRoleBinding",
                    "rbac.authorization.k8s.io",
                    "v1",
                    "clusterrolebindings",
                ),
                ResourceDescriptor::dynamic("Ingress", "networking.k8s.io", "v1", "ingresses"),
                ResourceDescriptor::dynamic("CronJob", "batch", "v1", "cronjobs"),
                ResourceDescriptor::dynamic(
                    "HorizontalPodAutoscaler",
                    "autoscaling",
                    "v2",
                    "horizontalpodautoscalers",
                ),
            ],
        }
    }

    /// Looks up a descriptor by kind name or plural resource name.
    pub fn resolve(&self, kind_or_resource: &str) -> Result<&ResourceDescriptor, CacheError> {
        self.descriptors
            .iter()
            .find(|d| d.kind == kind_or_resource || d.resource == kind_or_resource)
            .ok_or_else(|| CacheError::DescriptorNotFound(kind_or_resource.to_string()))
    }

    /// All descriptors in catalog order.
    pub fn descriptors(&self) -> &[ResourceDescriptor] {
        &self.descriptors
    }

    /// Number of descriptors in the catalog.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
