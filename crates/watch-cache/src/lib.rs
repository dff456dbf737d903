//! Watch-cache coordinator for remote Kubernetes clusters.
//!
//! Maintains a live, read-optimized mirror of a managed cluster's resource
//! state so higher-level reconciliation logic never has to round-trip to the
//! cluster API for reads. One watch subscription runs per cataloged resource
//! kind; each subscription performs an initial listing followed by an
//! unbounded change stream (list-then-watch), populates its own indexed
//! store, and forwards derived change events to a registered handler.
//!
//! Bring-up is all-or-nothing: every kind's "watch" permission is verified
//! against the cluster before any subscription starts, and [`CacheBuilder`]
//! only returns a [`CacheCoordinator`] once every subscription has applied
//! its initial listing.

pub mod access;
pub mod catalog;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod store;
pub mod subscription;

#[cfg(test)]
mod test_utils;

pub use access::{AccessDecision, AccessReviewer, SelfSubjectAccessReviewer};
pub use catalog::{AccessPath, ResourceCatalog, ResourceDescriptor};
pub use coordinator::{CacheBuilder, CacheCoordinator, ClusterHandle, ClusterRef};
pub use dispatch::{Change, ChangeEvent, DispatchContext, ResourceHandler, SystemCredential};
pub use error::CacheError;
pub use store::Lister;
pub use subscription::{KubeStreamSource, StreamSource, WatchStream};
