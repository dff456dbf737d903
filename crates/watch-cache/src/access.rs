//! Permission prechecks.
//!
//! Before a subscription is opened, the caller's permission to watch the
//! resource kind is verified with a self-permission query against the target
//! cluster's authorization subsystem. Two failure modes are distinct: the
//! query itself failing (transport or auth error) and the query succeeding
//! with a negative verdict. Both abort bring-up.

use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use kube::api::PostParams;
use kube::{Api, Client};
use tracing::debug;

use crate::catalog::ResourceDescriptor;
use crate::error::CacheError;

/// Verdict of one permission check, produced once per descriptor during
/// bring-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDecision {
    /// Whether the verb is allowed on the descriptor's coordinates.
    pub allowed: bool,
    /// Reason reported by the authorization subsystem; may be empty.
    pub reason: String,
}

/// Answers "may I perform this verb on this resource kind?" for the target
/// cluster. Abstracted so bring-up can be exercised without a live cluster.
#[async_trait]
pub trait AccessReviewer: Send + Sync {
    /// Runs one self-permission query.
    ///
    /// A transport or auth failure of the query itself surfaces as
    /// [`CacheError::PermissionCheckFailed`]; a negative verdict comes back
    /// as a decision with `allowed == false`.
    async fn check(
        &self,
        descriptor: &ResourceDescriptor,
        verb: &str,
        namespace: &str,
    ) -> Result<AccessDecision, CacheError>;
}

/// [`AccessReviewer`] backed by the cluster's `SelfSubjectAccessReview` API.
#[derive(Clone)]
pub struct SelfSubjectAccessReviewer {
    api: Api<SelfSubjectAccessReview>,
}

impl std::fmt::Debug for SelfSubjectAccessReviewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfSubjectAccessReviewer").finish()
    }
}

impl SelfSubjectAccessReviewer {
    /// Creates a reviewer for the cluster behind `client`.
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl AccessReviewer for SelfSubjectAccessReviewer {
    async fn check(
        &self,
        descriptor: &ResourceDescriptor,
        verb: &str,
        namespace: &str,
    ) -> Result<AccessDecision, CacheError> {
        let review = SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(ResourceAttributes {
                    namespace: if namespace.is_empty() {
                        None
                    } else {
                        Some(namespace.to_string())
                    },
                    verb: Some(verb.to_string()),
                    group: Some(descriptor.group.clone()),
                    resource: Some(descriptor.resource.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        let response = self
            .api
            .create(&PostParams::default(), &review)
            .await
            .map_err(|source| CacheError::PermissionCheckFailed {
                descriptor: descriptor.coordinates(),
                source,
            })?;

        let status = response.status.unwrap_or_default();
        debug!(
            descriptor = %descriptor.coordinates(),
            verb,
            allowed = status.allowed,
            "self subject access review"
        );
        Ok(AccessDecision {
            allowed: status.allowed,
            reason: status.reason.unwrap_or_default(),
        })
    }
}
