//! Cache-specific error types.
//!
//! This module defines error types specific to the watch-cache coordinator
//! that are not covered by upstream library errors.

use thiserror::Error;

/// Errors that can occur while building or using the watch cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cluster answered the self-permission query with an explicit denial.
    #[error("watch not allowed for {descriptor}: {reason}")]
    PermissionDenied {
        /// Coordinates of the descriptor that was denied.
        descriptor: String,
        /// Reason reported by the authorization subsystem.
        reason: String,
    },

    /// The self-permission query itself failed (transport or auth error).
    #[error("permission check failed for {descriptor}")]
    PermissionCheckFailed {
        /// Coordinates of the descriptor whose check failed.
        descriptor: String,
        /// Underlying API error.
        #[source]
        source: kube::Error,
    },

    /// The cancellation signal fired, or a subscription died, before every
    /// subscription completed its initial listing.
    #[error("cache not synced: cancelled before initial listing completed")]
    NotSynced,

    /// No catalog entry matches the given kind or resource name.
    #[error("no descriptor found for kind or resource {0:?}")]
    DescriptorNotFound(String),

    /// Invalid catalog configuration
    #[error("invalid catalog: {0}")]
    InvalidCatalog(String),
}
