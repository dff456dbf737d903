//! Change handler that logs remote object lifecycle events.

use async_trait::async_trait;
use kube::api::DynamicObject;
use tracing::info;
use watch_cache::{DispatchContext, ResourceHandler};

/// Handler that writes one log line per forwarded change.
pub struct LoggingHandler;

fn object_ref(obj: &DynamicObject) -> String {
    match (&obj.metadata.namespace, &obj.metadata.name) {
        (Some(ns), Some(name)) => format!("{ns}/{name}"),
        (None, Some(name)) => name.clone(),
        _ => "<unnamed>".to_string(),
    }
}

#[async_trait]
impl ResourceHandler for LoggingHandler {
    async fn on_create(&self, ctx: &DispatchContext, obj: &DynamicObject) -> anyhow::Result<()> {
        info!(
            cluster = ctx.cluster.name(),
            "created {}",
            object_ref(obj)
        );
        Ok(())
    }

    async fn on_update(
        &self,
        ctx: &DispatchContext,
        old: &DynamicObject,
        new: &DynamicObject,
    ) -> anyhow::Result<()> {
        info!(
            cluster = ctx.cluster.name(),
            "updated {} ({} -> {})",
            object_ref(new),
            old.metadata.resource_version.as_deref().unwrap_or("?"),
            new.metadata.resource_version.as_deref().unwrap_or("?"),
        );
        Ok(())
    }

    async fn on_delete(&self, ctx: &DispatchContext, obj: &DynamicObject) -> anyhow::Result<()> {
        info!(
            cluster = ctx.cluster.name(),
            "deleted {}",
            object_ref(obj)
        );
        Ok(())
    }
}
