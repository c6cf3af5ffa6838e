pub mod context;
pub mod machine;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::controller::context::{ControllerContext, ControllerKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileNext {
    Done,
    After(Duration),
}

impl ReconcileNext {
    pub fn done() -> Self {
        Self::Done
    }

    pub fn after(duration: Duration) -> Self {
        Self::After(duration)
    }
}

/// A reconciler driven by an external scheduler.
///
/// The scheduler decides when passes run; it must never run two passes for
/// the same key at once.
#[async_trait]
pub trait Controller: Send + Sync {
    async fn reconcile(&self, ctx: ControllerContext, key: ControllerKey) -> Result<ReconcileNext>;

    async fn handle_error(
        &self,
        ctx: ControllerContext,
        key: ControllerKey,
        error: anyhow::Error,
    ) -> ReconcileNext;
}

/// One scheduler step: a reconcile pass, with failures routed through `handle_error`.
pub async fn run_pass(
    controller: &dyn Controller,
    ctx: ControllerContext,
    key: ControllerKey,
) -> ReconcileNext {
    let next = match controller.reconcile(ctx.clone(), key.clone()).await {
        Ok(next) => next,
        Err(e) => controller.handle_error(ctx, key.clone(), e).await,
    };

    debug!("next pass for {}: {:?}", key, next);
    next
}
