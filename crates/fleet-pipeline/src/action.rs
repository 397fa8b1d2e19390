//! Ordered, reversible actions.
//!
//! A [`Pipeline`] runs its actions forward in order over one shared,
//! mutable context. When action *k* fails, its `on_error` hook runs and
//! actions `k-1..=0` are rolled back in reverse order. An action that
//! fails must leave no partial work of its own behind.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{PipelineError, PipelineResult};

/// One named step of a pipeline.
#[async_trait]
pub trait Action<C: Send>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn forward(&self, ctx: &mut C) -> PipelineResult<()>;

    /// Undo a successful `forward`. Best-effort: failures are logged.
    async fn backward(&self, _ctx: &mut C) -> PipelineResult<()> {
        Ok(())
    }

    /// Called with the error when this action's `forward` fails.
    fn on_error(&self, _ctx: &C, _err: &PipelineError) {}
}

pub struct Pipeline<C: Send> {
    actions: Vec<Box<dyn Action<C>>>,
}

impl<C: Send> Pipeline<C> {
    pub fn new(actions: Vec<Box<dyn Action<C>>>) -> Self {
        Self { actions }
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run every action. The context holds whatever the last forward left.
    pub async fn execute(&self, ctx: &mut C) -> PipelineResult<()> {
        if self.actions.is_empty() {
            return Err(PipelineError::NoActions);
        }
        for (i, action) in self.actions.iter().enumerate() {
            debug!(action = action.name(), "running action");
            if let Err(err) = action.forward(ctx).await {
                warn!(action = action.name(), error = %err, "action failed, rolling back");
                action.on_error(ctx, &err);
                self.rollback(i, ctx).await;
                return Err(err);
            }
        }
        Ok(())
    }

    async fn rollback(&self, failed: usize, ctx: &mut C) {
        for action in self.actions[..failed].iter().rev() {
            debug!(action = action.name(), "rolling back action");
            if let Err(err) = action.backward(ctx).await {
                warn!(action = action.name(), error = %err, "rollback failed");
            }
        }
    }
}
