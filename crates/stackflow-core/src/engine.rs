//! Plan and apply entry points

use crate::context::StackContext;
use crate::error::Result;
use crate::executor::{ApplyExecutor, ApplyOptions, ApplyReport, Cancellation};
use crate::model::Stack;
use crate::plan::{self, Plan};
use crate::provider::ResourceProvider;
use crate::state::StateStore;
use std::sync::Arc;
use tracing::{info, instrument};

/// Provisioning engine for one stack
pub struct Engine {
    executor: ApplyExecutor,
    ctx: StackContext,
    provider: Arc<dyn ResourceProvider>,
    store: Arc<dyn StateStore>,
}

impl Engine {
    pub fn new(
        ctx: StackContext,
        provider: Arc<dyn ResourceProvider>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            executor: ApplyExecutor::new(ctx.clone(), Arc::clone(&provider), Arc::clone(&store)),
            ctx,
            provider,
            store,
        }
    }

    pub fn with_options(mut self, options: ApplyOptions) -> Self {
        self.executor = self.executor.with_options(options);
        self
    }

    pub fn context(&self) -> &StackContext {
        &self.ctx
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Compute a plan against the current state; no side effects
    #[instrument(skip_all, fields(stack = %self.ctx.name, env = %self.ctx.environment))]
    pub async fn plan(&self, stack: &Stack) -> Result<Plan> {
        let state = self.store.load().await?;
        let plan = plan::plan(&self.ctx, stack, &state, self.provider.as_ref())?;
        info!(summary = %plan.summary(), "Plan ready");
        Ok(plan)
    }

    /// Apply a previously computed plan
    #[instrument(skip_all, fields(stack = %self.ctx.name, env = %self.ctx.environment))]
    pub async fn apply(&self, plan: &Plan) -> Result<ApplyReport> {
        self.executor.apply(plan, &Cancellation::new()).await
    }

    /// Apply with a cancellation handle observed between levels
    #[instrument(skip_all, fields(stack = %self.ctx.name, env = %self.ctx.environment))]
    pub async fn apply_with_cancellation(
        &self,
        plan: &Plan,
        cancel: &Cancellation,
    ) -> Result<ApplyReport> {
        self.executor.apply(plan, cancel).await
    }

    /// Plan and apply in one go
    pub async fn converge(&self, stack: &Stack) -> Result<ApplyReport> {
        let plan = self.plan(stack).await?;
        self.apply(&plan).await
    }
}
