//! Apply executor
//!
//! Runs a [`Plan`] level by level. Steps inside a level run concurrently,
//! bounded by a semaphore; a level starts only once every step of the
//! previous one is terminal. Each successful step is persisted to the state
//! store immediately, so an interrupted apply loses at most the steps that
//! were in flight.

use crate::context::StackContext;
use crate::error::{ProviderError, Result, StackError};
use crate::model::NodeStatus;
use crate::plan::{self, Plan, PlanAction, PlanStep};
use crate::provider::{Outputs, ResolvedNode, ResourceProvider};
use crate::retry::{RetryConfig, with_retry};
use crate::state::{StateLock, StateRecord, StateStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Options for an apply session
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOptions {
    /// Maximum number of steps running at once
    pub parallelism: usize,

    /// Upper bound for a single provider call
    pub step_timeout: Duration,

    pub retry: RetryConfig,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            parallelism: 10,
            step_timeout: Duration::from_secs(300),
            retry: RetryConfig::default(),
        }
    }
}

/// Cooperative cancellation, observed between levels
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of one plan step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub id: String,
    pub resource_type: String,

    /// Action actually taken (a no-op may be promoted at apply time)
    pub action: PlanAction,

    pub status: NodeStatus,

    pub error: Option<String>,

    /// Provider calls made, retries included
    pub attempts: u32,

    #[serde(default)]
    pub outputs: Outputs,
}

impl NodeResult {
    fn planned(step: &PlanStep) -> Self {
        Self {
            id: step.node.clone(),
            resource_type: step.resource_type.clone(),
            action: step.action,
            status: NodeStatus::Planned,
            error: None,
            attempts: 0,
            outputs: Outputs::new(),
        }
    }

    fn fail(&mut self, error: impl Into<String>) {
        self.status = NodeStatus::Failed;
        self.error = Some(error.into());
    }
}

/// A stack output after apply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedOutput {
    pub name: String,
    pub description: String,
    pub sensitive: bool,

    /// `None` when the producing node has no such attribute
    pub value: Option<serde_json::Value>,
}

/// Result of applying a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyReport {
    pub session_id: String,

    /// One entry per plan step, in plan order
    pub results: Vec<NodeResult>,

    pub exports: Vec<ExportedOutput>,

    /// Total execution time in milliseconds
    pub duration_ms: u64,

    /// Apply stopped between levels on request
    pub cancelled: bool,
}

impl ApplyReport {
    /// Every step ended `Applied` or `Destroyed`
    pub fn is_success(&self) -> bool {
        self.results
            .iter()
            .all(|r| matches!(r.status, NodeStatus::Applied | NodeStatus::Destroyed))
    }

    pub fn result(&self, id: &str) -> Option<&NodeResult> {
        self.results.iter().find(|r| r.id == id)
    }

    pub fn export(&self, name: &str) -> Option<&ExportedOutput> {
        self.exports.iter().find(|e| e.name == name)
    }

    pub fn with_status(&self, status: NodeStatus) -> Vec<&NodeResult> {
        self.results.iter().filter(|r| r.status == status).collect()
    }

    pub fn failed(&self) -> Vec<&NodeResult> {
        self.with_status(NodeStatus::Failed)
    }

    pub fn skipped(&self) -> Vec<&NodeResult> {
        self.with_status(NodeStatus::Skipped)
    }
}

impl fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Apply {}: {} applied, {} destroyed, {} failed, {} skipped",
            if self.cancelled { "cancelled" } else { "complete" },
            self.with_status(NodeStatus::Applied).len(),
            self.with_status(NodeStatus::Destroyed).len(),
            self.failed().len(),
            self.skipped().len(),
        )?;
        for result in &self.results {
            write!(f, "  {}: {} ({})", result.id, result.action, result.status)?;
            if let Some(error) = &result.error {
                write!(f, ": {}", error)?;
            }
            writeln!(f)?;
        }
        if !self.exports.is_empty() {
            writeln!(f, "Outputs:")?;
            for export in &self.exports {
                match (&export.value, export.sensitive) {
                    (_, true) => writeln!(f, "  {} = <sensitive>", export.name)?,
                    (Some(value), false) => writeln!(f, "  {} = {}", export.name, value)?,
                    (None, false) => writeln!(f, "  {} = <unknown>", export.name)?,
                }
            }
        }
        Ok(())
    }
}

/// Work handed to a step task
struct StepJob {
    node: ResolvedNode,
    action: PlanAction,
    hash: String,
    dependencies: Vec<String>,
    previous: Option<StateRecord>,
}

struct StepOutcome {
    status: NodeStatus,
    error: Option<String>,
    attempts: u32,
    outputs: Outputs,
}

impl StepOutcome {
    fn failed(error: impl fmt::Display, attempts: u32) -> Self {
        Self {
            status: NodeStatus::Failed,
            error: Some(error.to_string()),
            attempts,
            outputs: Outputs::new(),
        }
    }
}

/// Shared by every step task of a session
struct StepRunner {
    ctx: StackContext,
    provider: Arc<dyn ResourceProvider>,
    store: Arc<dyn StateStore>,
    lock: StateLock,
    options: ApplyOptions,
}

impl StepRunner {
    async fn run(&self, job: StepJob) -> StepOutcome {
        match job.action {
            PlanAction::Create => self.create(&job, 0).await,
            PlanAction::Update => self.update(&job).await,
            PlanAction::Replace => self.replace(&job).await,
            PlanAction::Destroy => self.destroy(&job).await,
            PlanAction::NoOp => StepOutcome {
                status: NodeStatus::Applied,
                error: None,
                attempts: 0,
                outputs: job
                    .previous
                    .as_ref()
                    .map(|p| p.outputs.clone())
                    .unwrap_or_default(),
            },
        }
    }

    async fn call<T, F, Fut>(
        &self,
        operation: &str,
        call: F,
    ) -> (std::result::Result<T, ProviderError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, ProviderError>>,
    {
        with_retry(&self.options.retry, self.options.step_timeout, operation, call).await
    }

    async fn create(&self, job: &StepJob, prior_attempts: u32) -> StepOutcome {
        let (provider, ctx, node) = (self.provider.as_ref(), &self.ctx, &job.node);
        let (result, attempts) = self.call("create", move || provider.create(ctx, node)).await;
        let attempts = attempts + prior_attempts;

        match result {
            Ok(outputs) => self.record(job, outputs, attempts).await,
            Err(e) => StepOutcome::failed(e, attempts),
        }
    }

    async fn update(&self, job: &StepJob) -> StepOutcome {
        let Some(previous) = job.previous.as_ref() else {
            return StepOutcome::failed("no state record to update", 0);
        };
        let (provider, ctx, node) = (self.provider.as_ref(), &self.ctx, &job.node);
        let (result, attempts) = self
            .call("update", move || provider.update(ctx, node, previous))
            .await;

        match result {
            Ok(outputs) => self.record(job, outputs, attempts).await,
            Err(e) => StepOutcome::failed(e, attempts),
        }
    }

    async fn replace(&self, job: &StepJob) -> StepOutcome {
        let Some(previous) = job.previous.as_ref() else {
            return self.create(job, 0).await;
        };
        let (provider, ctx) = (self.provider.as_ref(), &self.ctx);
        let (result, attempts) = self
            .call("destroy", move || provider.destroy(ctx, previous))
            .await;
        if let Err(e) = result {
            return StepOutcome::failed(e, attempts);
        }

        // the old resource is gone; forget it before creating the new one
        if let Err(e) = self.store.remove_record(&self.lock, &previous.id).await {
            return StepOutcome::failed(e, attempts);
        }
        self.create(job, attempts).await
    }

    async fn destroy(&self, job: &StepJob) -> StepOutcome {
        let Some(previous) = job.previous.as_ref() else {
            return StepOutcome::failed("no state record to destroy", 0);
        };
        let (provider, ctx) = (self.provider.as_ref(), &self.ctx);
        let (result, attempts) = self
            .call("destroy", move || provider.destroy(ctx, previous))
            .await;
        if let Err(e) = result {
            return StepOutcome::failed(e, attempts);
        }

        match self.store.remove_record(&self.lock, &previous.id).await {
            Ok(()) => StepOutcome {
                status: NodeStatus::Destroyed,
                error: None,
                attempts,
                outputs: Outputs::new(),
            },
            Err(e) => StepOutcome::failed(e, attempts),
        }
    }

    async fn record(&self, job: &StepJob, outputs: Outputs, attempts: u32) -> StepOutcome {
        let record = StateRecord {
            id: job.node.id.clone(),
            resource_type: job.node.resource_type.clone(),
            config_hash: job.hash.clone(),
            config: job.node.config.clone(),
            outputs: outputs.clone(),
            dependencies: job.dependencies.clone(),
            last_applied_at: Utc::now(),
        };

        match self.store.put_record(&self.lock, record).await {
            Ok(()) => StepOutcome {
                status: NodeStatus::Applied,
                error: None,
                attempts,
                outputs,
            },
            Err(e) => StepOutcome::failed(format!("state write failed: {}", e), attempts),
        }
    }
}

/// Executes plans against a provider and a state store
pub struct ApplyExecutor {
    ctx: StackContext,
    provider: Arc<dyn ResourceProvider>,
    store: Arc<dyn StateStore>,
    options: ApplyOptions,
}

impl ApplyExecutor {
    pub fn new(
        ctx: StackContext,
        provider: Arc<dyn ResourceProvider>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            ctx,
            provider,
            store,
            options: ApplyOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ApplyOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &ApplyOptions {
        &self.options
    }

    /// Apply `plan`
    ///
    /// Fails only before any mutation (`StateLocked`, `StalePlan`, state
    /// read errors). Once steps run, every outcome is reported per node.
    pub async fn apply(&self, plan: &Plan, cancel: &Cancellation) -> Result<ApplyReport> {
        let started = Instant::now();
        let session_id = uuid::Uuid::new_v4().to_string();

        let lock = self.store.lock(&session_id).await?;
        let state = self.store.load().await?;
        if state.serial != plan.state_serial {
            return Err(StackError::StalePlan {
                planned: plan.state_serial,
                current: state.serial,
            });
        }

        info!(
            session = %session_id,
            steps = plan.steps.len(),
            summary = %plan.summary(),
            "Applying plan"
        );

        let mut live: HashMap<String, Outputs> = state
            .resources
            .values()
            .map(|r| (r.id.clone(), r.outputs.clone()))
            .collect();
        let mut results: Vec<NodeResult> = plan.steps.iter().map(NodeResult::planned).collect();
        let index: HashMap<String, usize> = plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.node.clone(), i))
            .collect();

        let runner = Arc::new(StepRunner {
            ctx: self.ctx.clone(),
            provider: Arc::clone(&self.provider),
            store: Arc::clone(&self.store),
            lock,
            options: self.options.clone(),
        });
        let semaphore = Arc::new(Semaphore::new(self.options.parallelism.max(1)));
        let mut cancelled = false;

        for (level, steps) in plan.levels().into_iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(session = %session_id, level, "Apply cancelled");
                cancelled = true;
                break;
            }
            debug!(level, steps = steps.len(), "Starting level");

            let mut tasks = JoinSet::new();
            for step in steps {
                let i = index[&step.node];

                let blocked = step.after.iter().find(|dep| {
                    index.get(dep.as_str()).is_some_and(|&d| {
                        matches!(results[d].status, NodeStatus::Failed | NodeStatus::Skipped)
                    })
                });
                if let Some(dep) = blocked {
                    debug!(node = %step.node, producer = %dep, "Skipping step");
                    results[i].status = NodeStatus::Skipped;
                    continue;
                }

                let job = match self.prepare(step, &live) {
                    Ok(job) => job,
                    Err(e) => {
                        warn!(node = %step.node, error = %e, "Step failed before dispatch");
                        results[i].fail(e.to_string());
                        continue;
                    }
                };
                results[i].action = job.action;
                results[i].status = NodeStatus::Applying;

                let runner = Arc::clone(&runner);
                let semaphore = Arc::clone(&semaphore);
                tasks.spawn(async move {
                    let outcome = match semaphore.acquire_owned().await {
                        Ok(_permit) => runner.run(job).await,
                        Err(e) => StepOutcome::failed(e, 0),
                    };
                    (i, outcome)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let (i, outcome) = match joined {
                    Ok(done) => done,
                    Err(e) => {
                        warn!(error = %e, "Step task aborted");
                        continue;
                    }
                };

                let result = &mut results[i];
                result.status = outcome.status;
                result.error = outcome.error;
                result.attempts = outcome.attempts;
                result.outputs = outcome.outputs;

                match result.status {
                    NodeStatus::Applied => {
                        live.insert(result.id.clone(), result.outputs.clone());
                        info!(
                            node = %result.id,
                            action = %result.action,
                            attempts = result.attempts,
                            "Applied"
                        );
                    }
                    NodeStatus::Destroyed => {
                        live.remove(&result.id);
                        info!(node = %result.id, attempts = result.attempts, "Destroyed");
                    }
                    _ => {
                        warn!(
                            node = %result.id,
                            action = %result.action,
                            attempts = result.attempts,
                            error = result.error.as_deref().unwrap_or_default(),
                            "Step failed"
                        );
                    }
                }
            }

            // a panicked task never reported back
            for result in results.iter_mut() {
                if result.status == NodeStatus::Applying {
                    result.fail("step task aborted");
                }
            }
        }

        let exports = plan
            .outputs
            .iter()
            .map(|o| ExportedOutput {
                name: o.name.clone(),
                description: o.description.clone(),
                sensitive: o.sensitive,
                value: live
                    .get(&o.value.node)
                    .and_then(|outputs| outputs.get(&o.value.attribute))
                    .cloned(),
            })
            .collect();

        // every task has been joined, so this is the last handle
        if let Ok(runner) = Arc::try_unwrap(runner)
            && let Err(e) = runner.lock.release().await
        {
            warn!(error = %e, "Failed to release state lock");
        }

        let report = ApplyReport {
            session_id,
            results,
            exports,
            duration_ms: started.elapsed().as_millis() as u64,
            cancelled,
        };
        info!(
            session = %report.session_id,
            success = report.is_success(),
            failed = report.failed().len(),
            skipped = report.skipped().len(),
            duration_ms = report.duration_ms,
            "Apply finished"
        );
        Ok(report)
    }

    /// Re-resolve a step against the live outputs and fix its final action
    fn prepare(
        &self,
        step: &PlanStep,
        live: &HashMap<String, Outputs>,
    ) -> std::result::Result<StepJob, ProviderError> {
        let Some(declaration) = step.declaration.as_ref() else {
            return Ok(StepJob {
                node: ResolvedNode {
                    id: step.node.clone(),
                    resource_type: step.resource_type.clone(),
                    config: serde_json::Value::Null,
                },
                action: step.action,
                hash: String::new(),
                dependencies: step.dependencies.clone(),
                previous: step.previous.clone(),
            });
        };

        let missing: Vec<String> = declaration
            .references()
            .into_iter()
            .filter(|r| {
                live.get(&r.node)
                    .and_then(|outputs| outputs.get(&r.attribute))
                    .is_none()
            })
            .map(|r| r.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ProviderError::permanent(format!(
                "unresolved reference: {}",
                missing.join(", ")
            )));
        }

        let config = plan::resolve_config(declaration, |r| {
            live.get(&r.node)
                .and_then(|outputs| outputs.get(&r.attribute))
                .cloned()
        });
        let hash = plan::config_hash(&config);

        let mut action = step.action;
        if action == PlanAction::NoOp {
            action = plan::classify(
                self.provider.as_ref(),
                declaration,
                &config,
                &hash,
                step.previous.as_ref(),
            );
            if action != PlanAction::NoOp {
                warn!(
                    node = %step.node,
                    %action,
                    "Configuration changed since plan, promoting no-op"
                );
            }
        }

        Ok(StepJob {
            node: ResolvedNode {
                id: step.node.clone(),
                resource_type: step.resource_type.clone(),
                config,
            },
            action,
            hash,
            dependencies: step.dependencies.clone(),
            previous: step.previous.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_is_shared() {
        let cancel = Cancellation::new();
        let handle = cancel.clone();
        assert!(!cancel.is_cancelled());
        handle.cancel();
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_report_display_redacts_sensitive_outputs() {
        let report = ApplyReport {
            session_id: "s".into(),
            results: vec![NodeResult {
                id: "secret".into(),
                resource_type: "secret".into(),
                action: PlanAction::Create,
                status: NodeStatus::Applied,
                error: None,
                attempts: 1,
                outputs: Outputs::new(),
            }],
            exports: vec![
                ExportedOutput {
                    name: "db-password".into(),
                    description: String::new(),
                    sensitive: true,
                    value: Some(serde_json::json!("hunter2")),
                },
                ExportedOutput {
                    name: "vpc-id".into(),
                    description: String::new(),
                    sensitive: false,
                    value: Some(serde_json::json!("vpc-0123")),
                },
            ],
            duration_ms: 0,
            cancelled: false,
        };

        let text = report.to_string();
        assert!(report.is_success());
        assert!(text.contains("db-password = <sensitive>"));
        assert!(!text.contains("hunter2"));
        assert!(text.contains("vpc-id = \"vpc-0123\""));
    }
}
