use async_trait::async_trait;
use stackflow_core::{
    ApplyOptions, Cancellation, ChangeKind, Engine, FileStateStore, Outputs, ProviderError,
    ProviderResult, ResolvedNode, ResourceNode, ResourceProvider, RetryConfig, Stack,
    StackContext, StateRecord,
};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// In-memory provider with scripted failures and a call log
#[derive(Default)]
pub struct ScriptedProvider {
    calls: Mutex<Vec<(String, String)>>,
    failures: Mutex<HashMap<String, VecDeque<ProviderError>>>,
    cancel_on: Mutex<Option<(String, Cancellation)>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[allow(dead_code)]
impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Fail the next calls for `id` with `errors`, in order
    pub fn fail(&self, id: &str, errors: Vec<ProviderError>) {
        self.failures
            .lock()
            .unwrap()
            .insert(id.to_string(), errors.into());
    }

    /// Trigger `cancel` while `id` is being created
    pub fn cancel_during(&self, id: &str, cancel: Cancellation) {
        *self.cancel_on.lock().unwrap() = Some((id.to_string(), cancel));
    }

    /// `(operation, node)` pairs in call order
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, operation: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(op, _)| op == operation)
            .map(|(_, id)| id)
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self, operation: &str, id: &str) -> ProviderResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push((operation.to_string(), id.to_string()));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let cancel = self
            .cancel_on
            .lock()
            .unwrap()
            .as_ref()
            .filter(|(target, _)| operation == "create" && target == id)
            .map(|(_, cancel)| cancel.clone());
        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        let scripted = self
            .failures
            .lock()
            .unwrap()
            .get_mut(id)
            .and_then(|queue| queue.pop_front());
        match scripted {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Provider-assigned attributes plus every configuration value
    fn outputs(node: &ResolvedNode) -> Outputs {
        let mut outputs = Outputs::new();
        if let Some(config) = node.config.as_object() {
            for (key, value) in config {
                outputs.insert(key.clone(), value.clone());
            }
        }
        let physical = format!("{}-{}", node.resource_type, node.id);
        outputs.insert(
            "arn".into(),
            format!("arn:aws:{}:us-east-1:000000000000:{}", node.resource_type, physical).into(),
        );
        outputs.insert("endpoint".into(), format!("{}.internal", physical).into());
        outputs.insert("id".into(), physical.into());
        outputs
    }
}

#[async_trait]
impl ResourceProvider for ScriptedProvider {
    async fn create(&self, _ctx: &StackContext, node: &ResolvedNode) -> ProviderResult<Outputs> {
        self.enter("create", &node.id).await?;
        Ok(Self::outputs(node))
    }

    async fn update(
        &self,
        _ctx: &StackContext,
        node: &ResolvedNode,
        _previous: &StateRecord,
    ) -> ProviderResult<Outputs> {
        self.enter("update", &node.id).await?;
        Ok(Self::outputs(node))
    }

    async fn destroy(&self, _ctx: &StackContext, record: &StateRecord) -> ProviderResult<()> {
        self.enter("destroy", &record.id).await
    }

    fn classify_change(
        &self,
        _resource_type: &str,
        old: &serde_json::Value,
        new: &serde_json::Value,
    ) -> ChangeKind {
        if old.get("engine") != new.get("engine") {
            ChangeKind::Replace
        } else {
            ChangeKind::InPlace
        }
    }
}

/// Project directory holding a file-backed state store
pub struct TestProject {
    pub root: TempDir,
}

#[allow(dead_code)]
impl TestProject {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        Self { root }
    }

    pub fn path(&self) -> PathBuf {
        self.root.path().to_path_buf()
    }

    pub fn store(&self) -> Arc<FileStateStore> {
        Arc::new(FileStateStore::new(self.root.path()))
    }

    pub fn engine(&self, provider: Arc<ScriptedProvider>) -> Engine {
        Engine::new(ctx(), provider, self.store()).with_options(fast_options())
    }
}

pub fn ctx() -> StackContext {
    StackContext::new("trading", "dev", "us-east-1").with_default_tag("Environment", "dev")
}

/// Millisecond backoff so retries do not slow the suite down
pub fn fast_options() -> ApplyOptions {
    ApplyOptions {
        parallelism: 4,
        step_timeout: Duration::from_secs(5),
        retry: RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            jitter: 0.0,
        },
    }
}

/// Network, Database(dependsOn Network), Cache(dependsOn Network)
pub fn network_stack() -> Stack {
    Stack::new()
        .node(ResourceNode::new("network", "vpc").with("cidr", "10.0.0.0/16"))
        .node(
            ResourceNode::new("database", "rds_cluster")
                .with("engine", "aurora-postgresql")
                .with("instance_class", "db.r6g.large")
                .depends_on("network"),
        )
        .node(
            ResourceNode::new("cache", "elasticache")
                .with("engine", "redis")
                .depends_on("network"),
        )
}
