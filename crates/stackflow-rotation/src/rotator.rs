//! Staged rotation state machine
//!
//! `Idle -> Creating -> Setting -> Testing -> Finishing -> Idle`
//!
//! Every stage is written to the [`SecretStore`] before its side effect
//! runs, so a crashed rotation resumes where it stopped instead of
//! generating a second credential.

use crate::error::{Result, RotationError, TargetError};
use crate::generator::{CredentialGenerator, PasswordGenerator};
use crate::model::{RotationStage, RotationState, SecretValue, SecretVersion, VersionLabel};
use crate::store::SecretStore;
use crate::target::RotationTarget;
use chrono::Utc;
use stackflow_core::{RetryConfig, with_retry};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// Rotation settings
#[derive(Debug, Clone, PartialEq)]
pub struct RotationOptions {
    /// Rotate automatically after this long
    pub interval: chrono::Duration,

    /// Upper bound for a single target call
    pub call_timeout: Duration,

    pub retry: RetryConfig,
}

impl Default for RotationOptions {
    fn default() -> Self {
        Self {
            interval: chrono::Duration::days(30),
            call_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

/// Outcome of one scheduled rotation
#[derive(Debug)]
pub struct RotationRun {
    pub secret_id: String,
    pub result: Result<RotationState>,
}

/// Drives secrets through the rotation stages
pub struct Rotator {
    store: Arc<dyn SecretStore>,
    generator: Arc<dyn CredentialGenerator>,
    options: RotationOptions,
    targets: RwLock<HashMap<String, Arc<dyn RotationTarget>>>,
    /// One async mutex per secret; different secrets rotate concurrently
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Rotator {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self {
            store,
            generator: Arc::new(PasswordGenerator::default()),
            options: RotationOptions::default(),
            targets: RwLock::new(HashMap::new()),
            locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn CredentialGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn with_options(mut self, options: RotationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &RotationOptions {
        &self.options
    }

    /// Enable rotation for a secret
    ///
    /// Idempotent: an already registered secret keeps its state and
    /// versions, only the target is (re)attached.
    #[instrument(skip_all, fields(secret = %secret_id))]
    pub async fn register(
        &self,
        secret_id: &str,
        initial: SecretValue,
        target: Arc<dyn RotationTarget>,
    ) -> Result<RotationState> {
        let lock = self.secret_lock(secret_id)?;
        let _guard = lock.lock().await;

        self.targets
            .write()
            .map_err(|_| RotationError::Store("target registry poisoned".into()))?
            .insert(secret_id.to_string(), target);

        if let Some(state) = self.store.load_state(secret_id).await? {
            debug!(stage = %state.stage, "Secret already registered");
            return Ok(state);
        }

        let version_id = new_version_id();
        self.store
            .put_version(
                secret_id,
                SecretVersion::new(&version_id, initial, VersionLabel::Current),
            )
            .await?;
        let state = RotationState::new(secret_id, version_id);
        self.store.save_state(&state).await?;

        info!("Registered secret for rotation");
        Ok(state)
    }

    /// Register with a generated credential filled into `template`
    pub async fn register_generated(
        &self,
        secret_id: &str,
        template: &serde_json::Value,
        target: Arc<dyn RotationTarget>,
    ) -> Result<RotationState> {
        let initial = SecretValue::new(serde_json::to_string(template)?);
        let initial = self.generator.generate(Some(&initial))?;
        self.register(secret_id, initial, target).await
    }

    pub async fn state(&self, secret_id: &str) -> Result<RotationState> {
        self.store
            .load_state(secret_id)
            .await?
            .ok_or_else(|| RotationError::NotRegistered(secret_id.to_string()))
    }

    /// The version currently labelled current
    pub async fn current(&self, secret_id: &str) -> Result<SecretVersion> {
        let state = self.state(secret_id).await?;
        let version_id = state.current_version_id.ok_or_else(|| {
            RotationError::Store(format!("'{}' has no current version", secret_id))
        })?;
        self.store
            .get_version(secret_id, &version_id)
            .await?
            .ok_or_else(|| {
                RotationError::Store(format!(
                    "current version {} of '{}' is missing",
                    version_id, secret_id
                ))
            })
    }

    /// Run (or resume) a rotation until it is back to `Idle`
    #[instrument(skip_all, fields(secret = %secret_id))]
    pub async fn rotate(&self, secret_id: &str) -> Result<RotationState> {
        let lock = self.secret_lock(secret_id)?;
        let _guard = lock.lock().await;

        let target = self.target(secret_id)?;
        let state = self.state(secret_id).await?;
        if state.is_halted() {
            return Err(RotationError::Halted {
                secret_id: secret_id.to_string(),
                reason: state.last_error.unwrap_or_default(),
            });
        }
        self.advance(state, target.as_ref()).await
    }

    /// Clear a failed verification and verify the pending version again
    #[instrument(skip_all, fields(secret = %secret_id))]
    pub async fn retry_verification(&self, secret_id: &str) -> Result<RotationState> {
        let lock = self.secret_lock(secret_id)?;
        let _guard = lock.lock().await;

        let target = self.target(secret_id)?;
        let mut state = self.state(secret_id).await?;
        expect_stage(&state, RotationStage::Testing)?;

        info!("Retrying verification");
        state.last_error = None;
        self.store.save_state(&state).await?;
        self.advance(state, target.as_ref()).await
    }

    /// Drop the pending version and return to `Idle`; current is untouched
    #[instrument(skip_all, fields(secret = %secret_id))]
    pub async fn abandon(&self, secret_id: &str) -> Result<RotationState> {
        let lock = self.secret_lock(secret_id)?;
        let _guard = lock.lock().await;

        let mut state = self.state(secret_id).await?;
        if state.stage == RotationStage::Finishing {
            // the promotion may already have happened in the store
            return Err(RotationError::InvalidStage {
                secret_id: secret_id.to_string(),
                stage: state.stage.to_string(),
                expected: "any stage before finishing".into(),
            });
        }

        if let Some(pending) = state.pending_version_id.take() {
            self.store.delete_version(secret_id, &pending).await?;
        }
        state.stage = RotationStage::Idle;
        state.last_error = None;
        self.store.save_state(&state).await?;

        warn!("Rotation abandoned");
        Ok(state)
    }

    /// Rotate every registered secret that is due or was interrupted
    ///
    /// Secrets are rotated concurrently; halted secrets are left alone.
    pub async fn rotate_due(self: &Arc<Self>) -> Result<Vec<RotationRun>> {
        let now = Utc::now();
        let mut tasks = JoinSet::new();

        for secret_id in self.store.list_secrets().await? {
            let Some(state) = self.store.load_state(&secret_id).await? else {
                continue;
            };
            if !self.has_target(&secret_id) {
                debug!(secret = %secret_id, "No target attached, skipping");
                continue;
            }
            if !(state.is_due(self.options.interval, now) || state.is_in_progress()) {
                continue;
            }

            let rotator = Arc::clone(self);
            tasks.spawn(async move {
                let result = rotator.rotate(&secret_id).await;
                RotationRun { secret_id, result }
            });
        }

        let mut runs = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(run) => runs.push(run),
                Err(e) => error!(error = %e, "Rotation task aborted"),
            }
        }
        runs.sort_by(|a, b| a.secret_id.cmp(&b.secret_id));
        Ok(runs)
    }

    /// Check for due rotations every `check_every` until `shutdown` turns true
    pub async fn run_schedule(
        self: Arc<Self>,
        check_every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(check_every);
        info!(
            interval_days = self.options.interval.num_days(),
            "Rotation schedule started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.rotate_due().await {
                        Ok(runs) => {
                            for run in runs {
                                if let Err(e) = run.result {
                                    warn!(
                                        secret = %run.secret_id,
                                        error = %e,
                                        "Scheduled rotation failed"
                                    );
                                }
                            }
                        }
                        Err(e) => warn!(error = %e, "Could not list secrets"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Rotation schedule stopped");
    }

    async fn advance(
        &self,
        mut state: RotationState,
        target: &dyn RotationTarget,
    ) -> Result<RotationState> {
        let secret_id = state.secret_id.clone();
        loop {
            debug!(stage = %state.stage, "Rotation stage");
            match state.stage {
                RotationStage::Idle => {
                    state.stage = RotationStage::Creating;
                    state.last_error = None;
                    self.store.save_state(&state).await?;
                }
                RotationStage::Creating => {
                    let version_id = match state.pending_version_id.clone() {
                        Some(id) => id,
                        None => {
                            let id = new_version_id();
                            state.pending_version_id = Some(id.clone());
                            self.store.save_state(&state).await?;
                            id
                        }
                    };

                    if self.store.get_version(&secret_id, &version_id).await?.is_none() {
                        let current = match &state.current_version_id {
                            Some(id) => self.store.get_version(&secret_id, id).await?,
                            None => None,
                        };
                        let value = self.generator.generate(current.as_ref().map(|v| &v.value))?;
                        self.store
                            .put_version(
                                &secret_id,
                                SecretVersion::new(&version_id, value, VersionLabel::Pending),
                            )
                            .await?;
                        debug!(version = %version_id, "Stored pending version");
                    }

                    state.stage = RotationStage::Setting;
                    self.store.save_state(&state).await?;
                }
                RotationStage::Setting => {
                    let pending = self.pending(&state).await?;
                    let (result, attempts) = with_retry(
                        &self.options.retry,
                        self.options.call_timeout,
                        "set_credential",
                        || target.set_credential(&secret_id, &pending.value),
                    )
                    .await;

                    if let Err(e) = result {
                        warn!(attempts, error = %e, "Setting pending credential failed");
                        state.last_error = Some(e.to_string());
                        self.store.save_state(&state).await?;
                        return Err(e.into());
                    }

                    state.stage = RotationStage::Testing;
                    state.last_error = None;
                    self.store.save_state(&state).await?;
                }
                RotationStage::Testing => {
                    let pending = self.pending(&state).await?;
                    let (result, attempts) = with_retry(
                        &self.options.retry,
                        self.options.call_timeout,
                        "verify_credential",
                        || target.verify_credential(&secret_id, &pending.value),
                    )
                    .await;

                    let reason = match result {
                        Ok(true) => None,
                        Ok(false) => Some("credential was rejected by the target".to_string()),
                        Err(TargetError::Permanent(message)) => Some(message),
                        Err(e) => {
                            // retries exhausted; resume verification next run
                            warn!(attempts, error = %e, "Verification inconclusive");
                            return Err(e.into());
                        }
                    };

                    if let Some(reason) = reason {
                        error!(
                            version = %pending.version_id,
                            reason = %reason,
                            "Verification failed, rotation halted"
                        );
                        state.last_error = Some(reason.clone());
                        self.store.save_state(&state).await?;
                        return Err(RotationError::VerificationFailed {
                            secret_id,
                            version_id: pending.version_id,
                            reason,
                        });
                    }

                    state.stage = RotationStage::Finishing;
                    self.store.save_state(&state).await?;
                }
                RotationStage::Finishing => {
                    let version_id = state.pending_version_id.clone().ok_or_else(|| {
                        RotationError::Store(format!("'{}' has no pending version", secret_id))
                    })?;
                    self.store.promote(&secret_id, &version_id).await?;

                    state.previous_version_id = state
                        .current_version_id
                        .replace(version_id.clone())
                        .filter(|previous| previous != &version_id);
                    state.pending_version_id = None;
                    state.stage = RotationStage::Idle;
                    state.last_rotated_at = Some(Utc::now());
                    state.last_error = None;
                    self.store.save_state(&state).await?;

                    info!(version = %version_id, "Rotation complete");
                    return Ok(state);
                }
            }
        }
    }

    async fn pending(&self, state: &RotationState) -> Result<SecretVersion> {
        let version_id = state.pending_version_id.as_deref().ok_or_else(|| {
            RotationError::Store(format!("'{}' has no pending version", state.secret_id))
        })?;
        self.store
            .get_version(&state.secret_id, version_id)
            .await?
            .ok_or_else(|| {
                RotationError::Store(format!(
                    "pending version {} of '{}' is missing",
                    version_id, state.secret_id
                ))
            })
    }

    fn secret_lock(&self, secret_id: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| RotationError::Store("rotation lock table poisoned".into()))?;
        Ok(Arc::clone(locks.entry(secret_id.to_string()).or_default()))
    }

    fn target(&self, secret_id: &str) -> Result<Arc<dyn RotationTarget>> {
        self.targets
            .read()
            .map_err(|_| RotationError::Store("target registry poisoned".into()))?
            .get(secret_id)
            .cloned()
            .ok_or_else(|| RotationError::NotRegistered(secret_id.to_string()))
    }

    fn has_target(&self, secret_id: &str) -> bool {
        self.targets
            .read()
            .map(|targets| targets.contains_key(secret_id))
            .unwrap_or(false)
    }
}

fn new_version_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn expect_stage(state: &RotationState, expected: RotationStage) -> Result<()> {
    if state.stage == expected {
        Ok(())
    } else {
        Err(RotationError::InvalidStage {
            secret_id: state.secret_id.clone(),
            stage: state.stage.to_string(),
            expected: expected.to_string(),
        })
    }
}
