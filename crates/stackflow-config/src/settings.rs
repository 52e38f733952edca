//! Settings file model
//!
//! ```yaml
//! stack:
//!   name: trading
//!   environment: dev
//!   region: us-east-1
//!   default_tags:
//!     Project: trading
//! apply:
//!   parallelism: 10
//! rotation:
//!   interval_days: 30
//!   password:
//!     length: 32
//! ```
//!
//! Every section and field is optional.

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use stackflow_core::{ApplyOptions, FileStateStore, RetryConfig, StackContext};
use stackflow_rotation::{FileSecretStore, PasswordPolicy, RotationOptions};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Overrides `stack.environment`
pub const ENVIRONMENT_ENV: &str = "STACKFLOW_ENVIRONMENT";

/// Overrides `stack.region`
pub const REGION_ENV: &str = "STACKFLOW_REGION";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub stack: StackSettings,
    pub state: StateSettings,
    pub apply: ApplySettings,
    pub retry: RetrySettings,
    pub rotation: RotationSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackSettings {
    pub name: String,
    pub environment: String,
    pub region: String,
    pub default_tags: BTreeMap<String, String>,
}

impl Default for StackSettings {
    fn default() -> Self {
        Self {
            name: "stackflow".to_string(),
            environment: "dev".to_string(),
            region: "us-east-1".to_string(),
            default_tags: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSettings {
    /// Lock files older than this are taken over
    pub stale_lock_after_secs: u32,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            stale_lock_after_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplySettings {
    /// Steps of one level running at the same time
    pub parallelism: usize,
    pub step_timeout_secs: u64,
}

impl Default for ApplySettings {
    fn default() -> Self {
        Self {
            parallelism: 10,
            step_timeout_secs: 300,
        }
    }
}

/// Retry policy for provider and rotation target calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationSettings {
    pub interval_days: u32,
    pub call_timeout_secs: u64,

    /// Secret documents, relative to the project root
    pub secrets_dir: PathBuf,
    pub password: PasswordPolicy,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            interval_days: 30,
            call_timeout_secs: 30,
            secrets_dir: PathBuf::from(".stackflow/secrets"),
            password: PasswordPolicy::default(),
        }
    }
}

impl Settings {
    /// Parse settings from YAML text; nothing else is applied
    pub fn from_yaml(text: &str) -> Result<Self> {
        // an empty document means "all defaults"
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Load a settings file, apply environment overrides and validate
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let mut settings = if text.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        };
        debug!(path = %path.display(), "Loaded settings");

        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    /// Discover and load the settings file, or fall back to defaults
    pub fn load() -> Result<Self> {
        match crate::find_config_file() {
            Ok(path) => Self::load_from(path),
            Err(ConfigError::ConfigFileNotFound) => {
                info!("No settings file found, using defaults");
                let mut settings = Self::default();
                settings.apply_env_overrides();
                settings.validate()?;
                Ok(settings)
            }
            Err(e) => Err(e),
        }
    }

    /// `STACKFLOW_ENVIRONMENT` and `STACKFLOW_REGION` take precedence over the file
    pub fn apply_env_overrides(&mut self) {
        if let Some(environment) = non_empty_var(ENVIRONMENT_ENV) {
            debug!(environment = %environment, "Environment overridden");
            self.stack.environment = environment;
        }
        if let Some(region) = non_empty_var(REGION_ENV) {
            debug!(region = %region, "Region overridden");
            self.stack.region = region;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.stack.name.is_empty() {
            return Err(invalid("stack.name", "must not be empty"));
        }
        if self.stack.environment.is_empty() {
            return Err(invalid("stack.environment", "must not be empty"));
        }
        if self.apply.parallelism == 0 {
            return Err(invalid("apply.parallelism", "must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(invalid("retry.backoff_multiplier", "must be at least 1.0"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(invalid("retry.jitter", "must be between 0.0 and 1.0"));
        }
        if self.rotation.interval_days == 0 {
            return Err(invalid("rotation.interval_days", "must be at least 1"));
        }
        if self.rotation.password.length == 0 {
            return Err(invalid("rotation.password.length", "must be at least 1"));
        }
        Ok(())
    }

    pub fn stack_context(&self) -> StackContext {
        let mut ctx = StackContext::new(
            &self.stack.name,
            &self.stack.environment,
            &self.stack.region,
        );
        ctx.default_tags = self.stack.default_tags.clone();
        ctx
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry.max_attempts,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            backoff_multiplier: self.retry.backoff_multiplier,
            jitter: self.retry.jitter,
        }
    }

    pub fn apply_options(&self) -> ApplyOptions {
        ApplyOptions {
            parallelism: self.apply.parallelism,
            step_timeout: Duration::from_secs(self.apply.step_timeout_secs),
            retry: self.retry_config(),
        }
    }

    pub fn rotation_options(&self) -> RotationOptions {
        RotationOptions {
            interval: chrono::Duration::days(i64::from(self.rotation.interval_days)),
            call_timeout: Duration::from_secs(self.rotation.call_timeout_secs),
            retry: self.retry_config(),
        }
    }

    pub fn password_policy(&self) -> PasswordPolicy {
        self.rotation.password.clone()
    }

    /// State store rooted at `project_root`
    pub fn state_store(&self, project_root: impl AsRef<Path>) -> FileStateStore {
        FileStateStore::new(project_root).with_stale_lock_after(chrono::Duration::seconds(
            i64::from(self.state.stale_lock_after_secs),
        ))
    }

    /// Secret store under `project_root` (absolute `secrets_dir` is used as is)
    pub fn secret_store(&self, project_root: impl AsRef<Path>) -> FileSecretStore {
        FileSecretStore::new(project_root.as_ref().join(&self.rotation.secrets_dir))
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}
