//! Rotation state and secret versions

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Stage of the rotation state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStage {
    #[default]
    Idle,
    /// Generating and storing the pending version
    Creating,
    /// Installing the pending credential on the target
    Setting,
    /// Verifying the pending credential against the target
    Testing,
    /// Promoting the pending version to current
    Finishing,
}

impl fmt::Display for RotationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RotationStage::Idle => write!(f, "idle"),
            RotationStage::Creating => write!(f, "creating"),
            RotationStage::Setting => write!(f, "setting"),
            RotationStage::Testing => write!(f, "testing"),
            RotationStage::Finishing => write!(f, "finishing"),
        }
    }
}

/// Label attached to a secret version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionLabel {
    Current,
    Pending,
    Previous,
}

/// Secret material; never printed
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Parse the value as a JSON object, if it is one
    pub fn as_json_object(&self) -> Option<serde_json::Map<String, serde_json::Value>> {
        match serde_json::from_str(&self.0) {
            Ok(serde_json::Value::Object(map)) => Some(map),
            _ => None,
        }
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(***)")
    }
}

/// One stored version of a secret
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretVersion {
    pub version_id: String,
    pub value: SecretValue,
    #[serde(default)]
    pub labels: BTreeSet<VersionLabel>,
    pub created_at: DateTime<Utc>,
}

impl SecretVersion {
    pub fn new(version_id: impl Into<String>, value: SecretValue, label: VersionLabel) -> Self {
        Self {
            version_id: version_id.into(),
            value,
            labels: BTreeSet::from([label]),
            created_at: Utc::now(),
        }
    }

    pub fn has_label(&self, label: VersionLabel) -> bool {
        self.labels.contains(&label)
    }
}

/// Persisted progress of a secret's rotation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationState {
    pub secret_id: String,
    pub current_version_id: Option<String>,
    pub pending_version_id: Option<String>,
    pub previous_version_id: Option<String>,
    #[serde(default)]
    pub stage: RotationStage,
    pub registered_at: DateTime<Utc>,
    pub last_rotated_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl RotationState {
    pub fn new(secret_id: impl Into<String>, current_version_id: impl Into<String>) -> Self {
        Self {
            secret_id: secret_id.into(),
            current_version_id: Some(current_version_id.into()),
            pending_version_id: None,
            previous_version_id: None,
            stage: RotationStage::Idle,
            registered_at: Utc::now(),
            last_rotated_at: None,
            last_error: None,
        }
    }

    /// Verification failed and an operator has to decide
    pub fn is_halted(&self) -> bool {
        self.stage == RotationStage::Testing && self.last_error.is_some()
    }

    /// A rotation was interrupted and can be resumed
    pub fn is_in_progress(&self) -> bool {
        self.stage != RotationStage::Idle && !self.is_halted()
    }

    /// Idle and `interval` has passed since the last rotation (or registration)
    pub fn is_due(&self, interval: Duration, now: DateTime<Utc>) -> bool {
        let since = self.last_rotated_at.unwrap_or(self.registered_at);
        self.stage == RotationStage::Idle && since + interval <= now
    }
}
