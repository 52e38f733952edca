//! Rotation error types

use stackflow_core::Retryable;
use std::time::Duration;
use thiserror::Error;

/// Rotation errors
#[derive(Error, Debug)]
pub enum RotationError {
    #[error("Secret not registered for rotation: {0}")]
    NotRegistered(String),

    #[error("Invalid secret id: {0}")]
    InvalidSecretId(String),

    #[error("Secret '{secret_id}' is in stage {stage}, expected {expected}")]
    InvalidStage {
        secret_id: String,
        stage: String,
        expected: String,
    },

    #[error("Verification of version {version_id} of '{secret_id}' failed: {reason}")]
    VerificationFailed {
        secret_id: String,
        version_id: String,
        reason: String,
    },

    #[error("Rotation of '{secret_id}' is halted: {reason}")]
    Halted { secret_id: String, reason: String },

    #[error("Credential generation failed: {0}")]
    Generator(String),

    #[error("Target error: {0}")]
    Target(#[from] TargetError),

    #[error("Secret store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RotationError>;

/// Error returned by a [`RotationTarget`](crate::target::RotationTarget)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
    /// Connection failures, throttling, timeouts
    #[error("{0} (transient)")]
    Transient(String),

    /// Rejected credentials, missing permissions
    #[error("{0}")]
    Permanent(String),
}

impl Retryable for TargetError {
    fn is_transient(&self) -> bool {
        matches!(self, TargetError::Transient(_))
    }

    fn timed_out(after: Duration) -> Self {
        TargetError::Transient(format!("timed out after {}s", after.as_secs_f64()))
    }
}
