//! Engine error types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Engine errors
#[derive(Error, Debug)]
pub enum StackError {
    #[error("Node '{node}' references unknown node '{target}'")]
    UnknownReference { node: String, target: String },

    #[error("Node declared more than once: {0}")]
    DuplicateNode(String),

    #[error("Cyclic dependency: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<String> },

    #[error("State is locked by {holder} since {since}")]
    StateLocked { holder: String, since: DateTime<Utc> },

    #[error("Plan was computed against state serial {planned}, current serial is {current}")]
    StalePlan { planned: u64, current: u64 },

    #[error("State error: {0}")]
    State(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StackError>;

fn format_cycle(cycle: &[String]) -> String {
    match cycle.first() {
        Some(first) => format!("{} -> {}", cycle.join(" -> "), first),
        None => String::new(),
    }
}

/// Whether a failed provider call is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network failures, throttling, timeouts
    Transient,
    /// Validation, permission and other errors that will not heal on retry
    Permanent,
}

/// Error returned by a [`ResourceProvider`](crate::provider::ResourceProvider) call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderError {
    pub class: ErrorClass,
    pub message: String,
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class == ErrorClass::Transient
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class {
            ErrorClass::Transient => write!(f, "{} (transient)", self.message),
            ErrorClass::Permanent => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Errors that the retry loop knows how to classify
pub trait Retryable: Sized {
    fn is_transient(&self) -> bool;

    /// Error to report when a single attempt exceeds its timeout
    fn timed_out(after: Duration) -> Self;
}

impl Retryable for ProviderError {
    fn is_transient(&self) -> bool {
        ProviderError::is_transient(self)
    }

    fn timed_out(after: Duration) -> Self {
        Self::transient(format!("timed out after {}s", after.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_closes_the_loop() {
        let err = StackError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "c".into()],
        };
        assert_eq!(err.to_string(), "Cyclic dependency: a -> b -> c -> a");
    }

    #[test]
    fn test_provider_error_class() {
        assert!(ProviderError::transient("throttled").is_transient());
        assert!(!ProviderError::permanent("access denied").is_transient());
        assert!(ProviderError::timed_out(Duration::from_secs(5)).is_transient());
        assert_eq!(
            ProviderError::transient("throttled").to_string(),
            "throttled (transient)"
        );
    }
}
