use async_trait::async_trait;
use stackflow_core::RetryConfig;
use stackflow_rotation::{
    CredentialGenerator, PasswordGenerator, RotationOptions, RotationTarget, SecretValue,
    TargetError,
};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Database user whose password can be set and checked
#[derive(Default)]
pub struct FakeDatabase {
    accepted: Mutex<Vec<String>>,
    set_failures: Mutex<VecDeque<TargetError>>,
    verify_script: Mutex<VecDeque<Result<bool, TargetError>>>,
}

#[allow(dead_code)]
impl FakeDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_set(&self, errors: Vec<TargetError>) {
        *self.set_failures.lock().unwrap() = errors.into();
    }

    /// Answers for the next verifications; afterwards the real check applies
    pub fn script_verify(&self, answers: Vec<Result<bool, TargetError>>) {
        *self.verify_script.lock().unwrap() = answers.into();
    }

    pub fn accepts(&self, value: &SecretValue) -> bool {
        self.accepted
            .lock()
            .unwrap()
            .iter()
            .any(|v| v == value.expose())
    }

    pub fn set_count(&self) -> usize {
        self.accepted.lock().unwrap().len()
    }
}

#[async_trait]
impl RotationTarget for FakeDatabase {
    async fn set_credential(&self, _secret_id: &str, value: &SecretValue) -> Result<(), TargetError> {
        if let Some(error) = self.set_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.accepted.lock().unwrap().push(value.expose().to_string());
        Ok(())
    }

    async fn verify_credential(
        &self,
        _secret_id: &str,
        value: &SecretValue,
    ) -> Result<bool, TargetError> {
        let scripted = self.verify_script.lock().unwrap().pop_front();
        match scripted {
            Some(answer) => answer,
            None => Ok(self.accepts(value)),
        }
    }
}

/// Password generator that counts its invocations
#[derive(Default)]
pub struct CountingGenerator {
    inner: PasswordGenerator,
    calls: AtomicUsize,
}

#[allow(dead_code)]
impl CountingGenerator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CredentialGenerator for CountingGenerator {
    fn generate(&self, current: Option<&SecretValue>) -> stackflow_rotation::Result<SecretValue> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.generate(current)
    }
}

pub fn fast_options() -> RotationOptions {
    RotationOptions {
        call_timeout: Duration::from_secs(5),
        retry: RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            jitter: 0.0,
        },
        ..RotationOptions::default()
    }
}

pub fn db_credentials() -> serde_json::Value {
    serde_json::json!({
        "username": "dbadmin",
        "engine": "postgres",
        "host": "trading-aurora-dev.cluster.internal",
        "port": 5432,
        "dbname": "trading"
    })
}
