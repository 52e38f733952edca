//! Credential generation
//!
//! Values come from `rand`'s thread-local CSPRNG, seeded from the operating
//! system.

use crate::error::{Result, RotationError};
use crate::model::SecretValue;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Produces the value of a new secret version
pub trait CredentialGenerator: Send + Sync {
    /// `current` is the value being replaced, if any
    fn generate(&self, current: Option<&SecretValue>) -> Result<SecretValue>;
}

/// Password generation rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordPolicy {
    pub length: usize,

    /// Characters never used (the defaults are rejected by most database engines)
    pub exclude_characters: String,

    /// Field replaced when the secret is a JSON object
    pub password_field: String,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            length: 32,
            exclude_characters: "\"'@/\\ `".to_string(),
            password_field: "password".to_string(),
        }
    }
}

/// Random printable-ASCII passwords
#[derive(Debug, Clone, Default)]
pub struct PasswordGenerator {
    policy: PasswordPolicy,
}

impl PasswordGenerator {
    pub fn new(policy: PasswordPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PasswordPolicy {
        &self.policy
    }

    fn alphabet(&self) -> Vec<char> {
        ('!'..='~')
            .filter(|c| !self.policy.exclude_characters.contains(*c))
            .collect()
    }

    /// A bare password following the policy
    pub fn password(&self) -> Result<String> {
        let alphabet = self.alphabet();
        if alphabet.is_empty() {
            return Err(RotationError::Generator(
                "policy excludes every character".into(),
            ));
        }
        if self.policy.length == 0 {
            return Err(RotationError::Generator("password length is zero".into()));
        }

        let mut rng = rand::thread_rng();
        Ok((0..self.policy.length)
            .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
            .collect())
    }

    /// Fill the password field of a JSON template (username, engine, host, ...)
    pub fn fill(&self, template: &serde_json::Value) -> Result<SecretValue> {
        let mut document = match template {
            serde_json::Value::Object(map) => map.clone(),
            _ => {
                return Err(RotationError::Generator(
                    "credential template must be a JSON object".into(),
                ));
            }
        };
        document.insert(
            self.policy.password_field.clone(),
            serde_json::Value::String(self.password()?),
        );
        Ok(SecretValue::new(serde_json::to_string(&document)?))
    }
}

impl CredentialGenerator for PasswordGenerator {
    fn generate(&self, current: Option<&SecretValue>) -> Result<SecretValue> {
        match current.and_then(SecretValue::as_json_object) {
            Some(document) => self.fill(&serde_json::Value::Object(document)),
            None => Ok(SecretValue::new(self.password()?)),
        }
    }
}
