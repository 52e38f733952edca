//! Systems whose credentials are rotated

use crate::error::TargetError;
use crate::model::SecretValue;
use async_trait::async_trait;

/// The system that consumes a rotated credential (e.g., a database user)
///
/// `set_credential` must leave the current credential valid until the new
/// one is promoted, so clients never see a window without a working secret.
#[async_trait]
pub trait RotationTarget: Send + Sync {
    /// Install `value` alongside the current credential
    async fn set_credential(&self, secret_id: &str, value: &SecretValue)
    -> Result<(), TargetError>;

    /// Check that `value` authenticates against the target
    async fn verify_credential(
        &self,
        secret_id: &str,
        value: &SecretValue,
    ) -> Result<bool, TargetError>;
}
