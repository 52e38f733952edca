//! StackFlow secret rotation
//!
//! Staged credential rotation: a new version is generated, installed next to
//! the current one, verified, and only then promoted. Old and new
//! credentials stay valid during verification, and a failed verification
//! never promotes the new version.
//!
//! ```text
//! Idle ─► Creating ─► Setting ─► Testing ─► Finishing ─► Idle
//!                                   │
//!                                   └─ verification failed: halted until
//!                                      retry_verification / abandon
//! ```

pub mod error;
pub mod generator;
pub mod model;
pub mod rotator;
pub mod store;
pub mod target;

// Re-exports
pub use error::{Result, RotationError, TargetError};
pub use generator::{CredentialGenerator, PasswordGenerator, PasswordPolicy};
pub use model::{RotationStage, RotationState, SecretValue, SecretVersion, VersionLabel};
pub use rotator::{RotationOptions, RotationRun, Rotator};
pub use store::{FileSecretStore, MemorySecretStore, SecretStore};
pub use target::RotationTarget;
