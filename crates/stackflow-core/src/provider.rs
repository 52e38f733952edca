//! Resource provider trait definition

use crate::context::StackContext;
use crate::error::ProviderError;
use crate::state::StateRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Attributes a provider reports for a resource (id, arn, endpoint, ...)
pub type Outputs = BTreeMap<String, serde_json::Value>;

/// Result of a provider call
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// How a configuration change must be carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// The resource can be modified in place
    InPlace,
    /// The resource must be destroyed and created again
    Replace,
}

/// A node with every reference substituted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedNode {
    pub id: String,
    pub resource_type: String,
    pub config: serde_json::Value,
}

impl ResolvedNode {
    /// Get a configuration value as a specific type
    pub fn get_config<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.config
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Resource provider abstraction
///
/// A provider owns the side effects for every resource type it manages.
/// Errors must be classified: transient errors are retried by the executor,
/// permanent ones fail the step immediately.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Create the resource and return its outputs
    async fn create(&self, ctx: &StackContext, node: &ResolvedNode) -> ProviderResult<Outputs>;

    /// Modify an existing resource in place
    async fn update(
        &self,
        ctx: &StackContext,
        node: &ResolvedNode,
        previous: &StateRecord,
    ) -> ProviderResult<Outputs>;

    /// Destroy a previously applied resource
    async fn destroy(&self, ctx: &StackContext, record: &StateRecord) -> ProviderResult<()>;

    /// Decide whether a configuration change can be applied in place
    fn classify_change(
        &self,
        resource_type: &str,
        old: &serde_json::Value,
        new: &serde_json::Value,
    ) -> ChangeKind;
}
