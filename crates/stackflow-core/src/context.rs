//! Stack-wide context shared by every resource in a session

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Configuration key under which default tags are merged
pub const TAGS_KEY: &str = "tags";

/// Provider and environment context for a stack
///
/// Passed explicitly to the graph builder and to every provider call
/// instead of living in a process-wide singleton.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackContext {
    /// Stack name (e.g., "trading")
    pub name: String,

    /// Environment suffix appended to physical names (e.g., "dev", "pr-1234")
    pub environment: String,

    /// Provider region (e.g., "us-east-1")
    pub region: String,

    /// Tags applied to every resource unless the resource overrides them
    #[serde(default)]
    pub default_tags: BTreeMap<String, String>,
}

impl StackContext {
    pub fn new(
        name: impl Into<String>,
        environment: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            environment: environment.into(),
            region: region.into(),
            default_tags: BTreeMap::new(),
        }
    }

    pub fn with_default_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_tags.insert(key.into(), value.into());
        self
    }

    /// Physical name for a logical resource name, suffixed with the environment
    pub fn physical_name(&self, logical: &str) -> String {
        if self.environment.is_empty() {
            logical.to_string()
        } else {
            format!("{}-{}", logical, self.environment)
        }
    }
}
