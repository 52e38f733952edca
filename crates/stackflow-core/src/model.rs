//! Resource declarations
//!
//! A [`Stack`] is an ordered collection of [`ResourceNode`]s plus the outputs
//! exported after apply. Configuration values are either literals or
//! [`AttributeReference`]s to another node's output, so dependency
//! extraction is a pure walk over the values.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Pointer to an output attribute of another node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttributeReference {
    pub node: String,
    pub attribute: String,
}

impl AttributeReference {
    pub fn new(node: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            attribute: attribute.into(),
        }
    }
}

impl fmt::Display for AttributeReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.attribute)
    }
}

/// Configuration value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Literal(serde_json::Value),
    Reference(AttributeReference),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn literal(value: impl Into<serde_json::Value>) -> Self {
        Self::Literal(value.into())
    }

    pub fn reference(node: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self::Reference(AttributeReference::new(node, attribute))
    }

    /// All references contained in this value, depth first
    pub fn references(&self) -> Vec<&AttributeReference> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a AttributeReference>) {
        match self {
            Value::Literal(_) => {}
            Value::Reference(r) => out.push(r),
            Value::List(items) => items.iter().for_each(|v| v.collect_references(out)),
            Value::Map(entries) => entries.values().for_each(|v| v.collect_references(out)),
        }
    }

    /// Substitute every reference using `lookup`
    pub fn resolve<F>(&self, lookup: &mut F) -> serde_json::Value
    where
        F: FnMut(&AttributeReference) -> serde_json::Value,
    {
        match self {
            Value::Literal(v) => v.clone(),
            Value::Reference(r) => lookup(r),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(|v| v.resolve(lookup)).collect())
            }
            Value::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.resolve(lookup)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Literal(v.into())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Literal(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Literal(v.into())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Literal(v.into())
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Self::Literal(v)
    }
}

impl From<AttributeReference> for Value {
    fn from(r: AttributeReference) -> Self {
        Self::Reference(r)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

/// Lifecycle status of a node within one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Planned,
    Applying,
    Applied,
    Failed,
    Destroyed,
    /// Not attempted because a producer failed
    Skipped,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Planned => write!(f, "planned"),
            NodeStatus::Applying => write!(f, "applying"),
            NodeStatus::Applied => write!(f, "applied"),
            NodeStatus::Failed => write!(f, "failed"),
            NodeStatus::Destroyed => write!(f, "destroyed"),
            NodeStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// A declared resource instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceNode {
    /// Logical id, stable across runs
    pub id: String,

    /// Resource type (e.g., "vpc", "rds_cluster", "secret")
    pub resource_type: String,

    /// Configuration keyed by attribute name
    #[serde(default)]
    pub config: BTreeMap<String, Value>,

    /// Ordering-only dependencies
    #[serde(default)]
    pub depends_on: BTreeSet<String>,

    #[serde(default)]
    pub status: NodeStatus,
}

impl ResourceNode {
    pub fn new(id: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            config: BTreeMap::new(),
            depends_on: BTreeSet::new(),
            status: NodeStatus::Planned,
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    /// Every reference in the configuration, in key order
    pub fn references(&self) -> Vec<&AttributeReference> {
        self.config.values().flat_map(Value::references).collect()
    }
}

/// Value exported from the stack after apply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDeclaration {
    pub name: String,
    pub value: AttributeReference,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub sensitive: bool,
}

impl OutputDeclaration {
    pub fn new(name: impl Into<String>, value: AttributeReference) -> Self {
        Self {
            name: name.into(),
            value,
            description: String::new(),
            sensitive: false,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }
}

/// Ordered declaration input
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stack {
    pub nodes: Vec<ResourceNode>,
    #[serde(default)]
    pub outputs: Vec<OutputDeclaration>,
}

impl Stack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(mut self, node: ResourceNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn output(mut self, output: OutputDeclaration) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn add(&mut self, node: ResourceNode) {
        self.nodes.push(node);
    }

    /// Remove a node by id, returning it if it was declared
    pub fn remove(&mut self, id: &str) -> Option<ResourceNode> {
        let pos = self.nodes.iter().position(|n| n.id == id)?;
        Some(self.nodes.remove(pos))
    }
}
