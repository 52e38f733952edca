//! Graph builder
//!
//! Turns a [`Stack`] into a [`ResourceGraph`]: one edge `producer -> consumer`
//! for every attribute reference and every explicit dependency.

use crate::context::{StackContext, TAGS_KEY};
use crate::error::{Result, StackError};
use crate::model::{OutputDeclaration, ResourceNode, Stack, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Why an edge exists
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Consumer reads `attribute` from producer
    Reference { attribute: String },
    /// Declared with `depends_on`
    Explicit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub producer: String,
    pub consumer: String,
    pub kind: EdgeKind,
}

/// Validated dependency graph for one planning session
#[derive(Debug, Clone)]
pub struct ResourceGraph {
    nodes: Vec<ResourceNode>,
    index: HashMap<String, usize>,
    edges: Vec<DependencyEdge>,
    /// producers[i]: indices of nodes that node i depends on, declaration order
    producers: Vec<Vec<usize>>,
    /// consumers[i]: indices of nodes depending on node i, declaration order
    consumers: Vec<Vec<usize>>,
    outputs: Vec<OutputDeclaration>,
}

impl ResourceGraph {
    /// Nodes in declaration order
    pub fn nodes(&self) -> &[ResourceNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    pub fn outputs(&self) -> &[OutputDeclaration] {
        &self.outputs
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ResourceNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Declaration position of a node
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Ids of the nodes `id` depends on
    pub fn producers_of(&self, id: &str) -> Vec<&str> {
        self.neighbours(id, &self.producers)
    }

    /// Ids of the nodes depending on `id`
    pub fn consumers_of(&self, id: &str) -> Vec<&str> {
        self.neighbours(id, &self.consumers)
    }

    fn neighbours(&self, id: &str, adjacency: &[Vec<usize>]) -> Vec<&str> {
        self.index
            .get(id)
            .map(|&i| {
                adjacency[i]
                    .iter()
                    .map(|&j| self.nodes[j].id.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn producer_indices(&self, i: usize) -> &[usize] {
        &self.producers[i]
    }

    pub(crate) fn consumer_indices(&self, i: usize) -> &[usize] {
        &self.consumers[i]
    }
}

/// Builds a [`ResourceGraph`] from declarations
pub struct GraphBuilder<'a> {
    ctx: &'a StackContext,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(ctx: &'a StackContext) -> Self {
        Self { ctx }
    }

    pub fn build(&self, stack: &Stack) -> Result<ResourceGraph> {
        let mut index = HashMap::with_capacity(stack.nodes.len());
        for (i, node) in stack.nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(StackError::DuplicateNode(node.id.clone()));
            }
        }

        let nodes: Vec<ResourceNode> = stack
            .nodes
            .iter()
            .map(|node| self.with_default_tags(node))
            .collect();

        let mut edges = Vec::new();
        let mut producers = vec![Vec::new(); nodes.len()];
        let mut consumers = vec![Vec::new(); nodes.len()];

        for (ci, node) in nodes.iter().enumerate() {
            let declared = node
                .references()
                .into_iter()
                .map(|r| {
                    (
                        r.node.as_str(),
                        EdgeKind::Reference {
                            attribute: r.attribute.clone(),
                        },
                    )
                })
                .chain(node.depends_on.iter().map(|d| (d.as_str(), EdgeKind::Explicit)));

            for (target, kind) in declared {
                let pi = *index
                    .get(target)
                    .ok_or_else(|| StackError::UnknownReference {
                        node: node.id.clone(),
                        target: target.to_string(),
                    })?;

                // one edge per pair; the first occurrence decides its kind
                if producers[ci].contains(&pi) {
                    continue;
                }
                producers[ci].push(pi);
                consumers[pi].push(ci);
                edges.push(DependencyEdge {
                    producer: nodes[pi].id.clone(),
                    consumer: node.id.clone(),
                    kind,
                });
            }
        }

        for list in producers.iter_mut().chain(consumers.iter_mut()) {
            list.sort_unstable();
        }

        for output in &stack.outputs {
            if !index.contains_key(&output.value.node) {
                return Err(StackError::UnknownReference {
                    node: format!("output.{}", output.name),
                    target: output.value.node.clone(),
                });
            }
        }

        debug!(nodes = nodes.len(), edges = edges.len(), "Built resource graph");

        Ok(ResourceGraph {
            nodes,
            index,
            edges,
            producers,
            consumers,
            outputs: stack.outputs.clone(),
        })
    }

    /// Merge the stack's default tags under the node's own tags
    fn with_default_tags(&self, node: &ResourceNode) -> ResourceNode {
        if self.ctx.default_tags.is_empty() {
            return node.clone();
        }

        let mut node = node.clone();
        let mut tags: BTreeMap<String, Value> = self
            .ctx
            .default_tags
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.clone())))
            .collect();

        match node.config.remove(TAGS_KEY) {
            None => {}
            Some(Value::Map(own)) => tags.extend(own),
            Some(other) => {
                // not a map; leave the node's value alone
                node.config.insert(TAGS_KEY.to_string(), other);
                return node;
            }
        }

        node.config.insert(TAGS_KEY.to_string(), Value::Map(tags));
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> StackContext {
        StackContext::new("trading", "dev", "us-east-1")
    }

    #[test]
    fn test_edges_from_references_and_depends_on() {
        let stack = Stack::new()
            .node(ResourceNode::new("vpc", "vpc").with("cidr", "10.0.0.0/16"))
            .node(
                ResourceNode::new("igw", "internet_gateway")
                    .with("vpc_id", Value::reference("vpc", "id")),
            )
            .node(
                ResourceNode::new("route", "route")
                    .depends_on("igw")
                    .with("vpc_id", Value::reference("vpc", "id")),
            );

        let graph = GraphBuilder::new(&ctx()).build(&stack).unwrap();

        assert_eq!(graph.edges().len(), 3);
        assert_eq!(graph.producers_of("route"), vec!["vpc", "igw"]);
        assert_eq!(graph.consumers_of("vpc"), vec!["igw", "route"]);
        assert_eq!(
            graph.edges()[0],
            DependencyEdge {
                producer: "vpc".into(),
                consumer: "igw".into(),
                kind: EdgeKind::Reference {
                    attribute: "id".into()
                },
            }
        );
    }

    #[test]
    fn test_duplicate_references_collapse_to_one_edge() {
        let stack = Stack::new()
            .node(ResourceNode::new("db", "rds_cluster"))
            .node(
                ResourceNode::new("app", "lambda")
                    .with("host", Value::reference("db", "endpoint"))
                    .with("port", Value::reference("db", "port"))
                    .depends_on("db"),
            );

        let graph = GraphBuilder::new(&ctx()).build(&stack).unwrap();
        assert_eq!(graph.edges().len(), 1);
    }

    #[test]
    fn test_unknown_reference() {
        let stack = Stack::new().node(
            ResourceNode::new("subnet", "subnet").with("vpc_id", Value::reference("vpc", "id")),
        );

        let err = GraphBuilder::new(&ctx()).build(&stack).unwrap_err();
        assert!(matches!(
            err,
            StackError::UnknownReference { ref node, ref target } if node == "subnet" && target == "vpc"
        ));
    }

    #[test]
    fn test_unknown_explicit_dependency() {
        let stack =
            Stack::new().node(ResourceNode::new("db", "rds_cluster").depends_on("network"));

        let err = GraphBuilder::new(&ctx()).build(&stack).unwrap_err();
        assert!(matches!(err, StackError::UnknownReference { .. }));
    }

    #[test]
    fn test_output_must_reference_declared_node() {
        let stack = Stack::new()
            .node(ResourceNode::new("vpc", "vpc"))
            .output(OutputDeclaration::new(
                "efs-id",
                crate::model::AttributeReference::new("efs", "id"),
            ));

        let err = GraphBuilder::new(&ctx()).build(&stack).unwrap_err();
        assert!(matches!(
            err,
            StackError::UnknownReference { ref node, .. } if node == "output.efs-id"
        ));
    }

    #[test]
    fn test_duplicate_node() {
        let stack = Stack::new()
            .node(ResourceNode::new("vpc", "vpc"))
            .node(ResourceNode::new("vpc", "vpc"));

        let err = GraphBuilder::new(&ctx()).build(&stack).unwrap_err();
        assert!(matches!(err, StackError::DuplicateNode(ref id) if id == "vpc"));
    }

    #[test]
    fn test_default_tags_are_merged_under_node_tags() {
        let ctx = ctx()
            .with_default_tag("Environment", "dev")
            .with_default_tag("Name", "default");
        let own_tags = BTreeMap::from([("Name".to_string(), Value::from("trading-vpc-dev"))]);
        let stack =
            Stack::new().node(ResourceNode::new("vpc", "vpc").with("tags", Value::Map(own_tags)));

        let graph = GraphBuilder::new(&ctx).build(&stack).unwrap();
        let tags = graph.get("vpc").unwrap().config.get("tags").unwrap();
        let resolved = tags.resolve(&mut |_| serde_json::Value::Null);
        assert_eq!(
            resolved,
            serde_json::json!({"Environment": "dev", "Name": "trading-vpc-dev"})
        );
    }

    #[test]
    fn test_self_reference_is_kept_as_edge() {
        let stack = Stack::new().node(
            ResourceNode::new("sg", "security_group").with("source", Value::reference("sg", "id")),
        );

        let graph = GraphBuilder::new(&ctx()).build(&stack).unwrap();
        assert_eq!(graph.producers_of("sg"), vec!["sg"]);
    }
}
