//! Plan/diff engine
//!
//! Reconciles the declared stack with the last applied state. Planning is a
//! pure function: it reads declarations and state, consults the provider only
//! to classify changes, and never performs side effects.

use crate::context::StackContext;
use crate::error::Result;
use crate::graph::{GraphBuilder, ResourceGraph};
use crate::model::{AttributeReference, OutputDeclaration, ResourceNode, Stack};
use crate::provider::{ChangeKind, ResourceProvider};
use crate::resolver;
use crate::state::{StackState, StateRecord};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use tracing::debug;

/// Placeholder for attributes that only exist once a producer is applied
pub const UNKNOWN: &str = "(known after apply)";

/// Type of action to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    /// Create a new resource
    Create,
    /// Update an existing resource in place
    Update,
    /// Destroy the existing resource and create it again
    Replace,
    /// Destroy a resource that is no longer declared
    Destroy,
    /// No changes needed
    NoOp,
}

impl PlanAction {
    /// Whether the action has side effects
    pub fn is_mutation(&self) -> bool {
        !matches!(self, PlanAction::NoOp)
    }
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanAction::Create => write!(f, "create"),
            PlanAction::Update => write!(f, "update"),
            PlanAction::Replace => write!(f, "replace"),
            PlanAction::Destroy => write!(f, "destroy"),
            PlanAction::NoOp => write!(f, "no-op"),
        }
    }
}

/// Planned action for one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Node id
    pub node: String,

    pub resource_type: String,

    pub action: PlanAction,

    /// Steps in the same level have no ordering among themselves
    pub level: usize,

    /// Steps this one waits on; a failure in any of them skips this step
    #[serde(default)]
    pub after: Vec<String>,

    /// Producer ids of the declared node
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Hash of `resolved_config`; `None` for destroy steps
    pub config_hash: Option<String>,

    /// Configuration with references substituted, unknown values as placeholders
    pub resolved_config: serde_json::Value,

    /// Declaration to re-resolve at apply time; `None` for destroy steps
    pub declaration: Option<ResourceNode>,

    /// Last applied record, if any
    pub previous: Option<StateRecord>,
}

/// Plan containing every step to be applied
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Steps ordered by level, then by declaration order (destroys by id)
    pub steps: Vec<PlanStep>,

    /// Serial of the state the plan was computed against
    pub state_serial: u64,

    /// Stack outputs to export after apply
    #[serde(default)]
    pub outputs: Vec<OutputDeclaration>,

    /// Whether the plan has any changes
    pub has_changes: bool,
}

impl Plan {
    fn new(mut steps: Vec<PlanStep>, state_serial: u64, outputs: Vec<OutputDeclaration>) -> Self {
        // stable: keeps the emitted order inside a level
        steps.sort_by_key(|s| s.level);
        let has_changes = steps.iter().any(|s| s.action.is_mutation());
        Self {
            steps,
            state_serial,
            outputs,
            has_changes,
        }
    }

    pub fn step(&self, node: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.node == node)
    }

    /// Steps grouped by level
    pub fn levels(&self) -> Vec<Vec<&PlanStep>> {
        let mut levels: BTreeMap<usize, Vec<&PlanStep>> = BTreeMap::new();
        for step in &self.steps {
            levels.entry(step.level).or_default().push(step);
        }
        levels.into_values().collect()
    }

    /// Get steps by action
    pub fn steps_by_action(&self, action: PlanAction) -> Vec<&PlanStep> {
        self.steps.iter().filter(|s| s.action == action).collect()
    }

    /// Summary of the plan
    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            create: self.steps_by_action(PlanAction::Create).len(),
            update: self.steps_by_action(PlanAction::Update).len(),
            replace: self.steps_by_action(PlanAction::Replace).len(),
            destroy: self.steps_by_action(PlanAction::Destroy).len(),
            no_change: self.steps_by_action(PlanAction::NoOp).len(),
        }
    }
}

/// Summary of planned actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub replace: usize,
    pub destroy: usize,
    pub no_change: usize,
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to destroy, {} unchanged",
            self.create, self.update, self.replace, self.destroy, self.no_change
        )
    }
}

/// SHA-256 over the canonical JSON text (object keys are sorted)
pub fn config_hash(config: &serde_json::Value) -> String {
    hex::encode(Sha256::digest(config.to_string().as_bytes()))
}

/// Substitute references using a node-id -> outputs lookup
///
/// Unresolvable references become [`UNKNOWN`].
pub fn resolve_config<F>(node: &ResourceNode, mut outputs: F) -> serde_json::Value
where
    F: FnMut(&AttributeReference) -> Option<serde_json::Value>,
{
    let mut lookup = |r: &AttributeReference| {
        outputs(r).unwrap_or_else(|| serde_json::Value::String(UNKNOWN.to_string()))
    };
    serde_json::Value::Object(
        node.config
            .iter()
            .map(|(k, v)| (k.clone(), v.resolve(&mut lookup)))
            .collect(),
    )
}

/// Whether a resolved configuration still contains a placeholder
pub fn contains_unknown(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::String(s) => s == UNKNOWN,
        serde_json::Value::Array(items) => items.iter().any(contains_unknown),
        serde_json::Value::Object(map) => map.values().any(contains_unknown),
        _ => false,
    }
}

/// Decide the action for a declared node against its record
pub fn classify(
    provider: &dyn ResourceProvider,
    node: &ResourceNode,
    resolved: &serde_json::Value,
    hash: &str,
    previous: Option<&StateRecord>,
) -> PlanAction {
    match previous {
        None => PlanAction::Create,
        Some(record) if record.resource_type != node.resource_type => PlanAction::Replace,
        Some(record) if record.config_hash == hash => PlanAction::NoOp,
        Some(record) => {
            match provider.classify_change(&node.resource_type, &record.config, resolved) {
                ChangeKind::InPlace => PlanAction::Update,
                ChangeKind::Replace => PlanAction::Replace,
            }
        }
    }
}

/// Compute the plan reconciling `stack` with `state`
pub fn plan(
    ctx: &StackContext,
    stack: &Stack,
    state: &StackState,
    provider: &dyn ResourceProvider,
) -> Result<Plan> {
    let graph = GraphBuilder::new(ctx).build(stack)?;
    let order = resolver::resolve(&graph)?;

    let mut steps = Vec::with_capacity(graph.len() + state.len());
    let mut actions: HashMap<&str, PlanAction> = HashMap::new();
    let mut levels: HashMap<&str, usize> = HashMap::new();
    let mut waits: HashSet<&str> = HashSet::new();

    for id in order.iter() {
        let Some(node) = graph.get(id) else { continue };
        let previous = state.get(id);

        let resolved = resolve_config(node, |r| match actions.get(r.node.as_str()) {
            Some(PlanAction::NoOp | PlanAction::Update) => state
                .get(&r.node)
                .and_then(|rec| rec.output(&r.attribute))
                .cloned(),
            _ => None,
        });
        let hash = config_hash(&resolved);
        let action = classify(provider, node, &resolved, &hash, previous);

        // plain no-op producers impose no ordering
        let producers = graph.producers_of(id);
        let after: Vec<String> = producers
            .iter()
            .filter(|p| {
                actions.get(*p).is_some_and(PlanAction::is_mutation) || waits.contains(*p)
            })
            .map(|p| p.to_string())
            .collect();
        let level = after
            .iter()
            .filter_map(|p| levels.get(p.as_str()))
            .max()
            .map_or(0, |l| l + 1);

        debug!(node = %id, %action, level, "Planned step");

        actions.insert(id, action);
        levels.insert(id, level);
        if !after.is_empty() {
            waits.insert(id);
        }

        steps.push(PlanStep {
            node: id.to_string(),
            resource_type: node.resource_type.clone(),
            action,
            level,
            after,
            dependencies: producers.iter().map(|p| p.to_string()).collect(),
            config_hash: Some(hash),
            resolved_config: resolved,
            declaration: Some(node.clone()),
            previous: previous.cloned(),
        });
    }

    // no-op producers drop out of the leveling, so resolver order is not
    // declaration order inside a level any more
    steps.sort_by_key(|s| (s.level, graph.position(&s.node)));

    let base = if steps.is_empty() {
        0
    } else {
        levels.values().copied().max().unwrap_or(0) + 1
    };
    steps.extend(destroy_steps(&graph, state, base));

    let plan = Plan::new(steps, state.serial, graph.outputs().to_vec());
    debug!(summary = %plan.summary(), serial = plan.state_serial, "Computed plan");
    Ok(plan)
}

/// Destroy steps for records that are no longer declared
fn destroy_steps(graph: &ResourceGraph, state: &StackState, base: usize) -> Vec<PlanStep> {
    let removed: Vec<&StateRecord> = state
        .resources
        .values()
        .filter(|r| !graph.contains(&r.id))
        .collect();
    if removed.is_empty() {
        return Vec::new();
    }

    // former dependents of every record, from recorded dependencies
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for record in state.resources.values() {
        for producer in &record.dependencies {
            dependents
                .entry(producer.as_str())
                .or_default()
                .push(record.id.as_str());
        }
    }
    let removed_ids: HashSet<&str> = removed.iter().map(|r| r.id.as_str()).collect();
    let depth = destroy_depths(&removed, &removed_ids, &dependents);

    removed
        .iter()
        .map(|record| PlanStep {
            node: record.id.clone(),
            resource_type: record.resource_type.clone(),
            action: PlanAction::Destroy,
            level: base + depth.get(record.id.as_str()).copied().unwrap_or(0),
            after: dependents
                .get(record.id.as_str())
                .map(|ids| ids.iter().map(|id| id.to_string()).collect())
                .unwrap_or_default(),
            dependencies: record.dependencies.clone(),
            config_hash: None,
            resolved_config: serde_json::Value::Null,
            declaration: None,
            previous: Some((*record).clone()),
        })
        .collect()
}

/// Depth of each removed record: one more than the deepest removed record
/// that depended on it
///
/// Post-order walk over an explicit stack of `(id, removed dependents, next)`
/// frames.
fn destroy_depths<'a>(
    removed: &[&'a StateRecord],
    removed_ids: &HashSet<&str>,
    dependents: &HashMap<&str, Vec<&'a str>>,
) -> HashMap<&'a str, usize> {
    let removed_dependents = |id: &str| -> Vec<&'a str> {
        dependents
            .get(id)
            .into_iter()
            .flatten()
            .copied()
            .filter(|d| removed_ids.contains(d))
            .collect()
    };

    let mut depth: HashMap<&'a str, usize> = HashMap::new();
    let mut visiting: HashSet<&'a str> = HashSet::new();

    for &record in removed {
        let root = record.id.as_str();
        if depth.contains_key(root) {
            continue;
        }
        visiting.insert(root);
        let mut stack = vec![(root, removed_dependents(root), 0usize)];

        while let Some((id, children, next)) = stack.last_mut() {
            if let Some(&child) = children.get(*next) {
                *next += 1;
                // recorded dependencies are acyclic unless the state file was edited by hand
                if !depth.contains_key(child) && visiting.insert(child) {
                    let grandchildren = removed_dependents(child);
                    stack.push((child, grandchildren, 0));
                }
                continue;
            }

            let d = children
                .iter()
                .filter_map(|c| depth.get(c))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            let id = *id;
            visiting.remove(id);
            depth.insert(id, d);
            stack.pop();
        }
    }
    depth
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Value;
    use crate::provider::{Outputs, ProviderResult, ResolvedNode};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;

    /// Classifies an `engine` change as replacement, everything else in place
    struct EngineSensitive;

    #[async_trait]
    impl ResourceProvider for EngineSensitive {
        async fn create(&self, _: &StackContext, _: &ResolvedNode) -> ProviderResult<Outputs> {
            Ok(Outputs::new())
        }

        async fn update(
            &self,
            _: &StackContext,
            _: &ResolvedNode,
            _: &StateRecord,
        ) -> ProviderResult<Outputs> {
            Ok(Outputs::new())
        }

        async fn destroy(&self, _: &StackContext, _: &StateRecord) -> ProviderResult<()> {
            Ok(())
        }

        fn classify_change(
            &self,
            _: &str,
            old: &serde_json::Value,
            new: &serde_json::Value,
        ) -> ChangeKind {
            if old.get("engine") != new.get("engine") {
                ChangeKind::Replace
            } else {
                ChangeKind::InPlace
            }
        }
    }

    fn ctx() -> StackContext {
        StackContext::new("trading", "dev", "us-east-1")
    }

    fn network_stack() -> Stack {
        Stack::new()
            .node(ResourceNode::new("network", "vpc").with("cidr", "10.0.0.0/16"))
            .node(
                ResourceNode::new("database", "rds_cluster")
                    .with("engine", "aurora-postgresql")
                    .depends_on("network"),
            )
            .node(
                ResourceNode::new("cache", "elasticache")
                    .with("engine", "redis")
                    .depends_on("network"),
            )
    }

    /// State as if every step of `plan` had been applied with `outputs`
    fn applied(plan: &Plan, outputs: &[(&str, Outputs)]) -> StackState {
        let mut state = StackState::new();
        for step in &plan.steps {
            state.set_record(StateRecord {
                id: step.node.clone(),
                resource_type: step.resource_type.clone(),
                config_hash: step.config_hash.clone().unwrap_or_default(),
                config: step.resolved_config.clone(),
                outputs: outputs
                    .iter()
                    .find(|(id, _)| *id == step.node)
                    .map(|(_, o)| o.clone())
                    .unwrap_or_default(),
                dependencies: step.dependencies.clone(),
                last_applied_at: Utc::now(),
            });
        }
        state
    }

    fn level_view(plan: &Plan) -> Vec<Vec<(String, PlanAction)>> {
        plan.levels()
            .into_iter()
            .map(|l| l.into_iter().map(|s| (s.node.clone(), s.action)).collect())
            .collect()
    }

    #[test]
    fn test_initial_plan_creates_in_levels() {
        let plan = plan(&ctx(), &network_stack(), &StackState::new(), &EngineSensitive).unwrap();

        assert_eq!(
            level_view(&plan),
            vec![
                vec![("network".to_string(), PlanAction::Create)],
                vec![
                    ("database".to_string(), PlanAction::Create),
                    ("cache".to_string(), PlanAction::Create)
                ],
            ]
        );
        assert!(plan.has_changes);
        assert_eq!(plan.step("database").unwrap().after, vec!["network"]);
    }

    #[test]
    fn test_removed_node_is_destroyed_after_no_ops() {
        let first = plan(&ctx(), &network_stack(), &StackState::new(), &EngineSensitive).unwrap();
        let state = applied(&first, &[]);

        let mut stack = network_stack();
        stack.remove("cache");
        let second = plan(&ctx(), &stack, &state, &EngineSensitive).unwrap();

        assert_eq!(
            level_view(&second),
            vec![
                vec![
                    ("network".to_string(), PlanAction::NoOp),
                    ("database".to_string(), PlanAction::NoOp)
                ],
                vec![("cache".to_string(), PlanAction::Destroy)],
            ]
        );
        assert_eq!(
            second.summary().to_string(),
            "0 to create, 0 to update, 0 to replace, 1 to destroy, 2 unchanged"
        );
        assert_eq!(second.state_serial, state.serial);
    }

    #[test]
    fn test_unchanged_stack_is_all_no_op() {
        let first = plan(&ctx(), &network_stack(), &StackState::new(), &EngineSensitive).unwrap();
        let state = applied(&first, &[]);

        let second = plan(&ctx(), &network_stack(), &state, &EngineSensitive).unwrap();
        assert!(!second.has_changes);
        assert_eq!(second.levels().len(), 1);
    }

    #[test]
    fn test_change_classification() {
        let first = plan(&ctx(), &network_stack(), &StackState::new(), &EngineSensitive).unwrap();
        let state = applied(&first, &[]);

        let stack = Stack::new()
            .node(ResourceNode::new("network", "vpc").with("cidr", "10.1.0.0/16"))
            .node(
                ResourceNode::new("database", "rds_cluster")
                    .with("engine", "aurora-mysql")
                    .depends_on("network"),
            )
            .node(
                ResourceNode::new("cache", "memorydb")
                    .with("engine", "redis")
                    .depends_on("network"),
            );
        let second = plan(&ctx(), &stack, &state, &EngineSensitive).unwrap();

        assert_eq!(second.step("network").unwrap().action, PlanAction::Update);
        assert_eq!(second.step("database").unwrap().action, PlanAction::Replace);
        // resource type changed
        assert_eq!(second.step("cache").unwrap().action, PlanAction::Replace);
        assert_eq!(second.step("cache").unwrap().level, 1);
    }

    #[test]
    fn test_references_resolve_against_recorded_outputs() {
        let stack = Stack::new()
            .node(ResourceNode::new("vpc", "vpc").with("cidr", "10.0.0.0/16"))
            .node(
                ResourceNode::new("subnet", "subnet").with("vpc_id", Value::reference("vpc", "id")),
            );

        let first = plan(&ctx(), &stack, &StackState::new(), &EngineSensitive).unwrap();
        assert_eq!(
            first.step("subnet").unwrap().resolved_config,
            json!({"vpc_id": UNKNOWN})
        );

        let vpc_outputs = Outputs::from([("id".to_string(), json!("vpc-0123"))]);
        let mut state = applied(&first, &[("vpc", vpc_outputs)]);
        // record what the subnet was actually applied with
        let resolved = json!({"vpc_id": "vpc-0123"});
        if let Some(subnet) = state.resources.get_mut("subnet") {
            subnet.config_hash = config_hash(&resolved);
            subnet.config = resolved.clone();
        }

        let second = plan(&ctx(), &stack, &state, &EngineSensitive).unwrap();
        let subnet = second.step("subnet").unwrap();
        assert_eq!(subnet.resolved_config, resolved);
        assert_eq!(subnet.action, PlanAction::NoOp);
        assert!(subnet.after.is_empty());
    }

    #[test]
    fn test_consumer_of_updated_producer_waits() {
        let stack = Stack::new()
            .node(ResourceNode::new("network", "vpc").with("cidr", "10.0.0.0/16"))
            .node(ResourceNode::new("database", "rds_cluster").depends_on("network"))
            .node(ResourceNode::new("app", "lambda").depends_on("database"));
        let initial = plan(&ctx(), &stack, &StackState::new(), &EngineSensitive).unwrap();
        let state = applied(&initial, &[]);

        let changed = Stack::new()
            .node(ResourceNode::new("network", "vpc").with("cidr", "10.9.0.0/16"))
            .node(ResourceNode::new("database", "rds_cluster").depends_on("network"))
            .node(ResourceNode::new("app", "lambda").depends_on("database"));
        let plan = plan(&ctx(), &changed, &state, &EngineSensitive).unwrap();

        // no-op database still waits because it waits on the updated network
        assert_eq!(plan.step("database").unwrap().level, 1);
        assert_eq!(plan.step("app").unwrap().level, 2);
        assert_eq!(plan.step("app").unwrap().after, vec!["database"]);
    }

    #[test]
    fn test_removed_nodes_are_destroyed_in_reverse_order() {
        let stack = Stack::new()
            .node(ResourceNode::new("network", "vpc"))
            .node(ResourceNode::new("subnet", "subnet").depends_on("network"))
            .node(ResourceNode::new("db-subnets", "db_subnet_group").depends_on("subnet"));
        let initial = plan(&ctx(), &stack, &StackState::new(), &EngineSensitive).unwrap();
        let state = applied(&initial, &[]);

        let plan = plan(&ctx(), &Stack::new(), &state, &EngineSensitive).unwrap();

        assert_eq!(plan.step("db-subnets").unwrap().level, 0);
        assert_eq!(plan.step("subnet").unwrap().level, 1);
        assert_eq!(plan.step("network").unwrap().level, 2);
        assert_eq!(plan.step("network").unwrap().after, vec!["subnet"]);
    }

    #[test]
    fn test_steps_keep_declaration_order_within_a_level() {
        let stack = Stack::new()
            .node(ResourceNode::new("x", "t"))
            .node(ResourceNode::new("y", "t").depends_on("z"))
            .node(ResourceNode::new("z", "t"));
        let order = |plan: &Plan| -> Vec<(usize, String)> {
            plan.steps.iter().map(|s| (s.level, s.node.clone())).collect()
        };

        let first = plan(&ctx(), &stack, &StackState::new(), &EngineSensitive).unwrap();
        assert_eq!(
            order(&first),
            vec![(0, "x".to_string()), (0, "z".to_string()), (1, "y".to_string())]
        );

        // once z is a no-op, y no longer waits and joins level 0
        let state = applied(&first, &[]);
        let second = plan(&ctx(), &stack, &state, &EngineSensitive).unwrap();
        assert_eq!(
            order(&second),
            vec![(0, "x".to_string()), (0, "y".to_string()), (0, "z".to_string())]
        );
    }

    #[test]
    fn test_long_removed_chain_is_destroyed_in_reverse() {
        let mut state = StackState::new();
        for i in 0..20_000 {
            let dependencies = if i == 0 {
                Vec::new()
            } else {
                vec![format!("n{}", i - 1)]
            };
            state.set_record(StateRecord {
                id: format!("n{i}"),
                resource_type: "t".to_string(),
                config_hash: String::new(),
                config: json!({}),
                outputs: Outputs::new(),
                dependencies,
                last_applied_at: Utc::now(),
            });
        }

        let plan = plan(&ctx(), &Stack::new(), &state, &EngineSensitive).unwrap();
        assert_eq!(plan.steps.len(), 20_000);
        assert_eq!(plan.step("n19999").unwrap().level, 0);
        assert_eq!(plan.step("n0").unwrap().level, 19_999);
        assert_eq!(plan.step("n0").unwrap().after, vec!["n1"]);
    }

    #[test]
    fn test_config_hash_is_key_order_independent() {
        let a: serde_json::Value = serde_json::from_str(r#"{"a":1,"b":[1,2]}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"b":[1,2],"a":1}"#).unwrap();
        assert_eq!(config_hash(&a), config_hash(&b));
        assert_eq!(config_hash(&a).len(), 64);
        assert_ne!(config_hash(&a), config_hash(&json!({"a": 2, "b": [1, 2]})));
    }

    #[test]
    fn test_contains_unknown() {
        assert!(contains_unknown(&json!({"ids": ["a", UNKNOWN]})));
        assert!(!contains_unknown(&json!({"ids": ["a", "b"]})));
    }
}
