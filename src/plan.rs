//! Plan construction and validation.
//!
//! A plan is checked once, before any execution starts:
//! - node ids are unique and the root exists
//! - adviser rules and child lists only reference defined nodes
//! - adviser rules are well formed and timeouts parse
//! - the static edges (next step, rollback, children) contain no cycle

use crate::errors::PlanError;
use anyhow::{Context, Result};
use cadence_common::{AdviserObtainment, Plan, PlanNode, parse_timeout};
use std::collections::HashMap;
use std::path::Path;

/// Parameter keys the built-in container steps read their children from.
pub const CHILD_PARAM: &str = "child";
pub const CHILDREN_PARAM: &str = "children";

/// Child node ids declared in a node's step parameters.
pub fn declared_children(node: &PlanNode) -> Vec<String> {
    let params = &node.step_parameters;
    let mut children = Vec::new();
    if let Some(child) = params.get(CHILD_PARAM).and_then(|v| v.as_str()) {
        children.push(child.to_string());
    }
    if let Some(list) = params.get(CHILDREN_PARAM).and_then(|v| v.as_array()) {
        children.extend(list.iter().filter_map(|v| v.as_str()).map(str::to_string));
    }
    children
}

/// Builder for validated plans.
pub struct PlanBuilder {
    uuid: String,
    name: String,
    root: Option<String>,
    nodes: Vec<PlanNode>,
}

impl PlanBuilder {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            name: String::new(),
            root: None,
            nodes: Vec::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Root node id. Defaults to the first node added.
    pub fn root(mut self, node_id: impl Into<String>) -> Self {
        self.root = Some(node_id.into());
        self
    }

    pub fn node(mut self, node: PlanNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn build(self) -> Result<Plan, PlanError> {
        let root_node_id = match self.root {
            Some(root) => root,
            None => self
                .nodes
                .first()
                .map(|n| n.uuid.clone())
                .ok_or(PlanError::Empty)?,
        };
        let plan = Plan {
            uuid: self.uuid,
            name: self.name,
            root_node_id,
            nodes: self.nodes,
        };
        validate(&plan)?;
        Ok(plan)
    }
}

/// Validate a plan that was constructed or deserialized elsewhere.
pub fn validate(plan: &Plan) -> Result<(), PlanError> {
    if plan.is_empty() {
        return Err(PlanError::Empty);
    }

    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, node) in plan.nodes.iter().enumerate() {
        if index.insert(node.uuid.as_str(), i).is_some() {
            return Err(PlanError::DuplicateNode {
                id: node.uuid.clone(),
            });
        }
    }

    if !index.contains_key(plan.root_node_id.as_str()) {
        return Err(PlanError::MissingRoot {
            root: plan.root_node_id.clone(),
        });
    }

    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); plan.len()];
    for (from, node) in plan.nodes.iter().enumerate() {
        for rule in &node.advisers {
            validate_rule(node, rule)?;
        }

        if let Some(timeout) = &node.timeout {
            parse_timeout(&timeout.duration).map_err(|source| PlanError::InvalidTimeout {
                node: node.uuid.clone(),
                source,
            })?;
        }

        let children = declared_children(node);
        let references = node
            .adviser_references()
            .into_iter()
            .chain(children.iter().map(String::as_str));
        for reference in references {
            let to = *index
                .get(reference)
                .ok_or_else(|| PlanError::UnknownReference {
                    node: node.uuid.clone(),
                    reference: reference.to_string(),
                })?;
            edges[from].push(to);
        }
    }

    check_acyclic(plan, &edges)
}

fn validate_rule(node: &PlanNode, rule: &AdviserObtainment) -> Result<(), PlanError> {
    let malformed = |message: &str| PlanError::MalformedAdviser {
        node: node.uuid.clone(),
        rule: rule.kind().to_string(),
        message: message.to_string(),
    };

    if rule.on().is_empty() {
        return Err(malformed("rule reacts to no status"));
    }
    if let Some(status) = rule.on().iter().find(|s| !s.is_terminal()) {
        return Err(malformed(&format!("{} is not a terminal status", status)));
    }
    match rule {
        AdviserObtainment::Retry { max_attempts, .. } if *max_attempts == 0 => {
            Err(malformed("max_attempts must be at least 1"))
        }
        AdviserObtainment::EndPlan { final_status, .. } if !final_status.is_terminal() => Err(
            malformed(&format!("final status {} is not terminal", final_status)),
        ),
        _ => Ok(()),
    }
}

/// Kahn's algorithm over the static edges.
fn check_acyclic(plan: &Plan, edges: &[Vec<usize>]) -> Result<(), PlanError> {
    let mut in_degree = vec![0usize; plan.len()];
    for targets in edges {
        for &to in targets {
            in_degree[to] += 1;
        }
    }

    let mut queue: Vec<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|&(_, deg)| *deg == 0)
        .map(|(i, _)| i)
        .collect();
    let mut processed = 0;

    while let Some(node) = queue.pop() {
        processed += 1;
        for &to in &edges[node] {
            in_degree[to] -= 1;
            if in_degree[to] == 0 {
                queue.push(to);
            }
        }
    }

    if processed != plan.len() {
        let stuck = in_degree
            .iter()
            .position(|&deg| deg > 0)
            .map(|i| plan.nodes[i].uuid.clone())
            .unwrap_or_default();
        return Err(PlanError::CycleDetected { node: stuck });
    }
    Ok(())
}

/// Load a plan from a `.json`, `.yaml` or `.yml` file and validate it.
pub fn load_plan_file(path: &Path) -> Result<Plan> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan file: {}", path.display()))?;

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let plan: Plan = if is_yaml {
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse plan file: {}", path.display()))?
    } else {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse plan file: {}", path.display()))?
    };

    validate(&plan).with_context(|| format!("Invalid plan: {}", path.display()))?;
    Ok(plan)
}
