//! Immutable plan definitions.

use crate::advise::AdviserObtainment;
use crate::execution::ExecutionMode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-node timeout declaration, e.g. `{ "duration": "1h30m" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub duration: String,
}

/// A single step or stage definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    /// Unique id within the plan; used by adviser rules and child lists.
    pub uuid: String,
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    /// Step-type tag used to look up the step handler.
    pub step_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Opaque parameters interpreted by the step handler.
    #[serde(default)]
    pub step_parameters: Value,
    /// Allowed execution modes in preference order. Empty means "whatever
    /// the step handler supports".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub facilitators: Vec<ExecutionMode>,
    /// Ordered adviser rules evaluated when the node reaches a terminal status.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub advisers: Vec<AdviserObtainment>,
    /// Expression; the node is skipped when it evaluates truthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutConfig>,
}

impl PlanNode {
    pub fn new(uuid: impl Into<String>, step_type: impl Into<String>) -> Self {
        let uuid = uuid.into();
        Self {
            identifier: uuid.clone(),
            name: uuid.clone(),
            uuid,
            step_type: step_type.into(),
            group: None,
            step_parameters: Value::Null,
            facilitators: Vec::new(),
            advisers: Vec::new(),
            skip_condition: None,
            timeout: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.step_parameters = parameters;
        self
    }

    pub fn with_facilitators(mut self, modes: Vec<ExecutionMode>) -> Self {
        self.facilitators = modes;
        self
    }

    pub fn with_adviser(mut self, adviser: AdviserObtainment) -> Self {
        self.advisers.push(adviser);
        self
    }

    pub fn with_skip_condition(mut self, condition: impl Into<String>) -> Self {
        self.skip_condition = Some(condition.into());
        self
    }

    pub fn with_timeout(mut self, duration: impl Into<String>) -> Self {
        self.timeout = Some(TimeoutConfig {
            duration: duration.into(),
        });
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Copy of this node carrying replacement step parameters.
    pub fn clone_with_parameters(&self, parameters: Value) -> PlanNode {
        let mut node = self.clone();
        node.step_parameters = parameters;
        node
    }

    /// Node ids referenced from this node's adviser rules.
    pub fn adviser_references(&self) -> Vec<&str> {
        self.advisers
            .iter()
            .flat_map(AdviserObtainment::referenced_nodes)
            .collect()
    }
}

/// An immutable set of plan nodes plus the root node id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    pub root_node_id: String,
    pub nodes: Vec<PlanNode>,
}

impl Plan {
    pub fn node(&self, uuid: &str) -> Option<&PlanNode> {
        self.nodes.iter().find(|n| n.uuid == uuid)
    }

    pub fn root(&self) -> Option<&PlanNode> {
        self.node(&self.root_node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
