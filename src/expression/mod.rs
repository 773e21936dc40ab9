//! Parameter expressions and skip conditions.
//!
//! Expressions are written `<+path>` inside any string of a node's step
//! parameters. Supported paths:
//!
//! - `setup.KEY`: a setup abstraction of the plan execution
//! - `plan.executionId`
//! - `node.NODE_ID.status`: status of the latest active execution of a node
//! - `node.NODE_ID.outcome.NAME[.field...]`: an outcome it published
//! - `self.attempt`: attempt number of the execution being resolved
//!
//! A string that is exactly one expression takes the expression's JSON
//! value; expressions embedded in longer strings are interpolated as text.

mod template;

pub use template::TemplateResolver;

use crate::errors::ExpressionError;
use cadence_common::{Ambiance, NodeExecution, Outcome, Status};
use serde_json::Value;
use std::collections::HashMap;

/// What one plan node has produced so far.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub status: Status,
    pub outcomes: Vec<Outcome>,
}

/// Read-only view an expression is resolved against.
#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub plan_execution_id: String,
    pub ambiance: Ambiance,
    pub attempt: u32,
    /// Keyed by plan node id
    pub nodes: HashMap<String, NodeSnapshot>,
}

impl ResolutionContext {
    /// Context for `target`, given every node execution of its plan execution
    /// in creation order.
    pub fn new(target: &NodeExecution, executions: &[NodeExecution]) -> Self {
        let nodes = executions
            .iter()
            .filter(|ne| ne.is_active())
            .map(|ne| {
                (
                    ne.node_id.clone(),
                    NodeSnapshot {
                        status: ne.status,
                        outcomes: ne.outcomes.clone(),
                    },
                )
            })
            .collect();
        Self {
            plan_execution_id: target.plan_execution_id.clone(),
            ambiance: target.ambiance.clone(),
            attempt: target.attempt(),
            nodes,
        }
    }

    pub fn setup_value(&self, key: &str) -> Option<&str> {
        self.ambiance.setup_value(key)
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeSnapshot> {
        self.nodes.get(node_id)
    }
}

pub trait ExpressionResolver: Send + Sync {
    /// Resolve every expression inside `value`.
    fn resolve(&self, ctx: &ResolutionContext, value: &Value) -> Result<Value, ExpressionError>;

    fn evaluate_condition(
        &self,
        ctx: &ResolutionContext,
        condition: &str,
    ) -> Result<bool, ExpressionError>;
}
