//! Post-completion policy.
//!
//! Once a node execution is terminal its plan node's adviser rules are
//! consulted in declaration order. The first rule that can advise on the
//! status decides what happens next; with no applicable rule the status is
//! propagated to the parent.

mod rules;

pub use rules::RuleAdviser;

use cadence_common::{Advise, NodeExecution, PlanNode, Status};

pub trait Adviser: Send + Sync {
    fn can_advise(&self, node_execution: &NodeExecution, status: Status) -> bool;

    fn advise(&self, node_execution: &NodeExecution, status: Status) -> Advise;
}

pub struct AdviserChain {
    advisers: Vec<Box<dyn Adviser>>,
}

impl AdviserChain {
    pub fn new(advisers: Vec<Box<dyn Adviser>>) -> Self {
        Self { advisers }
    }

    /// Chain built from the rules declared on `node`.
    pub fn for_node(node: &PlanNode) -> Self {
        Self::new(
            node.advisers
                .iter()
                .cloned()
                .map(|rule| Box::new(RuleAdviser::new(rule)) as Box<dyn Adviser>)
                .collect(),
        )
    }

    /// Advise for `node_execution` finishing with `status`.
    pub fn advise(&self, node_execution: &NodeExecution, status: Status) -> Advise {
        self.advisers
            .iter()
            .find(|adviser| adviser.can_advise(node_execution, status))
            .map(|adviser| adviser.advise(node_execution, status))
            .unwrap_or(Advise::Propagate)
    }

    pub fn len(&self) -> usize {
        self.advisers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.advisers.is_empty()
    }
}
