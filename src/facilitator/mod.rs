//! Facilitators decide which execution mode a node runs in.
//!
//! Each mode has a default facilitator that accepts every node. A step type
//! may register its own facilitator for a mode, for example to refuse TASK
//! mode unless some setup value is present.

use crate::errors::EngineError;
use crate::step::StepHandler;
use cadence_common::{Ambiance, ExecutionMode, PlanNode};
use std::collections::HashMap;
use std::sync::Arc;

pub trait Facilitator: Send + Sync {
    fn mode(&self) -> ExecutionMode;

    /// Whether this facilitator is willing to run `node` here.
    fn accepts(&self, _node: &PlanNode, _ambiance: &Ambiance) -> bool {
        true
    }
}

/// Accepts everything for one mode.
pub struct ModeFacilitator(pub ExecutionMode);

impl Facilitator for ModeFacilitator {
    fn mode(&self) -> ExecutionMode {
        self.0
    }
}

pub struct FacilitatorRegistry {
    defaults: HashMap<ExecutionMode, Arc<dyn Facilitator>>,
    overrides: HashMap<(String, ExecutionMode), Arc<dyn Facilitator>>,
}

impl Default for FacilitatorRegistry {
    fn default() -> Self {
        let defaults = [
            ExecutionMode::Sync,
            ExecutionMode::Async,
            ExecutionMode::Task,
            ExecutionMode::TaskChain,
            ExecutionMode::Child,
            ExecutionMode::Children,
        ]
        .into_iter()
        .map(|mode| (mode, Arc::new(ModeFacilitator(mode)) as Arc<dyn Facilitator>))
        .collect();
        Self {
            defaults,
            overrides: HashMap::new(),
        }
    }
}

impl FacilitatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with no facilitators at all; every node is a configuration error
    /// until something is registered.
    pub fn empty() -> Self {
        Self {
            defaults: HashMap::new(),
            overrides: HashMap::new(),
        }
    }

    pub fn register_default(&mut self, facilitator: Arc<dyn Facilitator>) -> &mut Self {
        self.defaults.insert(facilitator.mode(), facilitator);
        self
    }

    /// Use `facilitator` for its mode, but only for nodes of `step_type`.
    pub fn register_for(
        &mut self,
        step_type: impl Into<String>,
        facilitator: Arc<dyn Facilitator>,
    ) -> &mut Self {
        self.overrides
            .insert((step_type.into(), facilitator.mode()), facilitator);
        self
    }

    fn candidate(&self, step_type: &str, mode: ExecutionMode) -> Option<&Arc<dyn Facilitator>> {
        self.overrides
            .get(&(step_type.to_string(), mode))
            .or_else(|| self.defaults.get(&mode))
    }

    /// Pick the execution mode for `node`.
    ///
    /// Modes are tried in the node's declared preference order, or the
    /// handler's own order when the node declares none. The first mode the
    /// handler supports and whose facilitator accepts the node wins.
    pub fn select(
        &self,
        node: &PlanNode,
        handler: &dyn StepHandler,
        ambiance: &Ambiance,
    ) -> Result<ExecutionMode, EngineError> {
        let supported = handler.supported_modes();
        let preference: &[ExecutionMode] = if node.facilitators.is_empty() {
            supported
        } else {
            &node.facilitators
        };

        preference
            .iter()
            .copied()
            .filter(|mode| supported.contains(mode))
            .find(|mode| {
                self.candidate(&node.step_type, *mode)
                    .is_some_and(|f| f.accepts(node, ambiance))
            })
            .ok_or_else(|| {
                let wanted: Vec<&str> = preference.iter().map(ExecutionMode::as_str).collect();
                EngineError::configuration(
                    node.uuid.clone(),
                    format!(
                        "no facilitator accepts step type '{}' in modes [{}]",
                        node.step_type,
                        wanted.join(", ")
                    ),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::{DelegateStep, NoopStep};
    use std::collections::BTreeMap;

    fn ambiance() -> Ambiance {
        Ambiance {
            plan_execution_id: "pe".to_string(),
            setup_abstractions: BTreeMap::new(),
            levels: Vec::new(),
        }
    }

    struct Refuse(ExecutionMode);

    impl Facilitator for Refuse {
        fn mode(&self) -> ExecutionMode {
            self.0
        }

        fn accepts(&self, _node: &PlanNode, _ambiance: &Ambiance) -> bool {
            false
        }
    }

    #[test]
    fn test_handler_order_used_without_preference() {
        let registry = FacilitatorRegistry::new();
        let node = PlanNode::new("d", "delegate");
        let mode = registry.select(&node, &DelegateStep, &ambiance()).unwrap();
        assert_eq!(mode, ExecutionMode::Async);
    }

    #[test]
    fn test_node_preference_wins() {
        let registry = FacilitatorRegistry::new();
        let node = PlanNode::new("d", "delegate")
            .with_facilitators(vec![ExecutionMode::Sync, ExecutionMode::Task]);
        // SYNC is skipped because the handler does not support it
        let mode = registry.select(&node, &DelegateStep, &ambiance()).unwrap();
        assert_eq!(mode, ExecutionMode::Task);
    }

    #[test]
    fn test_override_can_refuse() {
        let mut registry = FacilitatorRegistry::new();
        registry.register_for("delegate", Arc::new(Refuse(ExecutionMode::Async)));
        let node = PlanNode::new("d", "delegate");
        let mode = registry.select(&node, &DelegateStep, &ambiance()).unwrap();
        assert_eq!(mode, ExecutionMode::Task);
    }

    #[test]
    fn test_no_facilitator_is_configuration_error() {
        let registry = FacilitatorRegistry::empty();
        let node = PlanNode::new("a", "noop");
        let err = registry.select(&node, &NoopStep, &ambiance()).unwrap_err();
        assert!(matches!(err, EngineError::Configuration { .. }));

        let registry = FacilitatorRegistry::new();
        let node = PlanNode::new("a", "noop").with_facilitators(vec![ExecutionMode::Async]);
        assert!(registry.select(&node, &NoopStep, &ambiance()).is_err());
    }
}
