//! Ambiance builder: creates and extends execution addressing contexts.

use cadence_common::ambiance::PLAN_GROUP;
use cadence_common::{Ambiance, Level, NodeExecution, PlanNode, generate_id};
use std::collections::BTreeMap;

pub const PLAN_STEP_TYPE: &str = "PLAN";

/// Single-level ambiance for a new plan execution.
pub fn initial(
    plan_execution_id: &str,
    plan_id: &str,
    setup_abstractions: BTreeMap<String, String>,
) -> Ambiance {
    Ambiance {
        plan_execution_id: plan_execution_id.to_string(),
        setup_abstractions,
        levels: vec![Level {
            runtime_id: plan_execution_id.to_string(),
            setup_id: plan_id.to_string(),
            identifier: plan_id.to_string(),
            step_type: PLAN_STEP_TYPE.to_string(),
            group: Some(PLAN_GROUP.to_string()),
            retry_index: 0,
            setup_metadata: BTreeMap::new(),
        }],
    }
}

/// Append one level. The input is left untouched.
pub fn push(ambiance: &Ambiance, level: Level) -> Ambiance {
    ambiance.with_level(level)
}

/// Level for a fresh execution of `node` with a newly allocated runtime id.
pub fn level_for_node(node: &PlanNode, retry_index: u32) -> Level {
    let mut setup_metadata = BTreeMap::new();
    if !node.name.is_empty() {
        setup_metadata.insert("name".to_string(), node.name.clone());
    }
    Level {
        runtime_id: generate_id(),
        setup_id: node.uuid.clone(),
        identifier: node.identifier.clone(),
        step_type: node.step_type.clone(),
        group: node.group.clone(),
        retry_index,
        setup_metadata,
    }
}

/// Ambiance for a node nested under the execution holding `base`.
///
/// Siblings in a sequence are addressed from their shared parent, so this is
/// also how the next step of a sequence gets its ambiance.
pub fn for_child(base: &Ambiance, node: &PlanNode) -> Ambiance {
    push(base, level_for_node(node, 0))
}

/// Ambiance for a new attempt of `failed`: its recorded ambiance plus one
/// fresh level with the next retry index.
pub fn for_retry(failed: &NodeExecution, node: &PlanNode) -> Ambiance {
    let retry_index = failed
        .ambiance
        .current_level()
        .map(|l| l.retry_index + 1)
        .unwrap_or(1);
    push(&failed.ambiance, level_for_node(node, retry_index))
}

/// Give the innermost level a known runtime id, used when an execution
/// whose id was already handed out has to be written again.
pub fn with_runtime_id(mut ambiance: Ambiance, runtime_id: &str) -> Ambiance {
    if let Some(level) = ambiance.levels.last_mut() {
        level.runtime_id = runtime_id.to_string();
    }
    ambiance
}
