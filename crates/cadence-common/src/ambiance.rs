//! Ambiance: the addressing context of a node execution.
//!
//! An ambiance is the path from the plan execution down to one node
//! execution, one [`Level`] per nesting step or retry attempt. Levels are
//! only ever appended; a recorded ambiance is never edited in place.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Group tag carried by the plan-level entry of every ambiance.
pub const PLAN_GROUP: &str = "PLAN";

/// One step of the execution path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    /// Runtime id of the execution this level addresses
    pub runtime_id: String,
    /// Id of the plan node (or plan) this level was built from
    pub setup_id: String,
    /// Human-facing identifier of the plan node
    pub identifier: String,
    pub step_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Zero for the first attempt, incremented per retry
    #[serde(default)]
    pub retry_index: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub setup_metadata: BTreeMap<String, String>,
}

/// Ordered stack of levels plus the plan-wide setup abstractions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ambiance {
    pub plan_execution_id: String,
    /// Plan-wide key/values (account, org, project, environment, ...)
    #[serde(default)]
    pub setup_abstractions: BTreeMap<String, String>,
    pub levels: Vec<Level>,
}

impl Ambiance {
    /// Number of levels, including the plan-level entry.
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    /// Runtime id of the innermost level.
    pub fn current_runtime_id(&self) -> Option<&str> {
        self.current_level().map(|l| l.runtime_id.as_str())
    }

    /// Step type of the innermost level.
    pub fn current_step_type(&self) -> Option<&str> {
        self.current_level().map(|l| l.step_type.as_str())
    }

    /// Return a copy with one more level appended.
    pub fn with_level(&self, level: Level) -> Ambiance {
        let mut next = self.clone();
        next.levels.push(level);
        next
    }

    /// Look up a setup abstraction (`accountId`, `projectId`, ...).
    pub fn setup_value(&self, key: &str) -> Option<&str> {
        self.setup_abstractions.get(key).map(String::as_str)
    }

    /// Identifiers from the outermost to the innermost level, joined with `.`.
    pub fn fqn(&self) -> String {
        self.levels
            .iter()
            .map(|l| l.identifier.as_str())
            .collect::<Vec<_>>()
            .join(".")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(id: &str) -> Level {
        Level {
            runtime_id: format!("rt-{}", id),
            setup_id: id.to_string(),
            identifier: id.to_string(),
            step_type: "noop".to_string(),
            group: None,
            retry_index: 0,
            setup_metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_with_level_leaves_original_untouched() {
        let base = Ambiance {
            plan_execution_id: "pe".to_string(),
            setup_abstractions: BTreeMap::new(),
            levels: vec![level("plan")],
        };
        let child = base.with_level(level("build"));

        assert_eq!(base.depth(), 1);
        assert_eq!(child.depth(), 2);
        assert_eq!(child.current_runtime_id(), Some("rt-build"));
        assert_eq!(child.fqn(), "plan.build");
    }
}
