//! Adviser rules and the control actions they produce.

use crate::status::Status;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Control action applied after a node reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Advise {
    /// Trigger the named node as the next sibling.
    NextStep { node_id: String },
    /// Start a new attempt of the same logical node.
    Retry {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parameters: Option<Value>,
        #[serde(default)]
        wait_ms: u64,
    },
    /// Trigger the rollback strategy node as the next sibling.
    Rollback { strategy_node_id: String },
    /// Stop the whole plan with the given status.
    EndPlan { final_status: Status },
    /// Treat the failure as success and advise again.
    MarkSuccess,
    /// Hand the terminal status to the parent (or conclude the plan).
    Propagate,
}

impl Advise {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NextStep { .. } => "NEXT_STEP",
            Self::Retry { .. } => "RETRY",
            Self::Rollback { .. } => "ROLLBACK",
            Self::EndPlan { .. } => "END_PLAN",
            Self::MarkSuccess => "MARK_SUCCESS",
            Self::Propagate => "PROPAGATE",
        }
    }

    /// Whether this advise, applied to a broken status, takes responsibility
    /// for the failure so that it no longer propagates to the parent.
    pub fn resolves_failure(&self) -> bool {
        matches!(
            self,
            Self::NextStep { .. } | Self::Rollback { .. } | Self::MarkSuccess
        )
    }
}

/// What a retry rule does once its attempts are used up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExhaustedAction {
    #[default]
    Propagate,
    Rollback {
        strategy_node_id: String,
    },
    MarkSuccess,
    EndPlan {
        final_status: Status,
    },
}

impl ExhaustedAction {
    pub fn to_advise(&self) -> Advise {
        match self {
            Self::Propagate => Advise::Propagate,
            Self::Rollback { strategy_node_id } => Advise::Rollback {
                strategy_node_id: strategy_node_id.clone(),
            },
            Self::MarkSuccess => Advise::MarkSuccess,
            Self::EndPlan { final_status } => Advise::EndPlan {
                final_status: *final_status,
            },
        }
    }
}

fn success_statuses() -> Vec<Status> {
    vec![Status::Succeeded, Status::Skipped]
}

fn failure_statuses() -> Vec<Status> {
    vec![Status::Failed, Status::Expired]
}

fn default_end_status() -> Status {
    Status::Failed
}

/// One adviser rule attached to a plan node.
///
/// Rules are evaluated in declaration order; each applies only when the
/// node's terminal status is listed in its `on` set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdviserObtainment {
    NextStep {
        next_node_id: String,
        #[serde(default = "success_statuses")]
        on: Vec<Status>,
    },
    Retry {
        /// Total attempts, the first one included.
        max_attempts: u32,
        #[serde(default)]
        wait_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parameters: Option<Value>,
        #[serde(default)]
        on_exhausted: ExhaustedAction,
        #[serde(default = "failure_statuses")]
        on: Vec<Status>,
    },
    Rollback {
        strategy_node_id: String,
        #[serde(default = "failure_statuses")]
        on: Vec<Status>,
    },
    MarkSuccess {
        #[serde(default = "failure_statuses")]
        on: Vec<Status>,
    },
    EndPlan {
        #[serde(default = "default_end_status")]
        final_status: Status,
        #[serde(default = "failure_statuses")]
        on: Vec<Status>,
    },
}

impl AdviserObtainment {
    pub fn next_step(node_id: impl Into<String>) -> Self {
        Self::NextStep {
            next_node_id: node_id.into(),
            on: success_statuses(),
        }
    }

    pub fn retry(max_attempts: u32) -> Self {
        Self::Retry {
            max_attempts,
            wait_ms: 0,
            parameters: None,
            on_exhausted: ExhaustedAction::Propagate,
            on: failure_statuses(),
        }
    }

    /// Retry rule that rolls back to `strategy_node_id` once exhausted.
    pub fn retry_then_rollback(max_attempts: u32, strategy_node_id: impl Into<String>) -> Self {
        Self::Retry {
            max_attempts,
            wait_ms: 0,
            parameters: None,
            on_exhausted: ExhaustedAction::Rollback {
                strategy_node_id: strategy_node_id.into(),
            },
            on: failure_statuses(),
        }
    }

    pub fn rollback(strategy_node_id: impl Into<String>) -> Self {
        Self::Rollback {
            strategy_node_id: strategy_node_id.into(),
            on: failure_statuses(),
        }
    }

    pub fn mark_success() -> Self {
        Self::MarkSuccess {
            on: failure_statuses(),
        }
    }

    pub fn end_plan(final_status: Status) -> Self {
        Self::EndPlan {
            final_status,
            on: failure_statuses(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::NextStep { .. } => "next_step",
            Self::Retry { .. } => "retry",
            Self::Rollback { .. } => "rollback",
            Self::MarkSuccess { .. } => "mark_success",
            Self::EndPlan { .. } => "end_plan",
        }
    }

    /// Statuses this rule reacts to.
    pub fn on(&self) -> &[Status] {
        match self {
            Self::NextStep { on, .. }
            | Self::Retry { on, .. }
            | Self::Rollback { on, .. }
            | Self::MarkSuccess { on }
            | Self::EndPlan { on, .. } => on,
        }
    }

    pub fn applies_to(&self, status: Status) -> bool {
        self.on().contains(&status)
    }

    /// Plan node ids this rule may trigger.
    pub fn referenced_nodes(&self) -> Vec<&str> {
        match self {
            Self::NextStep { next_node_id, .. } => vec![next_node_id.as_str()],
            Self::Rollback {
                strategy_node_id, ..
            } => vec![strategy_node_id.as_str()],
            Self::Retry {
                on_exhausted: ExhaustedAction::Rollback { strategy_node_id },
                ..
            } => vec![strategy_node_id.as_str()],
            _ => Vec::new(),
        }
    }
}
