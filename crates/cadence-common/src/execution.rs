//! Node execution records and the step response shapes they carry.

use crate::advise::Advise;
use crate::ambiance::Ambiance;
use crate::ids::generate_id;
use crate::interrupt::{InterruptType, Principal};
use crate::status::Status;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// How a node's work is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    Sync,
    Async,
    Task,
    TaskChain,
    Child,
    Children,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "SYNC",
            Self::Async => "ASYNC",
            Self::Task => "TASK",
            Self::TaskChain => "TASK_CHAIN",
            Self::Child => "CHILD",
            Self::Children => "CHILDREN",
        }
    }

    /// Status a node takes while waiting on work issued in this mode.
    pub fn waiting_status(&self) -> Option<Status> {
        match self {
            Self::Sync => None,
            Self::Async => Some(Status::AsyncWaiting),
            Self::Task | Self::TaskChain => Some(Status::TaskWaiting),
            Self::Child | Self::Children => Some(Status::ChildrenWaiting),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    #[default]
    Application,
    Configuration,
    Timeout,
    Aborted,
    Unexpected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub message: String,
    #[serde(default)]
    pub kind: FailureKind,
}

impl FailureInfo {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Application, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Configuration, message)
    }
}

/// A named value published by a step for later expression lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub name: String,
    pub value: Value,
}

/// Terminal result of a step invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outcomes: Vec<Outcome>,
}

impl StepResponse {
    pub fn succeeded() -> Self {
        Self {
            status: Status::Succeeded,
            failure: None,
            outcomes: Vec::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Status::Failed,
            failure: Some(FailureInfo::application(message)),
            outcomes: Vec::new(),
        }
    }

    pub fn with_status(status: Status) -> Self {
        Self {
            status,
            failure: None,
            outcomes: Vec::new(),
        }
    }

    pub fn with_outcome(mut self, name: impl Into<String>, value: Value) -> Self {
        self.outcomes.push(Outcome {
            name: name.into(),
            value,
        });
        self
    }
}

/// What a step handler hands back from `execute`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutableResponse {
    /// Result known immediately.
    Sync { response: StepResponse },
    /// Result arrives later through the listed callbacks.
    Async { callback_ids: Vec<String> },
    /// One delegated unit of work, resolved by callback.
    Task { callback_ids: Vec<String> },
    /// One link of a delegated chain. `chain_end` marks the last link.
    TaskChain {
        callback_ids: Vec<String>,
        #[serde(default)]
        chain_end: bool,
    },
    Child { child_node_id: String },
    Children { child_node_ids: Vec<String> },
}

impl ExecutableResponse {
    pub fn mode(&self) -> ExecutionMode {
        match self {
            Self::Sync { .. } => ExecutionMode::Sync,
            Self::Async { .. } => ExecutionMode::Async,
            Self::Task { .. } => ExecutionMode::Task,
            Self::TaskChain { .. } => ExecutionMode::TaskChain,
            Self::Child { .. } => ExecutionMode::Child,
            Self::Children { .. } => ExecutionMode::Children,
        }
    }

    /// Callback ids this response waits on; empty for non-callback modes.
    pub fn callback_ids(&self) -> &[String] {
        match self {
            Self::Async { callback_ids }
            | Self::Task { callback_ids }
            | Self::TaskChain { callback_ids, .. } => callback_ids,
            _ => &[],
        }
    }

    /// Plan node ids this response spawns as children.
    pub fn child_node_ids(&self) -> Vec<String> {
        match self {
            Self::Child { child_node_id } => vec![child_node_id.clone()],
            Self::Children { child_node_ids } => child_node_ids.clone(),
            _ => Vec::new(),
        }
    }
}

/// Audit entry for one interrupt applied to a node execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptEffect {
    pub interrupt_id: String,
    pub interrupt_type: InterruptType,
    pub applied_by: Principal,
    pub from_status: Status,
    pub to_status: Status,
    pub applied_at: DateTime<Utc>,
}

/// The advise applied once a node execution turned terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdviseRecord {
    pub advise: Advise,
    pub for_status: Status,
    pub decided_at: DateTime<Utc>,
}

/// One runtime attempt of a plan node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub uuid: String,
    pub plan_execution_id: String,
    /// Plan node this attempt executes
    pub node_id: String,
    /// Replacement parameters supplied for this attempt by a retry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_override: Option<Value>,
    pub ambiance: Ambiance,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ExecutionMode>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub start_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub executable_responses: Vec<ExecutableResponse>,
    #[serde(default)]
    pub resolved_step_parameters: Option<Value>,
    #[serde(default)]
    pub outcomes: Vec<Outcome>,
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
    #[serde(default)]
    pub interrupt_history: Vec<InterruptEffect>,
    /// Prior attempts of the same logical node, most recent first
    #[serde(default)]
    pub retry_ids: Vec<String>,
    /// Attempt that superseded this one
    #[serde(default)]
    pub retried_by: Option<String>,
    #[serde(default)]
    pub old_retry: bool,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub next_id: Option<String>,
    #[serde(default)]
    pub previous_id: Option<String>,
    /// Node execution told when this one concludes
    #[serde(default)]
    pub notify_id: Option<String>,
    /// Callback ids still outstanding
    #[serde(default)]
    pub waiting_on: BTreeSet<String>,
    /// Callback payloads received so far, including early arrivals
    #[serde(default)]
    pub callback_responses: BTreeMap<String, Value>,
    /// Status an interrupt moved this node from
    #[serde(default)]
    pub prior_status: Option<Status>,
    /// Sync result held back because the node was paused mid-call
    #[serde(default)]
    pub parked_response: Option<StepResponse>,
    #[serde(default)]
    pub timeout_instance_id: Option<String>,
    #[serde(default)]
    pub advise: Option<AdviseRecord>,
    pub version: u64,
}

impl NodeExecution {
    /// A fresh QUEUED record. The runtime id comes from the innermost level
    /// of `ambiance`.
    pub fn queued(
        plan_execution_id: impl Into<String>,
        node_id: impl Into<String>,
        ambiance: Ambiance,
    ) -> Self {
        let uuid = ambiance
            .current_runtime_id()
            .map(str::to_string)
            .unwrap_or_else(generate_id);
        let now = Utc::now();
        Self {
            uuid,
            plan_execution_id: plan_execution_id.into(),
            node_id: node_id.into(),
            parameter_override: None,
            ambiance,
            status: Status::Queued,
            mode: None,
            created_at: now,
            last_updated_at: now,
            start_ts: None,
            end_ts: None,
            executable_responses: Vec::new(),
            resolved_step_parameters: None,
            outcomes: Vec::new(),
            failure_info: None,
            interrupt_history: Vec::new(),
            retry_ids: Vec::new(),
            retried_by: None,
            old_retry: false,
            parent_id: None,
            next_id: None,
            previous_id: None,
            notify_id: None,
            waiting_on: BTreeSet::new(),
            callback_responses: BTreeMap::new(),
            prior_status: None,
            parked_response: None,
            timeout_instance_id: None,
            advise: None,
            version: 0,
        }
    }

    /// Attach to a parent that waits on this execution.
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        let parent_id = parent_id.into();
        self.notify_id = Some(parent_id.clone());
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_previous(mut self, previous_id: impl Into<String>) -> Self {
        self.previous_id = Some(previous_id.into());
        self
    }

    /// Not superseded by a retry.
    pub fn is_active(&self) -> bool {
        !self.old_retry
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.retry_ids.len() as u32 + 1
    }

    pub fn latest_response(&self) -> Option<&ExecutableResponse> {
        self.executable_responses.last()
    }

    /// Status this execution contributes when its parent or plan is reduced.
    ///
    /// A failure that an adviser took responsibility for counts as success.
    pub fn effective_status(&self) -> Status {
        match &self.advise {
            Some(record) if self.status.is_broken() && record.advise.resolves_failure() => {
                Status::Succeeded
            }
            _ => self.status,
        }
    }

    /// Move to `status`, maintaining timestamps.
    pub fn set_status(&mut self, status: Status) {
        let now = Utc::now();
        if status == Status::Running && self.start_ts.is_none() {
            self.start_ts = Some(now);
        }
        if status.is_terminal() && self.end_ts.is_none() {
            self.end_ts = Some(now);
        }
        self.status = status;
        self.last_updated_at = now;
    }

    /// Apply a terminal step response.
    pub fn conclude(&mut self, response: &StepResponse) {
        self.outcomes.extend(response.outcomes.iter().cloned());
        if response.failure.is_some() {
            self.failure_info = response.failure.clone();
        }
        self.waiting_on.clear();
        self.parked_response = None;
        self.prior_status = None;
        self.set_status(response.status);
    }

    pub fn record_interrupt(
        &mut self,
        interrupt_id: &str,
        interrupt_type: InterruptType,
        applied_by: &Principal,
        to_status: Status,
    ) {
        self.interrupt_history.push(InterruptEffect {
            interrupt_id: interrupt_id.to_string(),
            interrupt_type,
            applied_by: applied_by.clone(),
            from_status: self.status,
            to_status,
            applied_at: Utc::now(),
        });
    }

    pub fn outcome(&self, name: &str) -> Option<&Value> {
        self.outcomes
            .iter()
            .rev()
            .find(|o| o.name == name)
            .map(|o| &o.value)
    }
}
