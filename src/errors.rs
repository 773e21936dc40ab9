//! Typed error hierarchy for the Cadence engine.
//!
//! One enum per subsystem:
//! - `StoreError`: node/plan execution persistence
//! - `EngineError`: orchestration failures that are not step failures
//! - `StepError`: raised by step handlers, turned into FAILED by the engine
//! - `ExpressionError`: unresolvable parameter expressions and conditions
//! - `InterruptError`: rejected interrupt submissions
//! - `RetryError`: retry helper refusals
//! - `PlanError`: plan validation failures

use cadence_common::{Status, TimeoutParseError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record {id} not found")]
    NotFound { id: String },

    #[error("Record {id} already exists")]
    Duplicate { id: String },

    #[error("Version conflict on {id}: expected {expected}, found {found}")]
    VersionConflict { id: String, expected: u64, found: u64 },

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Fatal; the plan execution is ended ERRORED.
    #[error("Configuration error on node {node_id}: {message}")]
    Configuration { node_id: String, message: String },

    #[error("No step handler registered for step type '{step_type}'")]
    StepHandlerMissing { step_type: String },

    /// Conflicting writes kept winning; the dispatch unit is requeued.
    #[error("Conflicting update on node execution {node_execution_id}")]
    Conflict { node_execution_id: String },

    #[error("Node execution {id} not found")]
    NodeExecutionNotFound { id: String },

    #[error("Plan execution {id} not found")]
    PlanExecutionNotFound { id: String },

    #[error("Dispatcher is shut down")]
    DispatcherClosed,

    #[error("Plan execution {id} did not finish within {waited_ms}ms")]
    WaitTimedOut { id: String, waited_ms: u64 },

    /// The advise is recorded but the execution it leads to was not
    /// written. An ADVANCE unit for the node recreates it.
    #[error("Successor of node execution {node_execution_id} was not stored: {source}")]
    SuccessorNotStored {
        node_execution_id: String,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Retry(#[from] RetryError),

    #[error(transparent)]
    Step(#[from] StepError),

    #[error("Invalid plan: {0}")]
    InvalidPlan(#[from] PlanError),
}

impl EngineError {
    pub fn configuration(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            node_id: node_id.into(),
            message: message.into(),
        }
    }

    /// Whether the failed unit may succeed if dispatched again later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. }
                | Self::SuccessorNotStored { .. }
                | Self::Store(StoreError::VersionConflict { .. })
                | Self::Retry(RetryError::Conflict { .. })
        )
    }
}

/// Error raised by a step handler. Never reaches the caller; the engine
/// records it as a FAILED status with failure info.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("Invalid step parameters: {0}")]
    InvalidParameters(String),

    #[error("Step execution failed: {0}")]
    Execution(String),

    #[error("Step does not support mode {mode}")]
    UnsupportedMode { mode: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error, PartialEq)]
pub enum ExpressionError {
    #[error("Unknown expression '{expression}'")]
    Unknown { expression: String },

    #[error("Expression '{expression}' could not be resolved: {reason}")]
    Unresolved { expression: String, reason: String },

    #[error("Condition '{condition}' is not a boolean")]
    InvalidCondition { condition: String },
}

#[derive(Debug, Error)]
pub enum InterruptError {
    #[error("Plan execution {id} not found")]
    PlanExecutionNotFound { id: String },

    #[error("Interrupt {kind} requires a node execution id")]
    MissingNodeExecutionId { kind: String },

    #[error("Node execution {node_execution_id} does not belong to plan execution {plan_execution_id}")]
    ForeignNodeExecution {
        node_execution_id: String,
        plan_execution_id: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Retry(#[from] RetryError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("Node execution {id} not found")]
    NotFound { id: String },

    #[error("Node execution {id} in status {status} cannot be retried")]
    NotRetryable { id: String, status: Status },

    #[error("Node execution {id} was already retried by {retried_by}")]
    AlreadyRetried { id: String, retried_by: String },

    #[error("Conflicting update on node execution {id}")]
    Conflict { id: String },

    #[error("Dispatcher is shut down")]
    DispatcherClosed,

    /// The old attempt is claimed but the new one was not written.
    #[error("Retry attempt {id} was not stored: {source}")]
    AttemptNotStored {
        id: String,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Plan has no nodes")]
    Empty,

    #[error("Root node {root} is not defined")]
    MissingRoot { root: String },

    #[error("Node {id} is defined more than once")]
    DuplicateNode { id: String },

    #[error("Node {node} references unknown node {reference}")]
    UnknownReference { node: String, reference: String },

    #[error("Adviser rule '{rule}' on node {node} is malformed: {message}")]
    MalformedAdviser {
        node: String,
        rule: String,
        message: String,
    },

    #[error("Node {node} has an invalid timeout: {source}")]
    InvalidTimeout {
        node: String,
        #[source]
        source: TimeoutParseError,
    },

    #[error("Cycle detected involving node {node}")]
    CycleDetected { node: String },
}
