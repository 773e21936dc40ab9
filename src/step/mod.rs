//! Step handler contract.
//!
//! A step handler owns the business logic of one step type. The engine
//! only sees the response shape it returns from `execute` and, for callback
//! modes, the final status from `handle_result`.

pub mod registry;

pub use registry::StepRegistry;

use crate::engine::dispatcher::{DispatchHandle, DispatchUnit};
use crate::errors::{EngineError, StepError};
use async_trait::async_trait;
use cadence_common::{
    Ambiance, ExecutableResponse, ExecutionMode, FailureInfo, PlanNode, Status, StepResponse,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Lets a step deliver completions for work it started, standing in for
/// an external completion source.
#[derive(Clone)]
pub struct CompletionHandle {
    dispatch: DispatchHandle,
}

impl CompletionHandle {
    pub fn new(dispatch: DispatchHandle) -> Self {
        Self { dispatch }
    }

    /// Resume `node_execution_id` with `callback_id` after `delay`.
    pub fn complete_after(
        &self,
        node_execution_id: &str,
        callback_id: &str,
        payload: Value,
        delay: Duration,
    ) -> Result<(), EngineError> {
        self.dispatch.submit_after(
            DispatchUnit::Resume {
                node_execution_id: node_execution_id.to_string(),
                callback_id: callback_id.to_string(),
                payload,
            },
            delay,
        )
    }
}

/// Everything a step handler gets to know about the invocation.
#[derive(Clone)]
pub struct StepContext {
    pub plan_execution_id: String,
    pub node_execution_id: String,
    /// Plan node as executed (retry parameter overrides applied)
    pub node: PlanNode,
    /// The execution's recorded ambiance
    pub ambiance: Ambiance,
    pub attempt: u32,
    pub completions: CompletionHandle,
}

#[async_trait]
pub trait StepHandler: Send + Sync {
    fn step_type(&self) -> &str;

    /// Modes this handler can run in, most preferred first.
    fn supported_modes(&self) -> &[ExecutionMode];

    async fn execute(
        &self,
        ctx: &StepContext,
        mode: ExecutionMode,
        parameters: &Value,
    ) -> Result<ExecutableResponse, StepError>;

    /// Decide the final status once every callback has arrived.
    async fn handle_result(
        &self,
        _ctx: &StepContext,
        _parameters: &Value,
        responses: &BTreeMap<String, Value>,
    ) -> Result<StepResponse, StepError> {
        Ok(reduce_callback_payloads(responses))
    }

    /// Issue the next link of a TASK_CHAIN after `completed_links` finished.
    async fn next_link(
        &self,
        _ctx: &StepContext,
        _parameters: &Value,
        _completed_links: usize,
        _responses: &BTreeMap<String, Value>,
    ) -> Result<ExecutableResponse, StepError> {
        Err(StepError::UnsupportedMode {
            mode: ExecutionMode::TaskChain.to_string(),
        })
    }

    /// Best-effort cancellation of outstanding external work.
    async fn handle_abort(
        &self,
        _ctx: &StepContext,
        _response: Option<&ExecutableResponse>,
    ) -> Result<(), StepError> {
        Ok(())
    }
}

/// Default interpretation of callback payloads.
///
/// A payload object may carry `"status"` (any status name) and `"message"`.
/// The worst status wins; payloads without a status count as succeeded.
/// All payloads are published as the `callbacks` outcome.
pub fn reduce_callback_payloads(responses: &BTreeMap<String, Value>) -> StepResponse {
    let mut failure: Option<FailureInfo> = None;
    let statuses: Vec<Status> = responses
        .values()
        .map(|payload| {
            let status = payload
                .get("status")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<Status>().ok())
                .filter(Status::is_terminal)
                .unwrap_or(Status::Succeeded);
            if status.is_broken() && failure.is_none() {
                let message = payload
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("Delegated work reported failure");
                failure = Some(FailureInfo::application(message));
            }
            status
        })
        .collect();

    let callbacks: serde_json::Map<String, Value> = responses
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    StepResponse {
        status: Status::reduce(statuses),
        failure,
        outcomes: Vec::new(),
    }
    .with_outcome("callbacks", Value::Object(callbacks))
}
