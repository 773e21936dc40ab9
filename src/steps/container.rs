//! Steps that only group other nodes.

use crate::errors::StepError;
use crate::plan::{CHILD_PARAM, CHILDREN_PARAM};
use crate::step::{StepContext, StepHandler};
use async_trait::async_trait;
use cadence_common::{ExecutableResponse, ExecutionMode};
use serde_json::Value;

/// Runs a single child node and takes its status.
pub struct SectionStep;

#[async_trait]
impl StepHandler for SectionStep {
    fn step_type(&self) -> &str {
        "section"
    }

    fn supported_modes(&self) -> &[ExecutionMode] {
        &[ExecutionMode::Child]
    }

    async fn execute(
        &self,
        _ctx: &StepContext,
        _mode: ExecutionMode,
        parameters: &Value,
    ) -> Result<ExecutableResponse, StepError> {
        let child = parameters
            .get(CHILD_PARAM)
            .and_then(Value::as_str)
            .ok_or_else(|| StepError::InvalidParameters(format!("'{}' is required", CHILD_PARAM)))?;
        Ok(ExecutableResponse::Child {
            child_node_id: child.to_string(),
        })
    }
}

/// Runs every listed child in parallel; the worst child status wins.
pub struct ForkStep;

#[async_trait]
impl StepHandler for ForkStep {
    fn step_type(&self) -> &str {
        "fork"
    }

    fn supported_modes(&self) -> &[ExecutionMode] {
        &[ExecutionMode::Children]
    }

    async fn execute(
        &self,
        _ctx: &StepContext,
        _mode: ExecutionMode,
        parameters: &Value,
    ) -> Result<ExecutableResponse, StepError> {
        let list = parameters
            .get(CHILDREN_PARAM)
            .and_then(Value::as_array)
            .ok_or_else(|| {
                StepError::InvalidParameters(format!("'{}' must be a list", CHILDREN_PARAM))
            })?;
        let child_node_ids = list
            .iter()
            .map(|v| {
                v.as_str().map(str::to_string).ok_or_else(|| {
                    StepError::InvalidParameters("child ids must be strings".to_string())
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if child_node_ids.is_empty() {
            return Err(StepError::InvalidParameters(format!(
                "'{}' must not be empty",
                CHILDREN_PARAM
            )));
        }
        Ok(ExecutableResponse::Children { child_node_ids })
    }
}
