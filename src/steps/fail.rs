use super::u64_param;
use crate::errors::StepError;
use crate::step::{StepContext, StepHandler};
use async_trait::async_trait;
use cadence_common::{ExecutableResponse, ExecutionMode, StepResponse};
use serde_json::Value;

/// Reports FAILED with `message`.
///
/// With `fail_attempts: n` only the first `n` attempts fail and later ones
/// succeed, which makes retry behavior easy to exercise.
pub struct FailStep;

#[async_trait]
impl StepHandler for FailStep {
    fn step_type(&self) -> &str {
        "fail"
    }

    fn supported_modes(&self) -> &[ExecutionMode] {
        &[ExecutionMode::Sync]
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        _mode: ExecutionMode,
        parameters: &Value,
    ) -> Result<ExecutableResponse, StepError> {
        let fail_attempts = u64_param(parameters, "fail_attempts", u64::MAX)?;
        let response = if u64::from(ctx.attempt) <= fail_attempts {
            let message = parameters
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Step failed");
            tracing::debug!(node = %ctx.node.uuid, attempt = ctx.attempt, "failing on purpose");
            StepResponse::failed(message)
        } else {
            StepResponse::succeeded()
        };
        Ok(ExecutableResponse::Sync { response })
    }
}
