use crate::errors::StepError;
use crate::step::{StepContext, StepHandler};
use async_trait::async_trait;
use cadence_common::{ExecutableResponse, ExecutionMode, StepResponse};
use serde_json::Value;

/// Succeeds immediately. Entries of the `outcomes` object become outcomes.
pub struct NoopStep;

#[async_trait]
impl StepHandler for NoopStep {
    fn step_type(&self) -> &str {
        "noop"
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
        let mut response = StepResponse::succeeded();
        match parameters.get("outcomes") {
            None | Some(Value::Null) => {}
            Some(Value::Object(map)) => {
                for (name, value) in map {
                    response = response.with_outcome(name.clone(), value.clone());
                }
            }
            Some(_) => {
                return Err(StepError::InvalidParameters(
                    "'outcomes' must be an object".to_string(),
                ));
            }
        }
        tracing::debug!(node = %ctx.node.uuid, "noop step done");
        Ok(ExecutableResponse::Sync { response })
    }
}
