//! A step that hands its work to someone else and waits for callbacks.
//!
//! Parameters:
//! - `callbacks`: callbacks per round (default 1)
//! - `links`: rounds for TASK_CHAIN (default 1)
//! - `delay_ms`: delay before each self-issued completion (default 10)
//! - `auto_complete`: deliver the completions itself (default true); when
//!   false the callbacks must arrive through `Orchestrator::notify`
//! - `fail`: a message; completions then report FAILED with it

use super::{bool_param, u64_param};
use crate::errors::StepError;
use crate::step::{StepContext, StepHandler, reduce_callback_payloads};
use async_trait::async_trait;
use cadence_common::{ExecutableResponse, ExecutionMode};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::time::Duration;

pub struct DelegateStep;

impl DelegateStep {
    fn issue(
        &self,
        ctx: &StepContext,
        parameters: &Value,
        link: u64,
    ) -> Result<Vec<String>, StepError> {
        let count = u64_param(parameters, "callbacks", 1)?;
        if count == 0 {
            return Err(StepError::InvalidParameters(
                "'callbacks' must be at least 1".to_string(),
            ));
        }
        let ids: Vec<String> = (0..count)
            .map(|i| format!("{}-l{}-cb{}", ctx.node_execution_id, link, i))
            .collect();

        if bool_param(parameters, "auto_complete", true)? {
            let delay = Duration::from_millis(u64_param(parameters, "delay_ms", 10)?);
            let payload = match parameters.get("fail").and_then(Value::as_str) {
                Some(message) => json!({"status": "FAILED", "message": message}),
                None => json!({"status": "SUCCEEDED"}),
            };
            for id in &ids {
                ctx.completions
                    .complete_after(&ctx.node_execution_id, id, payload.clone(), delay)
                    .map_err(|e| StepError::Other(e.into()))?;
            }
        }
        tracing::debug!(
            node = %ctx.node.uuid,
            link,
            callbacks = ids.len(),
            "delegated work issued"
        );
        Ok(ids)
    }
}

#[async_trait]
impl StepHandler for DelegateStep {
    fn step_type(&self) -> &str {
        "delegate"
    }

    fn supported_modes(&self) -> &[ExecutionMode] {
        &[ExecutionMode::Async, ExecutionMode::Task, ExecutionMode::TaskChain]
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        mode: ExecutionMode,
        parameters: &Value,
    ) -> Result<ExecutableResponse, StepError> {
        match mode {
            ExecutionMode::Async => Ok(ExecutableResponse::Async {
                callback_ids: self.issue(ctx, parameters, 0)?,
            }),
            ExecutionMode::Task => Ok(ExecutableResponse::Task {
                callback_ids: self.issue(ctx, parameters, 0)?,
            }),
            ExecutionMode::TaskChain => {
                let links = u64_param(parameters, "links", 1)?.max(1);
                Ok(ExecutableResponse::TaskChain {
                    callback_ids: self.issue(ctx, parameters, 0)?,
                    chain_end: links == 1,
                })
            }
            other => Err(StepError::UnsupportedMode {
                mode: other.to_string(),
            }),
        }
    }

    async fn next_link(
        &self,
        ctx: &StepContext,
        parameters: &Value,
        completed_links: usize,
        responses: &BTreeMap<String, Value>,
    ) -> Result<ExecutableResponse, StepError> {
        // A broken link ends the chain; the collected payloads carry the failure.
        if reduce_callback_payloads(responses).status.is_broken() {
            return Ok(ExecutableResponse::TaskChain {
                callback_ids: Vec::new(),
                chain_end: true,
            });
        }
        let links = u64_param(parameters, "links", 1)?.max(1);
        let link = completed_links as u64;
        Ok(ExecutableResponse::TaskChain {
            callback_ids: self.issue(ctx, parameters, link)?,
            chain_end: link + 1 >= links,
        })
    }

    async fn handle_abort(
        &self,
        ctx: &StepContext,
        response: Option<&ExecutableResponse>,
    ) -> Result<(), StepError> {
        let outstanding = response.map(|r| r.callback_ids().len()).unwrap_or(0);
        tracing::info!(
            node_execution = %ctx.node_execution_id,
            outstanding,
            "abandoning delegated work"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::dispatcher::DispatchUnit;
    use crate::steps::test_support::context;
    use cadence_common::PlanNode;

    #[tokio::test]
    async fn test_async_issues_and_completes_callbacks() {
        let (ctx, mut queue) = context(PlanNode::new("d", "delegate"), 1);
        let response = DelegateStep
            .execute(
                &ctx,
                ExecutionMode::Async,
                &json!({"callbacks": 2, "delay_ms": 0}),
            )
            .await
            .unwrap();
        assert_eq!(response.callback_ids(), &["ne-l0-cb0".to_string(), "ne-l0-cb1".to_string()]);

        let mut seen = Vec::new();
        for _ in 0..2 {
            let envelope = queue.recv().await.unwrap();
            match envelope.unit {
                DispatchUnit::Resume { callback_id, payload, .. } => {
                    assert_eq!(payload["status"], "SUCCEEDED");
                    seen.push(callback_id);
                }
                other => panic!("unexpected unit {:?}", other),
            }
        }
        seen.sort();
        assert_eq!(seen, vec!["ne-l0-cb0", "ne-l0-cb1"]);
    }

    #[tokio::test]
    async fn test_manual_completion_sends_nothing() {
        let (ctx, mut queue) = context(PlanNode::new("d", "delegate"), 1);
        DelegateStep
            .execute(&ctx, ExecutionMode::Task, &json!({"auto_complete": false}))
            .await
            .unwrap();
        assert!(queue.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_chain_links() {
        let (ctx, _queue) = context(PlanNode::new("d", "delegate"), 1);
        let params = json!({"links": 2, "auto_complete": false});
        let first = DelegateStep
            .execute(&ctx, ExecutionMode::TaskChain, &params)
            .await
            .unwrap();
        assert!(matches!(first, ExecutableResponse::TaskChain { chain_end: false, .. }));

        let done = BTreeMap::from([("ne-l0-cb0".to_string(), json!({"status": "SUCCEEDED"}))]);
        let second = DelegateStep.next_link(&ctx, &params, 1, &done).await.unwrap();
        match second {
            ExecutableResponse::TaskChain { callback_ids, chain_end } => {
                assert!(chain_end);
                assert_eq!(callback_ids, vec!["ne-l1-cb0".to_string()]);
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_broken_link_ends_chain() {
        let (ctx, _queue) = context(PlanNode::new("d", "delegate"), 1);
        let failed = BTreeMap::from([("x".to_string(), json!({"status": "FAILED"}))]);
        let next = DelegateStep
            .next_link(&ctx, &json!({"links": 3}), 1, &failed)
            .await
            .unwrap();
        assert_eq!(
            next,
            ExecutableResponse::TaskChain {
                callback_ids: Vec::new(),
                chain_end: true
            }
        );
    }

    #[tokio::test]
    async fn test_sync_is_unsupported() {
        let (ctx, _queue) = context(PlanNode::new("d", "delegate"), 1);
        let err = DelegateStep
            .execute(&ctx, ExecutionMode::Sync, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::UnsupportedMode { .. }));
    }
}
