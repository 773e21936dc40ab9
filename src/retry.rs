//! New attempts for failed node executions.
//!
//! A retry never reopens the failed record. It is marked `old_retry` and
//! linked to a fresh QUEUED execution of the same plan node which carries
//! the attempt chain and the interrupt history forward. The old record is
//! claimed before the new one is written, so two concurrent retries of the
//! same attempt cannot both produce a successor.

use crate::ambiance;
use crate::engine::dispatcher::{DispatchHandle, DispatchUnit};
use crate::errors::{EngineError, RetryError, StoreError};
use crate::store::{ExecutionStore, Mutation, update_with_retry};
use cadence_common::{Ambiance, Interrupt, NodeExecution, PlanNode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct RetryHelper {
    store: Arc<dyn ExecutionStore>,
    dispatch: DispatchHandle,
    max_conflict_retries: u32,
}

/// How the new attempt should run.
#[derive(Debug, Clone, Default)]
pub struct RetryRequest {
    /// Replacement step parameters for the new attempt
    pub parameters: Option<Value>,
    /// Delay before the new attempt is dispatched
    pub wait: Duration,
}

fn retry_error(id: &str, err: EngineError) -> RetryError {
    match err {
        EngineError::Store(e) => RetryError::Store(e),
        EngineError::NodeExecutionNotFound { id } => RetryError::NotFound { id },
        EngineError::Retry(e) => e,
        _ => RetryError::Conflict { id: id.to_string() },
    }
}

impl RetryHelper {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        dispatch: DispatchHandle,
        max_conflict_retries: u32,
    ) -> Self {
        Self {
            store,
            dispatch,
            max_conflict_retries,
        }
    }

    fn check_retryable(ne: &NodeExecution) -> Result<(), RetryError> {
        if let Some(retried_by) = &ne.retried_by {
            return Err(RetryError::AlreadyRetried {
                id: ne.uuid.clone(),
                retried_by: retried_by.clone(),
            });
        }
        if !ne.status.is_terminal() || ne.old_retry {
            return Err(RetryError::NotRetryable {
                id: ne.uuid.clone(),
                status: ne.status,
            });
        }
        Ok(())
    }

    /// Replace `failed_id` with a new attempt of `node` and dispatch it.
    ///
    /// `interrupt` is recorded on the superseded attempt when the retry was
    /// requested through a RETRY interrupt.
    pub async fn retry(
        &self,
        failed_id: &str,
        node: &PlanNode,
        request: RetryRequest,
        interrupt: Option<&Interrupt>,
    ) -> Result<NodeExecution, RetryError> {
        let failed = self
            .store
            .get(failed_id)
            .await?
            .ok_or_else(|| RetryError::NotFound {
                id: failed_id.to_string(),
            })?;
        Self::check_retryable(&failed)?;

        let new_ambiance = ambiance::for_retry(&failed, node);
        let new_id = new_ambiance
            .current_runtime_id()
            .map(str::to_string)
            .unwrap_or_else(cadence_common::generate_id);

        // Claim the failed attempt first.
        let mut refusal: Option<RetryError> = None;
        let outcome = update_with_retry(
            self.store.as_ref(),
            failed_id,
            self.max_conflict_retries,
            |current| {
                if let Err(e) = Self::check_retryable(current) {
                    refusal = Some(e);
                    return None;
                }
                refusal = None;
                let new_id = new_id.clone();
                let effect = interrupt.map(|i| (i.uuid.clone(), i.interrupt_type, i.created_by.clone()));
                let mutation: Mutation = Box::new(move |ne: &mut NodeExecution| {
                    if let Some((interrupt_id, kind, principal)) = effect {
                        let status = ne.status;
                        ne.record_interrupt(&interrupt_id, kind, &principal, status);
                    }
                    ne.old_retry = true;
                    ne.retried_by = Some(new_id);
                    ne.last_updated_at = chrono::Utc::now();
                });
                Some(mutation)
            },
        )
        .await
        .map_err(|e| retry_error(failed_id, e))?;

        if !outcome.is_applied() {
            return Err(refusal.unwrap_or_else(|| RetryError::NotRetryable {
                id: failed_id.to_string(),
                status: outcome.node_execution().status,
            }));
        }
        let old = outcome.into_node_execution();
        let attempt = Self::next_attempt(&old, &new_id, new_ambiance, request.parameters);
        self.store_and_dispatch(&old, attempt, request.wait).await
    }

    /// Write the attempt a claimed execution points at when it is missing.
    ///
    /// `old` must already carry `retried_by`. Another worker writing the same
    /// attempt first is not an error.
    pub async fn restore(
        &self,
        old: &NodeExecution,
        node: &PlanNode,
        request: RetryRequest,
    ) -> Result<Option<NodeExecution>, RetryError> {
        let Some(new_id) = old.retried_by.as_deref() else {
            return Err(RetryError::NotRetryable {
                id: old.uuid.clone(),
                status: old.status,
            });
        };
        if self.store.get(new_id).await?.is_some() {
            return Ok(None);
        }
        let new_ambiance = ambiance::with_runtime_id(ambiance::for_retry(old, node), new_id);
        let attempt = Self::next_attempt(old, new_id, new_ambiance, request.parameters);
        match self.store_and_dispatch(old, attempt, request.wait).await {
            Ok(attempt) => Ok(Some(attempt)),
            Err(RetryError::AttemptNotStored {
                source: StoreError::Duplicate { .. },
                ..
            }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn next_attempt(
        old: &NodeExecution,
        new_id: &str,
        new_ambiance: Ambiance,
        parameters: Option<Value>,
    ) -> NodeExecution {
        let mut attempt = NodeExecution::queued(&old.plan_execution_id, &old.node_id, new_ambiance);
        attempt.uuid = new_id.to_string();
        attempt.parameter_override = parameters.or_else(|| old.parameter_override.clone());
        attempt.retry_ids = std::iter::once(old.uuid.clone())
            .chain(old.retry_ids.iter().cloned())
            .collect();
        attempt.interrupt_history = old.interrupt_history.clone();
        attempt.parent_id = old.parent_id.clone();
        attempt.notify_id = old.notify_id.clone();
        attempt.previous_id = old.previous_id.clone();
        attempt.next_id = old.next_id.clone();
        attempt
    }

    async fn store_and_dispatch(
        &self,
        old: &NodeExecution,
        attempt: NodeExecution,
        wait: Duration,
    ) -> Result<NodeExecution, RetryError> {
        let id = attempt.uuid.clone();
        let attempt = self
            .store
            .save(attempt)
            .await
            .map_err(|source| RetryError::AttemptNotStored { id, source })?;

        self.relink(&old.uuid, &attempt).await?;

        tracing::info!(
            plan_execution_id = %attempt.plan_execution_id,
            node_id = %attempt.node_id,
            old = %old.uuid,
            new = %attempt.uuid,
            attempt = attempt.attempt(),
            "Retrying node execution"
        );

        self.dispatch
            .submit_after(
                DispatchUnit::Start {
                    node_execution_id: attempt.uuid.clone(),
                },
                wait,
            )
            .map_err(|_| RetryError::DispatcherClosed)?;
        Ok(attempt)
    }

    /// Point neighbours that referenced `old_id` at the new attempt.
    async fn relink(&self, old_id: &str, attempt: &NodeExecution) -> Result<(), RetryError> {
        if let Some(previous) = &attempt.previous_id {
            let new_id = attempt.uuid.clone();
            update_with_retry(self.store.as_ref(), previous, self.max_conflict_retries, |ne| {
                if ne.next_id.as_deref() != Some(old_id) {
                    return None;
                }
                let new_id = new_id.clone();
                let mutation: Mutation = Box::new(move |ne: &mut NodeExecution| {
                    ne.next_id = Some(new_id);
                });
                Some(mutation)
            })
            .await
            .map_err(|e| retry_error(previous, e))?;
        }
        if let Some(next) = &attempt.next_id {
            let new_id = attempt.uuid.clone();
            update_with_retry(self.store.as_ref(), next, self.max_conflict_retries, |ne| {
                if ne.previous_id.as_deref() != Some(old_id) {
                    return None;
                }
                let new_id = new_id.clone();
                let mutation: Mutation = Box::new(move |ne: &mut NodeExecution| {
                    ne.previous_id = Some(new_id);
                });
                Some(mutation)
            })
            .await
            .map_err(|e| retry_error(next, e))?;
        }
        Ok(())
    }
}
