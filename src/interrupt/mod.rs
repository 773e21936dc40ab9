//! Interrupt manager: external control signals aimed at a node or a whole
//! plan execution.
//!
//! Every interrupt is written to the execution store before it is applied,
//! so the log outlives the manager and needs no pruning. Applying it to a node
//! that is missing or already terminal is not an error; the caller gets an
//! [`InterruptOutcome::NoOp`] explaining why nothing changed.

mod handlers;

use crate::engine::{OrchestrationEngine, OrchestrationEvent};
use crate::errors::InterruptError;
use cadence_common::{Interrupt, InterruptPackage, Principal};
use serde::Serialize;
use std::sync::Arc;

/// What registering an interrupt changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InterruptOutcome {
    /// The interrupt took effect on these node executions.
    Applied { node_execution_ids: Vec<String> },
    NoOp { reason: String },
}

impl InterruptOutcome {
    pub fn applied(node_execution_ids: Vec<String>) -> Self {
        if node_execution_ids.is_empty() {
            return Self::no_op("no node execution was in a state the interrupt applies to");
        }
        Self::Applied { node_execution_ids }
    }

    pub fn no_op(reason: impl Into<String>) -> Self {
        Self::NoOp {
            reason: reason.into(),
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InterruptReceipt {
    pub interrupt: Interrupt,
    pub outcome: InterruptOutcome,
}

pub struct InterruptManager {
    engine: Arc<OrchestrationEngine>,
}

impl InterruptManager {
    pub fn new(engine: Arc<OrchestrationEngine>) -> Self {
        Self { engine }
    }

    /// Record `package` as an interrupt issued by `principal` and apply it.
    pub async fn register(
        &self,
        principal: Principal,
        package: InterruptPackage,
    ) -> Result<InterruptReceipt, InterruptError> {
        let kind = package.interrupt_type;
        if kind.requires_node() && package.node_execution_id.is_none() {
            return Err(InterruptError::MissingNodeExecutionId {
                kind: kind.to_string(),
            });
        }
        let plan_execution = self
            .engine
            .store()
            .get_plan_execution(&package.plan_execution_id)
            .await?
            .ok_or_else(|| InterruptError::PlanExecutionNotFound {
                id: package.plan_execution_id.clone(),
            })?;

        let interrupt = self
            .engine
            .store()
            .save_interrupt(Interrupt::from_package(package, principal))
            .await?;

        let outcome = handlers::apply(&self.engine, &interrupt, &plan_execution).await?;
        match &outcome {
            InterruptOutcome::Applied { node_execution_ids } => tracing::info!(
                plan_execution_id = %interrupt.plan_execution_id,
                interrupt_id = %interrupt.uuid,
                interrupt_type = %kind,
                principal = %interrupt.created_by.id,
                nodes = node_execution_ids.len(),
                "Interrupt applied"
            ),
            InterruptOutcome::NoOp { reason } => tracing::info!(
                plan_execution_id = %interrupt.plan_execution_id,
                interrupt_id = %interrupt.uuid,
                interrupt_type = %kind,
                principal = %interrupt.created_by.id,
                reason = %reason,
                "Interrupt had no effect"
            ),
        }

        self.engine
            .events()
            .publish(OrchestrationEvent::InterruptRegistered {
                plan_execution_id: interrupt.plan_execution_id.clone(),
                interrupt_id: interrupt.uuid.clone(),
                interrupt_type: kind,
                node_execution_id: interrupt.node_execution_id.clone(),
                applied: outcome.is_applied(),
            });
        Ok(InterruptReceipt { interrupt, outcome })
    }

    /// Interrupts registered against a plan execution, oldest first.
    pub async fn interrupts_for(
        &self,
        plan_execution_id: &str,
    ) -> Result<Vec<Interrupt>, InterruptError> {
        Ok(self
            .engine
            .store()
            .find_interrupts(plan_execution_id)
            .await?)
    }
}
