//! Node lifecycle: start, wait, resume, complete and advise.
//!
//! Each handler reads the node execution, decides inside a conditional
//! update what to change, and only acts on side effects (dispatching the
//! next unit, calling a step handler) once that update has landed. A worker
//! whose update lost the race re-reads and decides again, so duplicate or
//! late units fall through as no-ops.

use super::OrchestrationEngine;
use super::dispatcher::{DispatchTarget, DispatchUnit};
use super::events::OrchestrationEvent;
use crate::adviser::AdviserChain;
use crate::ambiance;
use crate::errors::{EngineError, PlanError, RetryError, StoreError};
use crate::expression::ResolutionContext;
use crate::retry::RetryRequest;
use crate::step::{CompletionHandle, StepContext, StepHandler};
use crate::store::{Mutation, UpdateOutcome, update_with_retry};
use async_trait::async_trait;
use cadence_common::{
    Advise, AdviseRecord, ExecutableResponse, ExecutionMode, FailureInfo, FailureKind,
    NodeExecution, Plan, PlanExecution, PlanNode, Principal, Status, StepResponse, generate_id,
    parse_timeout,
};
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// What a worker does once its conditional update is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FollowUp {
    Nothing,
    Advise,
    Collect,
    Abort,
}

impl OrchestrationEngine {
    /// Persist a new plan execution and trigger its root node.
    pub async fn start_plan(
        &self,
        principal: Principal,
        plan: Plan,
        setup_abstractions: BTreeMap<String, String>,
    ) -> Result<PlanExecution, EngineError> {
        crate::plan::validate(&plan)?;
        let root = plan.root().cloned().ok_or_else(|| PlanError::MissingRoot {
            root: plan.root_node_id.clone(),
        })?;

        let plan_execution = PlanExecution::new(generate_id(), plan, setup_abstractions, principal);
        let plan_execution = self.store.save_plan_execution(plan_execution).await?;
        let plan = Arc::new(plan_execution.plan.clone());
        self.plans
            .insert(plan_execution.uuid.clone(), plan.clone());

        let base = ambiance::initial(
            &plan_execution.uuid,
            &plan.uuid,
            plan_execution.setup_abstractions.clone(),
        );
        let root_execution = NodeExecution::queued(
            &plan_execution.uuid,
            &root.uuid,
            ambiance::for_child(&base, &root),
        );
        let root_execution = self.store.save(root_execution).await?;

        tracing::info!(
            plan_execution_id = %plan_execution.uuid,
            plan = %plan.uuid,
            root = %root.uuid,
            triggered_by = %plan_execution.triggered_by.id,
            "Plan execution started"
        );
        self.dispatch.submit(DispatchUnit::Start {
            node_execution_id: root_execution.uuid,
        })?;
        Ok(plan_execution)
    }

    /// Record one callback for a waiting node execution.
    ///
    /// Unknown, already consumed and late callbacks are ignored. A callback
    /// that arrives before the wait was recorded is kept and counted once the
    /// wait is recorded.
    pub async fn resume_node(
        &self,
        id: &str,
        callback_id: &str,
        payload: Value,
    ) -> Result<(), EngineError> {
        let mut follow_up = FollowUp::Nothing;
        let outcome = self
            .update(id, |current| {
                follow_up = FollowUp::Nothing;
                if current.status.is_terminal() {
                    return None;
                }
                let callback = callback_id.to_string();
                let payload = payload.clone();

                if current.waiting_on.contains(callback_id) {
                    if current.status == Status::Aborting {
                        follow_up = FollowUp::Abort;
                    } else if current.status.is_callback_waiting() && current.waiting_on.len() == 1 {
                        follow_up = FollowUp::Collect;
                    }
                    let mutation: Mutation = Box::new(move |ne: &mut NodeExecution| {
                        ne.waiting_on.remove(&callback);
                        ne.callback_responses.insert(callback, payload);
                    });
                    return Some(mutation);
                }

                let early = matches!(
                    current.status,
                    Status::Queued | Status::Running | Status::Paused
                ) && !current.callback_responses.contains_key(callback_id);
                if early {
                    let mutation: Mutation = Box::new(move |ne: &mut NodeExecution| {
                        ne.callback_responses.insert(callback, payload);
                    });
                    return Some(mutation);
                }
                if current.status == Status::Aborting {
                    follow_up = FollowUp::Abort;
                }
                None
            })
            .await?;

        if outcome.is_applied() {
            tracing::debug!(node_execution_id = %id, callback_id, "Callback recorded");
        } else {
            tracing::debug!(node_execution_id = %id, callback_id, "Duplicate or late callback ignored");
        }
        self.follow_up(id, follow_up).await
    }

    /// Resume whichever node execution issued `callback_id`.
    pub async fn notify(&self, callback_id: &str, payload: Value) -> Result<(), EngineError> {
        match self.store.find_by_callback_id(callback_id).await? {
            Some(ne) => self.resume_node(&ne.uuid, callback_id, payload).await,
            None => {
                tracing::warn!(callback_id, "No node execution issued this callback");
                Ok(())
            }
        }
    }

    pub(crate) async fn load(&self, id: &str) -> Result<NodeExecution, EngineError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| EngineError::NodeExecutionNotFound { id: id.to_string() })
    }

    pub(crate) async fn plan_execution(&self, id: &str) -> Result<PlanExecution, EngineError> {
        self.store
            .get_plan_execution(id)
            .await?
            .ok_or_else(|| EngineError::PlanExecutionNotFound { id: id.to_string() })
    }

    pub(crate) async fn plan_for(&self, plan_execution_id: &str) -> Result<Arc<Plan>, EngineError> {
        if let Some(plan) = self.plans.get(plan_execution_id) {
            return Ok(Arc::clone(plan.value()));
        }
        let plan = Arc::new(self.plan_execution(plan_execution_id).await?.plan);
        self.plans
            .insert(plan_execution_id.to_string(), plan.clone());
        Ok(plan)
    }

    /// The plan node `ne` executes, with its retry parameter override applied.
    pub(crate) async fn plan_node(
        &self,
        ne: &NodeExecution,
    ) -> Result<(Arc<Plan>, PlanNode), EngineError> {
        let plan = self.plan_for(&ne.plan_execution_id).await?;
        let node = plan.node(&ne.node_id).ok_or_else(|| {
            EngineError::configuration(ne.node_id.clone(), "node is not defined in the plan")
        })?;
        let node = match &ne.parameter_override {
            Some(parameters) => node.clone_with_parameters(parameters.clone()),
            None => node.clone(),
        };
        Ok((plan, node))
    }

    pub(crate) fn step_context(&self, ne: &NodeExecution, node: PlanNode) -> StepContext {
        StepContext {
            plan_execution_id: ne.plan_execution_id.clone(),
            node_execution_id: ne.uuid.clone(),
            node,
            ambiance: ne.ambiance.clone(),
            attempt: ne.attempt(),
            completions: CompletionHandle::new(self.dispatch.clone()),
        }
    }

    fn handler_for(&self, node: &PlanNode) -> Result<Arc<dyn StepHandler>, EngineError> {
        self.steps
            .get(&node.step_type)
            .ok_or_else(|| EngineError::StepHandlerMissing {
                step_type: node.step_type.clone(),
            })
    }

    fn timeout_for(&self, node: &PlanNode) -> Result<Option<Duration>, EngineError> {
        match &node.timeout {
            Some(timeout) => parse_timeout(&timeout.duration).map(Some).map_err(|e| {
                EngineError::configuration(node.uuid.clone(), format!("invalid timeout: {}", e))
            }),
            None => Ok(self.config.default_timeout),
        }
    }

    async fn resolution_context(&self, ne: &NodeExecution) -> Result<ResolutionContext, EngineError> {
        let executions = self
            .store
            .find_by_plan_execution(&ne.plan_execution_id, None)
            .await?;
        Ok(ResolutionContext::new(ne, &executions))
    }

    /// Conditional update that also reports status transitions.
    pub(crate) async fn update<F>(&self, id: &str, mut compute: F) -> Result<UpdateOutcome, EngineError>
    where
        F: FnMut(&NodeExecution) -> Option<Mutation> + Send,
    {
        let mut from = None;
        let outcome = update_with_retry(
            self.store.as_ref(),
            id,
            self.config.max_conflict_retries,
            |current| {
                from = Some(current.status);
                compute(current)
            },
        )
        .await?;

        let changed = match (&outcome, from) {
            (UpdateOutcome::Applied(ne), Some(from)) if ne.status != from => Some((ne, from)),
            _ => None,
        };
        if let Some((ne, from)) = changed {
            tracing::debug!(
                plan_execution_id = %ne.plan_execution_id,
                node_execution_id = %ne.uuid,
                node = %ne.node_id,
                %from,
                to = %ne.status,
                "Node status changed"
            );
            self.events.publish(OrchestrationEvent::NodeStatusChanged {
                plan_execution_id: ne.plan_execution_id.clone(),
                node_execution_id: ne.uuid.clone(),
                node_id: ne.node_id.clone(),
                from,
                to: ne.status,
            });
        }
        Ok(outcome)
    }

    async fn follow_up(&self, id: &str, follow_up: FollowUp) -> Result<(), EngineError> {
        match follow_up {
            FollowUp::Nothing => Ok(()),
            FollowUp::Advise => self.end_transition(id).await,
            FollowUp::Collect => self.dispatch.submit(DispatchUnit::Complete {
                node_execution_id: id.to_string(),
            }),
            FollowUp::Abort => self.finalize(id, Status::Aborted).await,
        }
    }

    async fn handle_start(&self, id: &str) -> Result<(), EngineError> {
        let ne = self.load(id).await?;
        match ne.status {
            Status::Queued => {}
            Status::Aborting => return self.finalize(id, Status::Aborted).await,
            status => {
                tracing::debug!(node_execution_id = %id, %status, "Start ignored");
                return Ok(());
            }
        }
        if self.plan_execution(&ne.plan_execution_id).await?.is_finished() {
            return self.finalize(id, Status::Aborted).await;
        }
        self.start_node(ne).await
    }

    async fn start_node(&self, ne: NodeExecution) -> Result<(), EngineError> {
        let (_, node) = self.plan_node(&ne).await?;
        let resolution = self.resolution_context(&ne).await?;

        if let Some(condition) = &node.skip_condition {
            match self.resolver.evaluate_condition(&resolution, condition) {
                Ok(true) => {
                    tracing::info!(node_execution_id = %ne.uuid, node = %node.uuid, "Skip condition met");
                    return self
                        .conclude_queued(&ne.uuid, StepResponse::with_status(Status::Skipped))
                        .await;
                }
                Ok(false) => {}
                Err(e) => {
                    return self
                        .conclude_queued(&ne.uuid, StepResponse::failed(e.to_string()))
                        .await;
                }
            }
        }

        let parameters = match self.resolver.resolve(&resolution, &node.step_parameters) {
            Ok(parameters) => parameters,
            Err(e) => {
                return self
                    .conclude_queued(&ne.uuid, StepResponse::failed(e.to_string()))
                    .await;
            }
        };
        let handler = self.handler_for(&node)?;
        let mode = self
            .facilitators
            .select(&node, handler.as_ref(), &ne.ambiance)?;
        let timeout = self.timeout_for(&node)?;
        let timeout_instance_id = timeout.map(|_| generate_id());

        let outcome = self
            .update(&ne.uuid, |current| {
                if current.status != Status::Queued {
                    return None;
                }
                let parameters = parameters.clone();
                let timeout_instance_id = timeout_instance_id.clone();
                let mutation: Mutation = Box::new(move |ne: &mut NodeExecution| {
                    ne.mode = Some(mode);
                    ne.resolved_step_parameters = Some(parameters);
                    ne.timeout_instance_id = timeout_instance_id;
                    ne.set_status(Status::Running);
                });
                Some(mutation)
            })
            .await?;
        let UpdateOutcome::Applied(ne) = outcome else {
            tracing::debug!(node_execution_id = %ne.uuid, "Node left QUEUED before it started");
            return Ok(());
        };

        if let (Some(after), Some(instance)) = (timeout, ne.timeout_instance_id.as_deref()) {
            self.timeouts
                .register(instance, &ne.uuid, &ne.plan_execution_id, after);
        }

        tracing::info!(
            plan_execution_id = %ne.plan_execution_id,
            node_execution_id = %ne.uuid,
            node = %node.uuid,
            step_type = %node.step_type,
            %mode,
            attempt = ne.attempt(),
            "Running node"
        );
        let ctx = self.step_context(&ne, node);
        let response = match handler.execute(&ctx, mode, &parameters).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(node_execution_id = %ne.uuid, error = %e, "Step execution failed");
                return self.complete_sync(&ne.uuid, StepResponse::failed(e.to_string())).await;
            }
        };

        if response.mode() != mode {
            return Err(EngineError::configuration(
                ctx.node.uuid.clone(),
                format!(
                    "step '{}' answered with a {} response in {} mode",
                    ctx.node.step_type,
                    response.mode(),
                    mode
                ),
            ));
        }

        match response {
            ExecutableResponse::Sync { response } => {
                if !response.status.is_terminal() {
                    return Err(EngineError::configuration(
                        ctx.node.uuid.clone(),
                        format!("synchronous step reported non-terminal status {}", response.status),
                    ));
                }
                self.complete_sync(&ne.uuid, response).await
            }
            ExecutableResponse::Child { .. } | ExecutableResponse::Children { .. } => {
                self.spawn_children(&ne, response).await
            }
            _ => {
                self.record_wait(&ne.uuid, response, ne.executable_responses.len())
                    .await
            }
        }
    }

    /// Conclude a node that never ran (skipped, or its inputs did not resolve).
    async fn conclude_queued(&self, id: &str, response: StepResponse) -> Result<(), EngineError> {
        let outcome = self
            .update(id, |current| {
                if current.status != Status::Queued {
                    return None;
                }
                let response = response.clone();
                let mutation: Mutation = Box::new(move |ne: &mut NodeExecution| ne.conclude(&response));
                Some(mutation)
            })
            .await?;
        if outcome.is_applied() {
            self.end_transition(id).await
        } else {
            Ok(())
        }
    }

    async fn complete_sync(&self, id: &str, response: StepResponse) -> Result<(), EngineError> {
        let mut follow_up = FollowUp::Nothing;
        self.update(id, |current| {
            follow_up = FollowUp::Nothing;
            let response = response.clone();
            let mutation: Mutation = match current.status {
                Status::Running => {
                    follow_up = FollowUp::Advise;
                    Box::new(move |ne: &mut NodeExecution| {
                        ne.executable_responses.push(ExecutableResponse::Sync {
                            response: response.clone(),
                        });
                        ne.conclude(&response);
                    })
                }
                // Keep the result until a RESUME lets the node finish.
                Status::Paused => Box::new(move |ne: &mut NodeExecution| {
                    ne.executable_responses.push(ExecutableResponse::Sync {
                        response: response.clone(),
                    });
                    ne.parked_response = Some(response);
                }),
                Status::Aborting => {
                    follow_up = FollowUp::Abort;
                    return None;
                }
                _ => return None,
            };
            Some(mutation)
        })
        .await?;
        self.follow_up(id, follow_up).await
    }

    /// Park a node on the callbacks of `response`.
    ///
    /// `expected_responses` guards against two workers recording the same
    /// wait (or the same chain link) twice.
    async fn record_wait(
        &self,
        id: &str,
        response: ExecutableResponse,
        expected_responses: usize,
    ) -> Result<(), EngineError> {
        let Some(waiting) = response.mode().waiting_status() else {
            return Ok(());
        };
        let callback_ids = response.callback_ids().to_vec();
        let mut follow_up = FollowUp::Nothing;

        self.update(id, |current| {
            follow_up = FollowUp::Nothing;
            if current.executable_responses.len() != expected_responses {
                return None;
            }
            let paused = match current.status {
                Status::Running => false,
                status if status == waiting => false,
                Status::Paused => true,
                Status::Aborting => {
                    follow_up = FollowUp::Abort;
                    return None;
                }
                _ => return None,
            };
            let outstanding: BTreeSet<String> = callback_ids
                .iter()
                .filter(|c| !current.callback_responses.contains_key(*c))
                .cloned()
                .collect();
            if outstanding.is_empty() && !paused {
                follow_up = FollowUp::Collect;
            }
            let response = response.clone();
            let mutation: Mutation = Box::new(move |ne: &mut NodeExecution| {
                ne.executable_responses.push(response);
                ne.waiting_on = outstanding;
                if paused {
                    ne.prior_status = Some(waiting);
                } else {
                    ne.set_status(waiting);
                }
            });
            Some(mutation)
        })
        .await?;

        tracing::debug!(
            node_execution_id = %id,
            callbacks = callback_ids.len(),
            "Waiting on callbacks"
        );
        self.follow_up(id, follow_up).await
    }

    /// Continue a node whose remaining work can proceed without new input:
    /// a parked result after RESUME, or a callback wait that has emptied.
    async fn handle_complete(&self, id: &str) -> Result<(), EngineError> {
        let ne = self.load(id).await?;
        let resumable = ne.status == Status::Running || ne.status.is_callback_waiting();

        if resumable && ne.parked_response.is_some() {
            let mut concluded = false;
            self.update(id, |current| {
                concluded = false;
                if current.status != Status::Running && !current.status.is_callback_waiting() {
                    return None;
                }
                let parked = current.parked_response.clone()?;
                concluded = true;
                let mutation: Mutation = Box::new(move |ne: &mut NodeExecution| ne.conclude(&parked));
                Some(mutation)
            })
            .await?;
            return if concluded {
                self.end_transition(id).await
            } else {
                Ok(())
            };
        }

        match ne.status {
            status if status.is_callback_waiting() && ne.waiting_on.is_empty() => {
                let outcome = self
                    .update(id, |current| {
                        if !current.status.is_callback_waiting() || !current.waiting_on.is_empty() {
                            return None;
                        }
                        let mutation: Mutation =
                            Box::new(|ne: &mut NodeExecution| ne.set_status(Status::Running));
                        Some(mutation)
                    })
                    .await?;
                match outcome {
                    UpdateOutcome::Applied(ne) => self.collect(ne).await,
                    UpdateOutcome::Skipped(_) => Ok(()),
                }
            }
            Status::Aborting => self.finalize(id, Status::Aborted).await,
            _ => Ok(()),
        }
    }

    /// All callbacks are in: issue the next chain link or settle the status.
    ///
    /// The node is RUNNING again while its handler looks at the results.
    async fn collect(&self, ne: NodeExecution) -> Result<(), EngineError> {
        let (_, node) = self.plan_node(&ne).await?;
        let handler = self.handler_for(&node)?;
        let parameters = ne.resolved_step_parameters.clone().unwrap_or(Value::Null);
        let ctx = self.step_context(&ne, node);

        if let Some(ExecutableResponse::TaskChain {
            chain_end: false, ..
        }) = ne.latest_response()
        {
            let completed = ne
                .executable_responses
                .iter()
                .filter(|r| r.mode() == ExecutionMode::TaskChain)
                .count();
            return match handler
                .next_link(&ctx, &parameters, completed, &ne.callback_responses)
                .await
            {
                Ok(next) if next.mode() == ExecutionMode::TaskChain => {
                    self.record_wait(&ne.uuid, next, ne.executable_responses.len())
                        .await
                }
                Ok(next) => Err(EngineError::configuration(
                    ctx.node.uuid.clone(),
                    format!("task chain link answered with a {} response", next.mode()),
                )),
                Err(e) => {
                    self.conclude_waiting(&ne.uuid, StepResponse::failed(e.to_string()))
                        .await
                }
            };
        }

        let response = match handler
            .handle_result(&ctx, &parameters, &ne.callback_responses)
            .await
        {
            Ok(response) if response.status.is_terminal() => response,
            Ok(response) => {
                return Err(EngineError::configuration(
                    ctx.node.uuid.clone(),
                    format!("step result has non-terminal status {}", response.status),
                ));
            }
            Err(e) => StepResponse::failed(e.to_string()),
        };
        self.conclude_waiting(&ne.uuid, response).await
    }

    async fn conclude_waiting(&self, id: &str, response: StepResponse) -> Result<(), EngineError> {
        let mut follow_up = FollowUp::Nothing;
        self.update(id, |current| {
            follow_up = FollowUp::Nothing;
            if !current.waiting_on.is_empty() {
                return None;
            }
            let response = response.clone();
            let mutation: Mutation = match current.status {
                Status::Running => {
                    follow_up = FollowUp::Advise;
                    Box::new(move |ne: &mut NodeExecution| ne.conclude(&response))
                }
                Status::Paused => {
                    Box::new(move |ne: &mut NodeExecution| ne.parked_response = Some(response))
                }
                Status::Aborting => {
                    follow_up = FollowUp::Abort;
                    return None;
                }
                _ => return None,
            };
            Some(mutation)
        })
        .await?;
        self.follow_up(id, follow_up).await
    }

    async fn spawn_children(
        &self,
        parent: &NodeExecution,
        response: ExecutableResponse,
    ) -> Result<(), EngineError> {
        let plan = self.plan_for(&parent.plan_execution_id).await?;
        let children = response
            .child_node_ids()
            .iter()
            .map(|child_id| {
                let node = plan.node(child_id).ok_or_else(|| {
                    EngineError::configuration(
                        parent.node_id.clone(),
                        format!("child node {} is not defined", child_id),
                    )
                })?;
                Ok(NodeExecution::queued(
                    &parent.plan_execution_id,
                    &node.uuid,
                    ambiance::for_child(&parent.ambiance, node),
                )
                .with_parent(parent.uuid.clone()))
            })
            .collect::<Result<Vec<_>, EngineError>>()?;

        let expected_responses = parent.executable_responses.len();
        let mut spawn = false;
        let mut paused = false;
        let mut follow_up = FollowUp::Nothing;
        self.update(&parent.uuid, |current| {
            spawn = false;
            follow_up = FollowUp::Nothing;
            if current.executable_responses.len() != expected_responses {
                return None;
            }
            paused = match current.status {
                Status::Running => false,
                Status::Paused => true,
                Status::Aborting => {
                    follow_up = FollowUp::Abort;
                    return None;
                }
                _ => return None,
            };
            spawn = true;
            let response = response.clone();
            let is_paused = paused;
            let mutation: Mutation = Box::new(move |ne: &mut NodeExecution| {
                ne.executable_responses.push(response);
                if is_paused {
                    ne.prior_status = Some(Status::ChildrenWaiting);
                } else {
                    ne.set_status(Status::ChildrenWaiting);
                }
            });
            Some(mutation)
        })
        .await?;
        if !spawn {
            return self.follow_up(&parent.uuid, follow_up).await;
        }

        // Every child is stored before any of them runs, so a fast child
        // cannot conclude the parent while its siblings are missing.
        let ids: Vec<String> = children.iter().map(|c| c.uuid.clone()).collect();
        for child in children {
            self.store.save(child).await?;
        }
        tracing::info!(
            node_execution_id = %parent.uuid,
            children = ids.len(),
            "Spawned child executions"
        );

        if paused {
            return Ok(());
        }
        if ids.is_empty() {
            return self.dispatch.submit(DispatchUnit::ChildCompleted {
                parent_id: parent.uuid.clone(),
            });
        }
        for id in ids {
            self.dispatch
                .submit(DispatchUnit::Start { node_execution_id: id })?;
        }
        Ok(())
    }

    async fn handle_child_completed(&self, parent_id: &str) -> Result<(), EngineError> {
        let parent = self.load(parent_id).await?;
        match parent.status {
            Status::ChildrenWaiting => {}
            Status::Aborting => return self.finalize(parent_id, Status::Aborted).await,
            _ => return Ok(()),
        }

        let children = self.store.find_by_parent(parent_id).await?;
        if !settled(&children) {
            return Ok(());
        }
        let response = reduced_response(&children);

        // Claim the parent so only one worker concludes it.
        let claimed = self
            .update(parent_id, |current| {
                if current.status != Status::ChildrenWaiting {
                    return None;
                }
                let mutation: Mutation =
                    Box::new(|ne: &mut NodeExecution| ne.set_status(Status::Running));
                Some(mutation)
            })
            .await?;
        if !claimed.is_applied() {
            return Ok(());
        }

        let mut follow_up = FollowUp::Nothing;
        self.update(parent_id, |current| {
            follow_up = FollowUp::Nothing;
            let response = response.clone();
            let mutation: Mutation = match current.status {
                Status::Running => {
                    follow_up = FollowUp::Advise;
                    Box::new(move |ne: &mut NodeExecution| ne.conclude(&response))
                }
                Status::Paused => {
                    Box::new(move |ne: &mut NodeExecution| ne.parked_response = Some(response))
                }
                Status::Aborting => {
                    follow_up = FollowUp::Abort;
                    return None;
                }
                _ => return None,
            };
            Some(mutation)
        })
        .await?;
        self.follow_up(parent_id, follow_up).await
    }

    /// Consult the advisers of a terminal node and carry out their advise.
    pub(crate) async fn end_transition(&self, id: &str) -> Result<(), EngineError> {
        let ne = self.load(id).await?;
        if !ne.status.is_terminal() {
            return Ok(());
        }
        if ne.advise.is_some() || ne.old_retry {
            return self.restore_successor(&ne).await;
        }
        if let Some(instance) = &ne.timeout_instance_id {
            self.timeouts.cancel(instance);
        }

        let (plan, node) = self.plan_node(&ne).await?;
        let advise = match ne.status {
            Status::Aborted | Status::Errored => Advise::Propagate,
            status => AdviserChain::for_node(&node).advise(&ne, status),
        };
        tracing::debug!(
            node_execution_id = %id,
            status = %ne.status,
            advise = advise.kind(),
            "Advising"
        );

        match advise {
            Advise::NextStep { node_id } => {
                let advise = Advise::NextStep {
                    node_id: node_id.clone(),
                };
                self.advance_to(&ne, &plan, &node_id, advise).await
            }
            Advise::Rollback { strategy_node_id } => {
                let advise = Advise::Rollback {
                    strategy_node_id: strategy_node_id.clone(),
                };
                self.advance_to(&ne, &plan, &strategy_node_id, advise).await
            }
            Advise::MarkSuccess => {
                match AdviserChain::for_node(&node).advise(&ne, Status::Succeeded) {
                    Advise::NextStep { node_id } => {
                        self.advance_to(&ne, &plan, &node_id, Advise::MarkSuccess)
                            .await
                    }
                    _ => self.propagate(&ne, Advise::MarkSuccess).await,
                }
            }
            Advise::Retry {
                parameters,
                wait_ms,
            } => {
                let record = Advise::Retry {
                    parameters: parameters.clone(),
                    wait_ms,
                };
                if !self.record_advise(&ne, record, None).await? {
                    return Ok(());
                }
                let request = RetryRequest {
                    parameters,
                    wait: Duration::from_millis(wait_ms),
                };
                match self.retry.retry(&ne.uuid, &node, request, None).await {
                    Ok(_) | Err(RetryError::AlreadyRetried { .. }) => Ok(()),
                    Err(e) => Err(successor_error(&ne.uuid, e)),
                }
            }
            Advise::EndPlan { final_status } => {
                if !self.record_advise(&ne, advise, None).await? {
                    return Ok(());
                }
                tracing::info!(
                    plan_execution_id = %ne.plan_execution_id,
                    node = %ne.node_id,
                    status = %final_status,
                    "Ending plan on advise"
                );
                self.end_plan(&ne.plan_execution_id, final_status).await
            }
            Advise::Propagate => self.propagate(&ne, Advise::Propagate).await,
        }
    }

    /// Write the successor an earlier advise recorded but never stored.
    ///
    /// An advised node normally has its successor; this only does work after
    /// a failed write, when the ADVANCE unit is dispatched again.
    async fn restore_successor(&self, ne: &NodeExecution) -> Result<(), EngineError> {
        let Some(record) = &ne.advise else {
            if ne.old_retry {
                let (_, node) = self.plan_node(ne).await?;
                self.restore_retry(ne, &node, RetryRequest::default()).await?;
            }
            return Ok(());
        };
        let (plan, node) = self.plan_node(ne).await?;

        match &record.advise {
            Advise::Retry {
                parameters,
                wait_ms,
            } => {
                let request = RetryRequest {
                    parameters: parameters.clone(),
                    wait: Duration::from_millis(*wait_ms),
                };
                if ne.old_retry {
                    return self.restore_retry(ne, &node, request).await;
                }
                // The claim on the failed attempt never landed.
                match self.retry.retry(&ne.uuid, &node, request, None).await {
                    Ok(_) | Err(RetryError::AlreadyRetried { .. }) => Ok(()),
                    Err(e) => Err(successor_error(&ne.uuid, e)),
                }
            }
            Advise::NextStep { .. } | Advise::Rollback { .. } | Advise::MarkSuccess => {
                if ne.old_retry {
                    return self.restore_retry(ne, &node, RetryRequest::default()).await;
                }
                let Some(next_id) = ne.next_id.as_deref() else {
                    return Ok(());
                };
                if self.store.get(next_id).await?.is_some() {
                    return Ok(());
                }
                let target = match &record.advise {
                    Advise::NextStep { node_id } => node_id.clone(),
                    Advise::Rollback { strategy_node_id } => strategy_node_id.clone(),
                    _ => match AdviserChain::for_node(&node).advise(ne, Status::Succeeded) {
                        Advise::NextStep { node_id } => node_id,
                        _ => return Ok(()),
                    },
                };
                tracing::warn!(
                    plan_execution_id = %ne.plan_execution_id,
                    node_execution_id = %ne.uuid,
                    next = %next_id,
                    "Restoring missing successor"
                );
                let next = self.successor(ne, &plan, &target, Some(next_id)).await?;
                match self.store.save(next).await {
                    Ok(next) => self.dispatch.submit(DispatchUnit::Start {
                        node_execution_id: next.uuid,
                    }),
                    Err(StoreError::Duplicate { .. }) => Ok(()),
                    Err(source) => Err(EngineError::SuccessorNotStored {
                        node_execution_id: ne.uuid.clone(),
                        source,
                    }),
                }
            }
            Advise::Propagate | Advise::EndPlan { .. } => {
                if ne.old_retry {
                    self.restore_retry(ne, &node, RetryRequest::default()).await?;
                }
                Ok(())
            }
        }
    }

    async fn restore_retry(
        &self,
        ne: &NodeExecution,
        node: &PlanNode,
        request: RetryRequest,
    ) -> Result<(), EngineError> {
        match self.retry.restore(ne, node, request).await {
            Ok(Some(attempt)) => {
                tracing::warn!(
                    node_execution_id = %ne.uuid,
                    attempt = %attempt.uuid,
                    "Restored missing retry attempt"
                );
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Err(successor_error(&ne.uuid, e)),
        }
    }

    /// Record `advise` (and the successor it creates) on a terminal node.
    ///
    /// Returns false when another worker already advised the node.
    async fn record_advise(
        &self,
        ne: &NodeExecution,
        advise: Advise,
        next_id: Option<String>,
    ) -> Result<bool, EngineError> {
        let kind = advise.kind();
        let outcome = self
            .update(&ne.uuid, |current| {
                if !current.status.is_terminal() || current.advise.is_some() || current.old_retry {
                    return None;
                }
                let record = AdviseRecord {
                    advise: advise.clone(),
                    for_status: current.status,
                    decided_at: Utc::now(),
                };
                let next_id = next_id.clone();
                let mutation: Mutation = Box::new(move |ne: &mut NodeExecution| {
                    ne.advise = Some(record);
                    if next_id.is_some() {
                        ne.next_id = next_id;
                    }
                    ne.last_updated_at = Utc::now();
                });
                Some(mutation)
            })
            .await?;

        if outcome.is_applied() {
            self.events.publish(OrchestrationEvent::AdviseApplied {
                plan_execution_id: ne.plan_execution_id.clone(),
                node_execution_id: ne.uuid.clone(),
                advise: kind.to_string(),
            });
        }
        Ok(outcome.is_applied())
    }

    /// Start `target` as the next sibling of `ne`.
    async fn advance_to(
        &self,
        ne: &NodeExecution,
        plan: &Plan,
        target: &str,
        advise: Advise,
    ) -> Result<(), EngineError> {
        let next = self.successor(ne, plan, target, None).await?;

        // Claim the transition before the successor exists.
        if !self
            .record_advise(ne, advise, Some(next.uuid.clone()))
            .await?
        {
            return Ok(());
        }
        let next = self
            .store
            .save(next)
            .await
            .map_err(|source| EngineError::SuccessorNotStored {
                node_execution_id: ne.uuid.clone(),
                source,
            })?;
        tracing::info!(
            plan_execution_id = %ne.plan_execution_id,
            from = %ne.node_id,
            to = %next.node_id,
            "Advancing to next node"
        );
        self.dispatch.submit(DispatchUnit::Start {
            node_execution_id: next.uuid,
        })
    }

    /// QUEUED execution of `target` following `ne` in the same sequence.
    async fn successor(
        &self,
        ne: &NodeExecution,
        plan: &Plan,
        target: &str,
        id: Option<&str>,
    ) -> Result<NodeExecution, EngineError> {
        let node = plan.node(target).ok_or_else(|| {
            EngineError::configuration(
                ne.node_id.clone(),
                format!("advised node {} is not defined", target),
            )
        })?;
        let base = match &ne.parent_id {
            Some(parent_id) => self.load(parent_id).await?.ambiance,
            None => ambiance::initial(
                &ne.plan_execution_id,
                &plan.uuid,
                ne.ambiance.setup_abstractions.clone(),
            ),
        };
        let mut ambiance = ambiance::for_child(&base, node);
        if let Some(id) = id {
            ambiance = ambiance::with_runtime_id(ambiance, id);
        }
        let mut next = NodeExecution::queued(&ne.plan_execution_id, &node.uuid, ambiance)
            .with_previous(ne.uuid.clone());
        next.parent_id = ne.parent_id.clone();
        next.notify_id = ne.notify_id.clone();
        Ok(next)
    }

    async fn propagate(&self, ne: &NodeExecution, advise: Advise) -> Result<(), EngineError> {
        if !self.record_advise(ne, advise, None).await? {
            return Ok(());
        }
        match &ne.notify_id {
            Some(parent_id) => self.dispatch.submit(DispatchUnit::ChildCompleted {
                parent_id: parent_id.clone(),
            }),
            None => self.conclude_plan_check(&ne.plan_execution_id).await,
        }
    }

    async fn conclude_plan_check(&self, plan_execution_id: &str) -> Result<(), EngineError> {
        let top_level: Vec<NodeExecution> = self
            .store
            .find_by_plan_execution(plan_execution_id, None)
            .await?
            .into_iter()
            .filter(|ne| ne.parent_id.is_none())
            .collect();
        if top_level.is_empty() || !settled(&top_level) {
            return Ok(());
        }
        let status = Status::reduce(
            top_level
                .iter()
                .filter(|ne| ne.is_active())
                .map(NodeExecution::effective_status),
        );
        self.conclude_plan(plan_execution_id, status).await
    }

    pub(crate) async fn conclude_plan(
        &self,
        plan_execution_id: &str,
        status: Status,
    ) -> Result<(), EngineError> {
        if let Some(pe) = self
            .store
            .conclude_plan_execution(plan_execution_id, status)
            .await?
        {
            tracing::info!(
                plan_execution_id = %pe.uuid,
                status = %pe.status,
                "Plan execution finished"
            );
            self.plans.remove(plan_execution_id);
            self.events.publish(OrchestrationEvent::PlanCompleted {
                plan_execution_id: pe.uuid,
                status: pe.status,
            });
        }
        Ok(())
    }

    /// Conclude the plan and abort everything still in flight.
    async fn end_plan(&self, plan_execution_id: &str, status: Status) -> Result<(), EngineError> {
        self.conclude_plan(plan_execution_id, status).await?;
        let executions = self
            .store
            .find_by_plan_execution(plan_execution_id, None)
            .await?;
        for ne in executions.into_iter().filter(|ne| !ne.status.is_terminal()) {
            self.dispatch.submit(DispatchUnit::Finalize {
                node_execution_id: ne.uuid,
                status: Status::Aborted,
            })?;
        }
        Ok(())
    }

    /// Force a non-terminal node to `status` (ABORTED or EXPIRED).
    pub(crate) async fn finalize(&self, id: &str, status: Status) -> Result<(), EngineError> {
        let ne = self.load(id).await?;
        if ne.status.is_terminal() {
            return Ok(());
        }
        if !ne.waiting_on.is_empty() {
            self.abort_external_work(&ne).await;
        }

        let failure = match status {
            Status::Expired => FailureInfo::new(FailureKind::Timeout, "Node execution timed out"),
            _ => FailureInfo::new(FailureKind::Aborted, "Node execution was aborted"),
        };
        let outcome = self
            .update(id, |current| {
                if current.status.is_terminal() {
                    return None;
                }
                let response = StepResponse {
                    status,
                    failure: Some(failure.clone()),
                    outcomes: Vec::new(),
                };
                let mutation: Mutation = Box::new(move |ne: &mut NodeExecution| ne.conclude(&response));
                Some(mutation)
            })
            .await?;

        if outcome.is_applied() {
            tracing::info!(node_execution_id = %id, %status, "Node execution finalized");
            self.end_transition(id).await
        } else {
            Ok(())
        }
    }

    /// Best-effort cancellation of a node's outstanding external work.
    pub(crate) async fn abort_external_work(&self, ne: &NodeExecution) {
        let Ok((_, node)) = self.plan_node(ne).await else {
            return;
        };
        let Some(handler) = self.steps.get(&node.step_type) else {
            return;
        };
        let ctx = self.step_context(ne, node);
        if let Err(e) = handler.handle_abort(&ctx, ne.latest_response()).await {
            tracing::warn!(node_execution_id = %ne.uuid, error = %e, "Abort of external work failed");
        }
    }

    /// Mark the node ERRORED, then end the plan as ERRORED.
    async fn fail_configuration(&self, id: &str, message: &str) -> Result<(), EngineError> {
        let ne = self.load(id).await?;
        tracing::error!(
            plan_execution_id = %ne.plan_execution_id,
            node_execution_id = %id,
            node = %ne.node_id,
            error = %message,
            "Configuration error"
        );
        if let Some(instance) = &ne.timeout_instance_id {
            self.timeouts.cancel(instance);
        }
        let response = StepResponse {
            status: Status::Errored,
            failure: Some(FailureInfo::configuration(message)),
            outcomes: Vec::new(),
        };
        self.update(id, |current| {
            if current.status.is_terminal() {
                return None;
            }
            let response = response.clone();
            let mutation: Mutation = Box::new(move |ne: &mut NodeExecution| {
                ne.conclude(&response);
                ne.advise = Some(AdviseRecord {
                    advise: Advise::Propagate,
                    for_status: Status::Errored,
                    decided_at: Utc::now(),
                });
            });
            Some(mutation)
        })
        .await?;
        self.end_plan(&ne.plan_execution_id, Status::Errored).await
    }
}

#[async_trait]
impl DispatchTarget for OrchestrationEngine {
    async fn process(&self, unit: DispatchUnit) -> Result<(), EngineError> {
        tracing::trace!(unit = unit.kind(), target = unit.target_id(), "Processing dispatch unit");
        let node_execution_id = match &unit {
            DispatchUnit::Notify { .. } => None,
            other => Some(other.target_id().to_string()),
        };
        let advancing = matches!(unit, DispatchUnit::Advance { .. });

        let result = match unit {
            DispatchUnit::Start { node_execution_id } => self.handle_start(&node_execution_id).await,
            DispatchUnit::Resume {
                node_execution_id,
                callback_id,
                payload,
            } => {
                self.resume_node(&node_execution_id, &callback_id, payload)
                    .await
            }
            DispatchUnit::Notify {
                callback_id,
                payload,
            } => self.notify(&callback_id, payload).await,
            DispatchUnit::Complete { node_execution_id } => {
                self.handle_complete(&node_execution_id).await
            }
            DispatchUnit::ChildCompleted { parent_id } => {
                self.handle_child_completed(&parent_id).await
            }
            DispatchUnit::Finalize {
                node_execution_id,
                status,
            } => self.finalize(&node_execution_id, status).await,
            DispatchUnit::Advance { node_execution_id } => {
                self.end_transition(&node_execution_id).await
            }
        };

        match (result, node_execution_id) {
            (
                Err(e @ (EngineError::Configuration { .. } | EngineError::StepHandlerMissing { .. })),
                Some(id),
            ) => self.fail_configuration(&id, &e.to_string()).await,
            // Only an ADVANCE unit rebuilds a missing successor.
            (Err(EngineError::SuccessorNotStored { node_execution_id, source }), _) if !advancing => {
                tracing::warn!(
                    node_execution_id = %node_execution_id,
                    error = %source,
                    "Successor not stored, advancing again"
                );
                self.dispatch.submit_after(
                    DispatchUnit::Advance { node_execution_id },
                    self.config.requeue_delay,
                )
            }
            (result, _) => result,
        }
    }
}

/// Map a retry that claimed the old attempt but could not write the new one
/// to the error the dispatcher retries.
fn successor_error(node_execution_id: &str, err: RetryError) -> EngineError {
    match err {
        RetryError::AttemptNotStored { source, .. } => EngineError::SuccessorNotStored {
            node_execution_id: node_execution_id.to_string(),
            source,
        },
        other => other.into(),
    }
}

/// Whether every execution has finished and had its advise carried out, so
/// that their reduced status can no longer change.
fn settled(executions: &[NodeExecution]) -> bool {
    let ids: HashSet<&str> = executions.iter().map(|ne| ne.uuid.as_str()).collect();
    let present = |id: &Option<String>| id.as_deref().is_some_and(|id| ids.contains(id));

    executions.iter().all(|ne| {
        if ne.old_retry {
            return present(&ne.retried_by);
        }
        if !ne.status.is_terminal() {
            return false;
        }
        match ne.advise.as_ref().map(|record| &record.advise) {
            None => false,
            Some(Advise::Retry { .. }) => present(&ne.retried_by),
            Some(Advise::NextStep { .. } | Advise::Rollback { .. } | Advise::MarkSuccess) => {
                ne.next_id.is_none() || present(&ne.next_id)
            }
            Some(Advise::Propagate | Advise::EndPlan { .. }) => true,
        }
    })
}

/// Status a parent takes from its settled children.
fn reduced_response(children: &[NodeExecution]) -> StepResponse {
    let active: Vec<&NodeExecution> = children.iter().filter(|ne| ne.is_active()).collect();
    let status = Status::reduce(active.iter().map(|ne| ne.effective_status()));
    if !status.is_broken() {
        return StepResponse::with_status(status);
    }

    let broken = active
        .iter()
        .filter(|ne| ne.effective_status().is_broken())
        .count();
    let kind = match status {
        Status::Aborted => FailureKind::Aborted,
        Status::Expired => FailureKind::Timeout,
        Status::Errored => FailureKind::Configuration,
        _ => FailureKind::Application,
    };
    StepResponse {
        status,
        failure: Some(FailureInfo::new(
            kind,
            format!(
                "{} of {} child executions ended {}",
                broken,
                active.len(),
                status
            ),
        )),
        outcomes: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::{engine, run_to_idle};
    use crate::plan::PlanBuilder;
    use cadence_common::{AdviserObtainment, Ambiance};
    use serde_json::json;

    fn child(id: &str, status: Status, advise: Option<Advise>) -> NodeExecution {
        let mut ne = NodeExecution::queued(
            "pe",
            id,
            Ambiance {
                plan_execution_id: "pe".to_string(),
                setup_abstractions: BTreeMap::new(),
                levels: Vec::new(),
            },
        );
        ne.uuid = id.to_string();
        ne.parent_id = Some("parent".to_string());
        ne.status = status;
        ne.advise = advise.map(|advise| AdviseRecord {
            advise,
            for_status: status,
            decided_at: Utc::now(),
        });
        ne
    }

    #[test]
    fn test_unadvised_terminal_child_is_not_settled() {
        let children = vec![
            child("a", Status::Succeeded, Some(Advise::Propagate)),
            child("b", Status::Failed, None),
        ];
        assert!(!settled(&children));
    }

    #[test]
    fn test_next_step_waits_for_successor() {
        let mut a = child(
            "a",
            Status::Succeeded,
            Some(Advise::NextStep {
                node_id: "b".into(),
            }),
        );
        a.next_id = Some("b".to_string());
        assert!(!settled(std::slice::from_ref(&a)));

        let b = child("b", Status::Running, None);
        assert!(!settled(&[a.clone(), b]));

        let b = child("b", Status::Succeeded, Some(Advise::Propagate));
        assert!(settled(&[a, b]));
    }

    #[test]
    fn test_retried_attempt_needs_its_successor() {
        let mut old = child(
            "c1",
            Status::Failed,
            Some(Advise::Retry {
                parameters: None,
                wait_ms: 0,
            }),
        );
        assert!(!settled(std::slice::from_ref(&old)));

        old.old_retry = true;
        old.retried_by = Some("c2".to_string());
        let new = child("c2", Status::Succeeded, Some(Advise::Propagate));
        let children = vec![old, new];
        assert!(settled(&children));
        assert_eq!(reduced_response(&children).status, Status::Succeeded);
    }

    #[test]
    fn test_reduction_ignores_resolved_failures() {
        let mut failed = child(
            "c",
            Status::Failed,
            Some(Advise::Rollback {
                strategy_node_id: "r".into(),
            }),
        );
        failed.next_id = Some("r".to_string());
        let rollback = child("r", Status::Succeeded, Some(Advise::Propagate));
        let response = reduced_response(&[failed, rollback]);
        assert_eq!(response.status, Status::Succeeded);
        assert!(response.failure.is_none());
    }

    #[test]
    fn test_unresolved_failure_fails_parent() {
        let children = vec![
            child("a", Status::Succeeded, Some(Advise::Propagate)),
            child("b", Status::Failed, Some(Advise::Propagate)),
        ];
        let response = reduced_response(&children);
        assert_eq!(response.status, Status::Failed);
        assert_eq!(
            response.failure.unwrap().message,
            "1 of 2 child executions ended FAILED"
        );
    }

    async fn run(plan: Plan) -> (Arc<OrchestrationEngine>, PlanExecution, Vec<NodeExecution>) {
        let (engine, mut queue) = engine();
        let pe = engine
            .start_plan(Principal::user("tester"), plan, BTreeMap::new())
            .await
            .unwrap();
        run_to_idle(&engine, &mut queue).await;
        let pe = engine.plan_execution(&pe.uuid).await.unwrap();
        let executions = engine
            .store()
            .find_by_plan_execution(&pe.uuid, None)
            .await
            .unwrap();
        (engine, pe, executions)
    }

    fn by_node<'a>(executions: &'a [NodeExecution], node_id: &str) -> Vec<&'a NodeExecution> {
        executions.iter().filter(|ne| ne.node_id == node_id).collect()
    }

    #[tokio::test]
    async fn test_sequential_nodes_run_in_order() {
        let plan = PlanBuilder::new("seq")
            .node(PlanNode::new("a", "noop").with_adviser(AdviserObtainment::next_step("b")))
            .node(PlanNode::new("b", "noop").with_parameters(json!({"outcomes": {"v": 1}})))
            .build()
            .unwrap();
        let (_, pe, executions) = run(plan).await;

        assert_eq!(pe.status, Status::Succeeded);
        assert_eq!(executions.len(), 2);
        let a = by_node(&executions, "a")[0];
        let b = by_node(&executions, "b")[0];
        assert_eq!(a.next_id.as_deref(), Some(b.uuid.as_str()));
        assert_eq!(b.previous_id.as_deref(), Some(a.uuid.as_str()));
        assert_eq!(b.outcome("v"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_retry_then_rollback() {
        let plan = PlanBuilder::new("rollback")
            .node(
                PlanNode::new("c", "fail")
                    .with_adviser(AdviserObtainment::retry_then_rollback(2, "r")),
            )
            .node(PlanNode::new("r", "noop"))
            .build()
            .unwrap();
        let (_, pe, executions) = run(plan).await;

        let attempts = by_node(&executions, "c");
        assert_eq!(attempts.len(), 2);
        assert!(attempts[0].old_retry);
        assert_eq!(attempts[1].retry_ids, vec![attempts[0].uuid.clone()]);
        assert_eq!(attempts[1].status, Status::Failed);
        assert_eq!(by_node(&executions, "r").len(), 1);
        assert_eq!(by_node(&executions, "r")[0].status, Status::Succeeded);
        assert_eq!(pe.status, Status::Succeeded);
    }

    #[tokio::test]
    async fn test_fork_fails_when_a_child_fails() {
        let plan = PlanBuilder::new("fork")
            .node(PlanNode::new("root", "fork").with_parameters(json!({"children": ["ok", "bad"]})))
            .node(PlanNode::new("ok", "noop"))
            .node(PlanNode::new("bad", "fail").with_parameters(json!({"message": "broken"})))
            .build()
            .unwrap();
        let (_, pe, executions) = run(plan).await;

        assert_eq!(pe.status, Status::Failed);
        let root = by_node(&executions, "root")[0];
        assert_eq!(root.status, Status::Failed);
        assert_eq!(
            root.failure_info.as_ref().unwrap().message,
            "1 of 2 child executions ended FAILED"
        );
        let bad = by_node(&executions, "bad")[0];
        assert_eq!(bad.parent_id.as_deref(), Some(root.uuid.as_str()));
        assert_eq!(bad.ambiance.depth(), root.ambiance.depth() + 1);
    }

    #[tokio::test]
    async fn test_unknown_step_type_errors_the_plan() {
        let plan = PlanBuilder::new("broken")
            .node(PlanNode::new("a", "nonexistent"))
            .build()
            .unwrap();
        let (_, pe, executions) = run(plan).await;

        assert_eq!(pe.status, Status::Errored);
        assert_eq!(executions[0].status, Status::Errored);
        assert_eq!(
            executions[0].failure_info.as_ref().unwrap().kind,
            FailureKind::Configuration
        );
    }

    #[tokio::test]
    async fn test_skip_condition_skips_node() {
        let plan = PlanBuilder::new("skip")
            .node(PlanNode::new("a", "fail").with_skip_condition("true"))
            .build()
            .unwrap();
        let (_, pe, executions) = run(plan).await;

        assert_eq!(executions[0].status, Status::Skipped);
        assert_eq!(pe.status, Status::Skipped);
    }

    #[tokio::test]
    async fn test_duplicate_resume_is_noop() {
        let plan = PlanBuilder::new("async")
            .node(
                PlanNode::new("b", "delegate")
                    .with_facilitators(vec![ExecutionMode::Async])
                    .with_parameters(json!({"callbacks": 2, "auto_complete": false})),
            )
            .build()
            .unwrap();
        let (engine, mut queue) = engine();
        let pe = engine
            .start_plan(Principal::user("tester"), plan, BTreeMap::new())
            .await
            .unwrap();
        run_to_idle(&engine, &mut queue).await;

        let waiting = engine
            .store()
            .find_by_plan_execution(&pe.uuid, None)
            .await
            .unwrap()
            .remove(0);
        assert_eq!(waiting.status, Status::AsyncWaiting);
        let cb0 = format!("{}-l0-cb0", waiting.uuid);
        let cb1 = format!("{}-l0-cb1", waiting.uuid);

        engine.resume_node(&waiting.uuid, &cb0, json!({})).await.unwrap();
        let once = engine.load(&waiting.uuid).await.unwrap();
        engine.resume_node(&waiting.uuid, &cb0, json!({})).await.unwrap();
        let twice = engine.load(&waiting.uuid).await.unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice.status, Status::AsyncWaiting);
        assert_eq!(twice.waiting_on.len(), 1);

        engine.notify(&cb1, json!({"status": "SUCCEEDED"})).await.unwrap();
        run_to_idle(&engine, &mut queue).await;
        assert_eq!(
            engine.load(&waiting.uuid).await.unwrap().status,
            Status::Succeeded
        );
        assert_eq!(
            engine.plan_execution(&pe.uuid).await.unwrap().status,
            Status::Succeeded
        );
    }
}
