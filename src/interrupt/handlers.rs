use super::InterruptOutcome;
use crate::engine::{DispatchUnit, OrchestrationEngine};
use crate::errors::{InterruptError, RetryError};
use crate::retry::RetryRequest;
use crate::store::{Mutation, UpdateOutcome};
use cadence_common::{
    FailureInfo, FailureKind, Interrupt, InterruptType, NodeExecution, PlanExecution, Status,
    StepResponse,
};
use std::collections::VecDeque;

pub(super) async fn apply(
    engine: &OrchestrationEngine,
    interrupt: &Interrupt,
    plan_execution: &PlanExecution,
) -> Result<InterruptOutcome, InterruptError> {
    let target = match &interrupt.node_execution_id {
        Some(id) => match engine.store().get(id).await? {
            Some(ne) if ne.plan_execution_id != plan_execution.uuid => {
                return Err(InterruptError::ForeignNodeExecution {
                    node_execution_id: id.clone(),
                    plan_execution_id: plan_execution.uuid.clone(),
                });
            }
            Some(ne) => Some(ne),
            None => {
                return Ok(InterruptOutcome::no_op(format!(
                    "node execution {} not found",
                    id
                )));
            }
        },
        None => None,
    };

    if let Some(ne) = target
        .as_ref()
        .filter(|ne| ne.status.is_terminal() && interrupt.interrupt_type != InterruptType::Retry)
    {
        return Ok(InterruptOutcome::no_op(format!(
            "node execution {} is already {}",
            ne.uuid, ne.status
        )));
    }

    match (interrupt.interrupt_type, target) {
        (InterruptType::Pause, Some(ne)) => pause(engine, interrupt, vec![ne], true).await,
        (InterruptType::Resume, Some(ne)) => resume(engine, interrupt, vec![ne]).await,
        (InterruptType::Abort, Some(ne)) => {
            let mut nodes = vec![ne.clone()];
            nodes.extend(descendants(engine, &ne.uuid).await?);
            abort(engine, interrupt, nodes).await
        }
        (InterruptType::Retry, Some(ne)) => retry(engine, interrupt, plan_execution, ne).await,
        (InterruptType::Expire, Some(ne)) => expire(engine, interrupt, ne).await,
        (InterruptType::PauseAll, _) => {
            let nodes = in_flight(engine, &plan_execution.uuid).await?;
            pause(engine, interrupt, nodes, false).await
        }
        (InterruptType::ResumeAll, _) => {
            let nodes = engine
                .store()
                .find_by_plan_execution(&plan_execution.uuid, Some(&[Status::Paused]))
                .await?;
            resume(engine, interrupt, nodes).await
        }
        (InterruptType::AbortAll, _) => {
            let nodes = in_flight(engine, &plan_execution.uuid).await?;
            abort(engine, interrupt, nodes).await
        }
        (kind, None) => Err(InterruptError::MissingNodeExecutionId {
            kind: kind.to_string(),
        }),
    }
}

async fn in_flight(
    engine: &OrchestrationEngine,
    plan_execution_id: &str,
) -> Result<Vec<NodeExecution>, InterruptError> {
    Ok(engine
        .store()
        .find_by_plan_execution(plan_execution_id, None)
        .await?
        .into_iter()
        .filter(|ne| !ne.status.is_terminal())
        .collect())
}

/// Every node execution below `id`, breadth first.
async fn descendants(
    engine: &OrchestrationEngine,
    id: &str,
) -> Result<Vec<NodeExecution>, InterruptError> {
    let mut found = Vec::new();
    let mut frontier = VecDeque::from([id.to_string()]);
    while let Some(parent) = frontier.pop_front() {
        for child in engine.store().find_by_parent(&parent).await? {
            frontier.push_back(child.uuid.clone());
            found.push(child);
        }
    }
    Ok(found)
}

/// PAUSE parks work in progress. A single PAUSE may also hold a parent that
/// waits on children; PAUSE_ALL leaves those to their paused children.
async fn pause(
    engine: &OrchestrationEngine,
    interrupt: &Interrupt,
    nodes: Vec<NodeExecution>,
    include_parents: bool,
) -> Result<InterruptOutcome, InterruptError> {
    let mut paused = Vec::new();
    for ne in nodes {
        let outcome = engine
            .update(&ne.uuid, |current| {
                let pausable = current.status.is_pausable()
                    && (include_parents || current.status != Status::ChildrenWaiting);
                if !pausable {
                    return None;
                }
                let interrupt = interrupt.clone();
                let mutation: Mutation = Box::new(move |ne: &mut NodeExecution| {
                    ne.record_interrupt(
                        &interrupt.uuid,
                        interrupt.interrupt_type,
                        &interrupt.created_by,
                        Status::Paused,
                    );
                    ne.prior_status = Some(ne.status);
                    ne.set_status(Status::Paused);
                });
                Some(mutation)
            })
            .await?;
        if outcome.is_applied() {
            paused.push(ne.uuid);
        }
    }
    Ok(InterruptOutcome::applied(paused))
}

async fn resume(
    engine: &OrchestrationEngine,
    interrupt: &Interrupt,
    nodes: Vec<NodeExecution>,
) -> Result<InterruptOutcome, InterruptError> {
    let single_not_paused = match nodes.as_slice() {
        [ne] if ne.status != Status::Paused => Some(ne),
        _ => None,
    };
    if let Some(ne) = single_not_paused {
        return Ok(InterruptOutcome::no_op(format!(
            "node execution {} is {}, not PAUSED",
            ne.uuid, ne.status
        )));
    }

    let mut resumed = Vec::new();
    for ne in nodes {
        let outcome = engine
            .update(&ne.uuid, |current| {
                if current.status != Status::Paused {
                    return None;
                }
                let restored = current.prior_status.unwrap_or(Status::Running);
                let interrupt = interrupt.clone();
                let mutation: Mutation = Box::new(move |ne: &mut NodeExecution| {
                    ne.record_interrupt(
                        &interrupt.uuid,
                        interrupt.interrupt_type,
                        &interrupt.created_by,
                        restored,
                    );
                    ne.prior_status = None;
                    ne.set_status(restored);
                });
                Some(mutation)
            })
            .await?;
        if let UpdateOutcome::Applied(ne) = outcome {
            continue_resumed(engine, &ne).await?;
            resumed.push(ne.uuid);
        }
    }
    Ok(InterruptOutcome::applied(resumed))
}

/// Pick a resumed node up where PAUSE parked it.
async fn continue_resumed(
    engine: &OrchestrationEngine,
    ne: &NodeExecution,
) -> Result<(), InterruptError> {
    let dispatch = engine.dispatch();
    match ne.status {
        Status::Queued => dispatch.submit(DispatchUnit::Start {
            node_execution_id: ne.uuid.clone(),
        })?,
        Status::Running if ne.parked_response.is_some() => {
            dispatch.submit(DispatchUnit::Complete {
                node_execution_id: ne.uuid.clone(),
            })?
        }
        status if status.is_callback_waiting() && ne.waiting_on.is_empty() => {
            dispatch.submit(DispatchUnit::Complete {
                node_execution_id: ne.uuid.clone(),
            })?
        }
        Status::ChildrenWaiting => {
            let children = engine.store().find_by_parent(&ne.uuid).await?;
            for child in children.into_iter().filter(|c| c.status == Status::Queued) {
                dispatch.submit(DispatchUnit::Start {
                    node_execution_id: child.uuid,
                })?;
            }
            dispatch.submit(DispatchUnit::ChildCompleted {
                parent_id: ne.uuid.clone(),
            })?;
        }
        // A running worker or an outstanding callback moves it on.
        _ => {}
    }
    Ok(())
}

/// Mark nodes ABORTING and have the engine finalize them.
async fn abort(
    engine: &OrchestrationEngine,
    interrupt: &Interrupt,
    nodes: Vec<NodeExecution>,
) -> Result<InterruptOutcome, InterruptError> {
    let mut aborting = Vec::new();
    for ne in nodes {
        let outcome = engine
            .update(&ne.uuid, |current| {
                if current.status.is_terminal() || current.status == Status::Aborting {
                    return None;
                }
                let interrupt = interrupt.clone();
                let mutation: Mutation = Box::new(move |ne: &mut NodeExecution| {
                    ne.record_interrupt(
                        &interrupt.uuid,
                        interrupt.interrupt_type,
                        &interrupt.created_by,
                        Status::Aborting,
                    );
                    ne.set_status(Status::Aborting);
                });
                Some(mutation)
            })
            .await?;
        if outcome.is_applied() {
            aborting.push(ne.uuid);
        }
    }

    for id in &aborting {
        engine.dispatch().submit(DispatchUnit::Finalize {
            node_execution_id: id.clone(),
            status: Status::Aborted,
        })?;
    }
    Ok(InterruptOutcome::applied(aborting))
}

async fn retry(
    engine: &OrchestrationEngine,
    interrupt: &Interrupt,
    plan_execution: &PlanExecution,
    ne: NodeExecution,
) -> Result<InterruptOutcome, InterruptError> {
    if !ne.status.is_broken() {
        return Ok(InterruptOutcome::no_op(format!(
            "node execution {} is {}, only failed executions can be retried",
            ne.uuid, ne.status
        )));
    }
    if plan_execution.is_finished() {
        return Ok(InterruptOutcome::no_op(format!(
            "plan execution {} already finished {}",
            plan_execution.uuid, plan_execution.status
        )));
    }
    if let Some(parent_id) = &ne.parent_id {
        let parent = engine.load(parent_id).await?;
        if parent.status.is_terminal() {
            return Ok(InterruptOutcome::no_op(format!(
                "parent node execution {} already finished {}",
                parent.uuid, parent.status
            )));
        }
    }

    let (_, node) = engine.plan_node(&ne).await?;
    let request = RetryRequest {
        parameters: interrupt.parameters.clone(),
        ..RetryRequest::default()
    };
    match engine
        .retry_helper()
        .retry(&ne.uuid, &node, request.clone(), Some(interrupt))
        .await
    {
        Ok(attempt) => Ok(InterruptOutcome::applied(vec![attempt.uuid])),
        Err(e @ (RetryError::AlreadyRetried { .. } | RetryError::NotRetryable { .. })) => {
            Ok(InterruptOutcome::no_op(e.to_string()))
        }
        Err(RetryError::AttemptNotStored { id, source }) => {
            tracing::warn!(
                node_execution_id = %ne.uuid,
                attempt = %id,
                error = %source,
                "Retry attempt not stored"
            );
            let claimed = engine.load(&ne.uuid).await?;
            if engine
                .retry_helper()
                .restore(&claimed, &node, request)
                .await
                .is_err()
            {
                engine.dispatch().submit_after(
                    DispatchUnit::Advance {
                        node_execution_id: ne.uuid.clone(),
                    },
                    engine.config().requeue_delay,
                )?;
            }
            Ok(InterruptOutcome::applied(vec![id]))
        }
        Err(e) => Err(e.into()),
    }
}

/// Force a node straight to EXPIRED and let its advisers decide what follows.
async fn expire(
    engine: &OrchestrationEngine,
    interrupt: &Interrupt,
    ne: NodeExecution,
) -> Result<InterruptOutcome, InterruptError> {
    if !ne.waiting_on.is_empty() {
        engine.abort_external_work(&ne).await;
    }

    let response = StepResponse {
        status: Status::Expired,
        failure: Some(FailureInfo::new(
            FailureKind::Timeout,
            "Node execution timed out",
        )),
        outcomes: Vec::new(),
    };
    let outcome = engine
        .update(&ne.uuid, |current| {
            if current.status.is_terminal() {
                return None;
            }
            let interrupt = interrupt.clone();
            let response = response.clone();
            let mutation: Mutation = Box::new(move |ne: &mut NodeExecution| {
                ne.record_interrupt(
                    &interrupt.uuid,
                    interrupt.interrupt_type,
                    &interrupt.created_by,
                    Status::Expired,
                );
                ne.conclude(&response);
            });
            Some(mutation)
        })
        .await?;
    if !outcome.is_applied() {
        return Ok(InterruptOutcome::no_op(format!(
            "node execution {} finished before it expired",
            ne.uuid
        )));
    }

    let children = descendants(engine, &ne.uuid).await?;
    abort(engine, interrupt, children).await?;
    engine.dispatch().submit(DispatchUnit::Advance {
        node_execution_id: ne.uuid.clone(),
    })?;
    Ok(InterruptOutcome::applied(vec![ne.uuid]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::{blank_ambiance, drain, engine_with_plan};
    use cadence_common::{ExecutableResponse, InterruptPackage, PlanNode, Principal};

    fn interrupt(pe: &str, node: Option<&str>, kind: InterruptType) -> Interrupt {
        let package = match node {
            Some(id) => InterruptPackage::for_node(pe, id, kind),
            None => InterruptPackage::for_plan(pe, kind),
        };
        Interrupt::from_package(package, Principal::user("ops"))
    }

    async fn seed(
        engine: &OrchestrationEngine,
        pe: &str,
        id: &str,
        status: Status,
    ) -> NodeExecution {
        let mut ne = NodeExecution::queued(pe, "a", blank_ambiance(pe));
        ne.uuid = id.to_string();
        ne.status = status;
        engine.store().save(ne).await.unwrap()
    }

    #[tokio::test]
    async fn test_pause_then_resume_restores_waiting_status() {
        let (engine, mut queue, pe) = engine_with_plan(vec![PlanNode::new("a", "noop")]).await;
        let mut ne = NodeExecution::queued(&pe.uuid, "a", blank_ambiance(&pe.uuid));
        ne.uuid = "n1".to_string();
        ne.status = Status::AsyncWaiting;
        ne.waiting_on.insert("cb1".to_string());
        engine.store().save(ne).await.unwrap();

        let pause_it = interrupt(&pe.uuid, Some("n1"), InterruptType::Pause);
        let outcome = apply(&engine, &pause_it, &pe).await.unwrap();
        assert!(outcome.is_applied());
        let paused = engine.load("n1").await.unwrap();
        assert_eq!(paused.status, Status::Paused);
        assert_eq!(paused.prior_status, Some(Status::AsyncWaiting));

        let resume_it = interrupt(&pe.uuid, Some("n1"), InterruptType::Resume);
        apply(&engine, &resume_it, &pe).await.unwrap();
        let resumed = engine.load("n1").await.unwrap();
        assert_eq!(resumed.status, Status::AsyncWaiting);
        assert_eq!(resumed.interrupt_history.len(), 2);
        // Still waiting on cb1, nothing to dispatch
        assert!(drain(&mut queue).is_empty());
    }

    #[tokio::test]
    async fn test_resume_of_running_node_is_noop() {
        let (engine, _queue, pe) = engine_with_plan(vec![PlanNode::new("a", "noop")]).await;
        seed(&engine, &pe.uuid, "n1", Status::Running).await;

        let resume_it = interrupt(&pe.uuid, Some("n1"), InterruptType::Resume);
        let outcome = apply(&engine, &resume_it, &pe).await.unwrap();
        assert!(!outcome.is_applied());
    }

    #[tokio::test]
    async fn test_abort_marks_node_and_children_aborting() {
        let (engine, mut queue, pe) = engine_with_plan(vec![PlanNode::new("a", "noop")]).await;
        let parent = seed(&engine, &pe.uuid, "parent", Status::ChildrenWaiting).await;
        let mut child = NodeExecution::queued(&pe.uuid, "a", blank_ambiance(&pe.uuid))
            .with_parent(parent.uuid.clone());
        child.uuid = "child".to_string();
        child.status = Status::Running;
        engine.store().save(child).await.unwrap();

        let abort_it = interrupt(&pe.uuid, Some("parent"), InterruptType::Abort);
        let outcome = apply(&engine, &abort_it, &pe).await.unwrap();
        assert_eq!(
            outcome,
            InterruptOutcome::Applied {
                node_execution_ids: vec!["parent".to_string(), "child".to_string()]
            }
        );
        assert_eq!(engine.load("child").await.unwrap().status, Status::Aborting);

        let units = drain(&mut queue);
        assert_eq!(units.len(), 2);
        assert!(units.iter().all(|u| u.kind() == "finalize"));
    }

    #[tokio::test]
    async fn test_interrupt_on_terminal_node_is_noop() {
        let (engine, _queue, pe) = engine_with_plan(vec![PlanNode::new("a", "noop")]).await;
        seed(&engine, &pe.uuid, "n1", Status::Succeeded).await;

        let abort_it = interrupt(&pe.uuid, Some("n1"), InterruptType::Abort);
        let outcome = apply(&engine, &abort_it, &pe).await.unwrap();
        assert!(matches!(outcome, InterruptOutcome::NoOp { .. }));

        let missing = interrupt(&pe.uuid, Some("nope"), InterruptType::Pause);
        let outcome = apply(&engine, &missing, &pe).await.unwrap();
        assert!(matches!(outcome, InterruptOutcome::NoOp { .. }));
    }

    #[tokio::test]
    async fn test_pause_all_skips_parents_waiting_on_children() {
        let (engine, _queue, pe) = engine_with_plan(vec![PlanNode::new("a", "noop")]).await;
        seed(&engine, &pe.uuid, "parent", Status::ChildrenWaiting).await;
        seed(&engine, &pe.uuid, "n1", Status::Running).await;
        seed(&engine, &pe.uuid, "n2", Status::TaskWaiting).await;
        seed(&engine, &pe.uuid, "done", Status::Succeeded).await;

        let pause_all = interrupt(&pe.uuid, None, InterruptType::PauseAll);
        let outcome = apply(&engine, &pause_all, &pe).await.unwrap();
        assert_eq!(
            outcome,
            InterruptOutcome::Applied {
                node_execution_ids: vec!["n1".to_string(), "n2".to_string()]
            }
        );
        assert_eq!(
            engine.load("parent").await.unwrap().status,
            Status::ChildrenWaiting
        );
    }

    #[tokio::test]
    async fn test_expire_concludes_and_requests_advise() {
        let (engine, mut queue, pe) = engine_with_plan(vec![PlanNode::new("a", "noop")]).await;
        let mut ne = NodeExecution::queued(&pe.uuid, "a", blank_ambiance(&pe.uuid));
        ne.uuid = "n1".to_string();
        ne.status = Status::TaskWaiting;
        ne.executable_responses.push(ExecutableResponse::Task {
            callback_ids: vec!["cb".to_string()],
        });
        ne.waiting_on.insert("cb".to_string());
        engine.store().save(ne).await.unwrap();

        let expire_it = interrupt(&pe.uuid, Some("n1"), InterruptType::Expire);
        let outcome = apply(&engine, &expire_it, &pe).await.unwrap();
        assert!(outcome.is_applied());

        let expired = engine.load("n1").await.unwrap();
        assert_eq!(expired.status, Status::Expired);
        assert!(expired.waiting_on.is_empty());
        assert_eq!(expired.failure_info.unwrap().kind, FailureKind::Timeout);

        let units = drain(&mut queue);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].kind(), "advance");
    }

    #[tokio::test]
    async fn test_retry_of_succeeded_node_is_noop() {
        let (engine, _queue, pe) = engine_with_plan(vec![PlanNode::new("a", "noop")]).await;
        seed(&engine, &pe.uuid, "n1", Status::Succeeded).await;

        let retry_it = interrupt(&pe.uuid, Some("n1"), InterruptType::Retry);
        let outcome = apply(&engine, &retry_it, &pe).await.unwrap();
        assert!(!outcome.is_applied());
    }
}
