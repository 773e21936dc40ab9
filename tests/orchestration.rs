//! End-to-end engine scenarios driven through the public `Orchestrator` API.

use cadence::Orchestrator;
use cadence::engine::OrchestrationEvent;
use cadence::interrupt::InterruptOutcome;
use cadence::plan::PlanBuilder;
use cadence::store::{NodeExecutionStore, SqliteStore};
use cadence_common::{
    AdviserObtainment, ExecutionMode, FailureKind, InterruptPackage, InterruptType,
    NodeExecution, PlanNode, Principal, Status, TimeoutConfig,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const LIMIT: Duration = Duration::from_secs(10);

fn manual_delegate(id: &str, mode: ExecutionMode, callbacks: u64) -> PlanNode {
    PlanNode::new(id, "delegate")
        .with_facilitators(vec![mode])
        .with_parameters(json!({"callbacks": callbacks, "auto_complete": false}))
}

fn callback(ne: &NodeExecution, index: usize) -> String {
    format!("{}-l0-cb{}", ne.uuid, index)
}

fn by_node<'a>(nodes: &'a [NodeExecution], node_id: &str) -> Vec<&'a NodeExecution> {
    nodes.iter().filter(|ne| ne.node_id == node_id).collect()
}

/// Poll until `node_id` has a live execution in `status`.
async fn wait_for_node(
    orchestrator: &Orchestrator,
    plan_execution_id: &str,
    node_id: &str,
    status: Status,
) -> NodeExecution {
    let poll = async {
        loop {
            let nodes = orchestrator.node_executions(plan_execution_id).await.unwrap();
            if let Some(ne) = nodes
                .into_iter()
                .find(|ne| ne.node_id == node_id && !ne.old_retry && ne.status == status)
            {
                return ne;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(LIMIT, poll)
        .await
        .unwrap_or_else(|_| panic!("node {} never reached {}", node_id, status))
}

/// Poll until node execution `id` has recorded `count` callback results.
async fn wait_for_callbacks(orchestrator: &Orchestrator, id: &str, count: usize) -> NodeExecution {
    let poll = async {
        loop {
            let ne = orchestrator.engine().store().get(id).await.unwrap().unwrap();
            if ne.callback_responses.len() >= count {
                return ne;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(LIMIT, poll)
        .await
        .unwrap_or_else(|_| panic!("node execution {} never saw {} callbacks", id, count))
}

mod sequencing {
    use super::*;

    #[tokio::test]
    async fn test_async_step_waits_for_every_callback() {
        let orchestrator = Orchestrator::builder().build();
        let mut events = orchestrator.subscribe();
        let plan = PlanBuilder::new("seq")
            .node(
                PlanNode::new("a", "noop")
                    .with_parameters(json!({"outcomes": {"tag": "v1"}}))
                    .with_adviser(AdviserObtainment::next_step("b")),
            )
            .node(manual_delegate("b", ExecutionMode::Async, 2))
            .build()
            .unwrap();
        let pe = orchestrator
            .start_plan(Principal::user("ci"), plan, BTreeMap::new())
            .await
            .unwrap();

        let b = wait_for_node(&orchestrator, &pe.uuid, "b", Status::AsyncWaiting).await;
        assert_eq!(b.waiting_on.len(), 2);

        // Out of order on purpose.
        orchestrator
            .notify(&callback(&b, 1), json!({"status": "SUCCEEDED"}))
            .unwrap();
        let still = wait_for_callbacks(&orchestrator, &b.uuid, 1).await;
        assert_eq!(still.status, Status::AsyncWaiting);
        assert_eq!(still.waiting_on.len(), 1);

        orchestrator
            .notify(&callback(&b, 0), json!({"status": "SUCCEEDED"}))
            .unwrap();
        let done = orchestrator.wait_for_completion(&pe.uuid, LIMIT).await.unwrap();
        assert_eq!(done.status, Status::Succeeded);

        let nodes = orchestrator.node_executions(&pe.uuid).await.unwrap();
        let a = by_node(&nodes, "a")[0];
        let b = by_node(&nodes, "b")[0];
        assert_eq!(b.status, Status::Succeeded);
        assert_eq!(b.previous_id.as_deref(), Some(a.uuid.as_str()));
        assert!(a.end_ts.unwrap() <= b.start_ts.unwrap());
        assert_eq!(b.callback_responses.len(), 2);

        let mut transitions = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let OrchestrationEvent::NodeStatusChanged {
                node_execution_id,
                from,
                to,
                ..
            } = event
                && node_execution_id == b.uuid
            {
                transitions.push((from, to));
            }
        }
        assert_eq!(
            transitions,
            vec![
                (Status::Queued, Status::Running),
                (Status::Running, Status::AsyncWaiting),
                (Status::AsyncWaiting, Status::Running),
                (Status::Running, Status::Succeeded),
            ]
        );
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_callbacks_complete_node_once() {
        let orchestrator = Orchestrator::builder().build();
        let mut events = orchestrator.subscribe();
        let plan = PlanBuilder::new("race")
            .node(manual_delegate("b", ExecutionMode::Task, 4))
            .build()
            .unwrap();
        let pe = orchestrator
            .start_plan(Principal::user("ci"), plan, BTreeMap::new())
            .await
            .unwrap();
        let b = wait_for_node(&orchestrator, &pe.uuid, "b", Status::TaskWaiting).await;

        // Queued back to back, so pool workers race on the same record.
        for i in 0..4 {
            orchestrator
                .notify(&callback(&b, i), json!({"status": "SUCCEEDED"}))
                .unwrap();
        }

        let done = orchestrator.wait_for_completion(&pe.uuid, LIMIT).await.unwrap();
        assert_eq!(done.status, Status::Succeeded);
        let nodes = orchestrator.node_executions(&pe.uuid).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].callback_responses.len(), 4);
        assert!(nodes[0].waiting_on.is_empty());

        let mut concluded = 0;
        while let Ok(event) = events.try_recv() {
            if let OrchestrationEvent::NodeStatusChanged { to, .. } = event
                && to.is_terminal()
            {
                concluded += 1;
            }
        }
        assert_eq!(concluded, 1);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_expressions_and_setup_reach_parameters() {
        let orchestrator = Orchestrator::builder().build();
        let plan = PlanBuilder::new("expr")
            .node(
                PlanNode::new("build", "noop")
                    .with_parameters(json!({"outcomes": {"artifact": {"tag": "v7"}}}))
                    .with_adviser(AdviserObtainment::next_step("deploy")),
            )
            .node(PlanNode::new("deploy", "noop").with_parameters(json!({
                "outcomes": {"image": "app:<+node.build.outcome.artifact.tag>-<+setup.env>"}
            })))
            .build()
            .unwrap();
        let setup = BTreeMap::from([("env".to_string(), "prod".to_string())]);
        let pe = orchestrator
            .start_plan(Principal::user("ci"), plan, setup)
            .await
            .unwrap();

        let done = orchestrator.wait_for_completion(&pe.uuid, LIMIT).await.unwrap();
        assert_eq!(done.status, Status::Succeeded);
        let nodes = orchestrator.node_executions(&pe.uuid).await.unwrap();
        let deploy = by_node(&nodes, "deploy")[0];
        assert_eq!(deploy.outcome("image"), Some(&json!("app:v7-prod")));
        orchestrator.shutdown().await;
    }
}

mod advisers {
    use super::*;

    #[tokio::test]
    async fn test_retry_then_rollback_runs_strategy() {
        let orchestrator = Orchestrator::builder().build();
        let plan = PlanBuilder::new("rollback")
            .node(
                PlanNode::new("deploy", "fail")
                    .with_parameters(json!({"message": "registry unavailable"}))
                    .with_adviser(AdviserObtainment::retry_then_rollback(3, "restore")),
            )
            .node(PlanNode::new("restore", "noop"))
            .build()
            .unwrap();
        let pe = orchestrator
            .start_plan(Principal::user("ci"), plan, BTreeMap::new())
            .await
            .unwrap();

        let done = orchestrator.wait_for_completion(&pe.uuid, LIMIT).await.unwrap();
        assert_eq!(done.status, Status::Succeeded);

        let nodes = orchestrator.node_executions(&pe.uuid).await.unwrap();
        let attempts = by_node(&nodes, "deploy");
        assert_eq!(attempts.len(), 3);
        assert!(attempts[0].old_retry && attempts[1].old_retry);
        assert!(!attempts[2].old_retry);
        assert_eq!(attempts[2].attempt(), 3);
        assert_eq!(
            attempts[2].failure_info.as_ref().unwrap().message,
            "registry unavailable"
        );
        let restore = by_node(&nodes, "restore");
        assert_eq!(restore.len(), 1);
        assert_eq!(restore[0].previous_id.as_deref(), Some(attempts[2].uuid.as_str()));
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_lineage_links_attempts() {
        let orchestrator = Orchestrator::builder().build();
        let plan = PlanBuilder::new("flaky")
            .node(
                PlanNode::new("fetch", "fail")
                    .with_parameters(json!({"fail_attempts": 1}))
                    .with_adviser(AdviserObtainment::retry(2))
                    .with_adviser(AdviserObtainment::next_step("report")),
            )
            .node(PlanNode::new("report", "noop"))
            .build()
            .unwrap();
        let pe = orchestrator
            .start_plan(Principal::user("ci"), plan, BTreeMap::new())
            .await
            .unwrap();

        let done = orchestrator.wait_for_completion(&pe.uuid, LIMIT).await.unwrap();
        assert_eq!(done.status, Status::Succeeded);

        let nodes = orchestrator.node_executions(&pe.uuid).await.unwrap();
        let fetch = by_node(&nodes, "fetch");
        assert_eq!(fetch.len(), 2);
        let (first, second) = (fetch[0], fetch[1]);
        assert_eq!(first.status, Status::Failed);
        assert_eq!(first.retried_by.as_deref(), Some(second.uuid.as_str()));
        assert_eq!(second.retry_ids, vec![first.uuid.clone()]);
        assert_eq!(second.status, Status::Succeeded);
        assert_eq!(by_node(&nodes, "report")[0].previous_id.as_deref(), Some(second.uuid.as_str()));
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_exhausted_retries_keep_full_chain() {
        let orchestrator = Orchestrator::builder().build();
        let plan = PlanBuilder::new("always-fails")
            .node(PlanNode::new("flaky", "fail").with_adviser(AdviserObtainment::retry(4)))
            .build()
            .unwrap();
        let pe = orchestrator
            .start_plan(Principal::user("ci"), plan, BTreeMap::new())
            .await
            .unwrap();

        let done = orchestrator.wait_for_completion(&pe.uuid, LIMIT).await.unwrap();
        assert_eq!(done.status, Status::Failed);

        let nodes = orchestrator.node_executions(&pe.uuid).await.unwrap();
        let attempts = by_node(&nodes, "flaky");
        assert_eq!(attempts.len(), 4);
        let active: Vec<_> = attempts.iter().filter(|ne| !ne.old_retry).collect();
        assert_eq!(active.len(), 1);

        let last = active[0];
        assert_eq!(last.uuid, attempts[3].uuid);
        assert_eq!(last.attempt(), 4);
        assert_eq!(
            last.retry_ids,
            vec![
                attempts[2].uuid.clone(),
                attempts[1].uuid.clone(),
                attempts[0].uuid.clone(),
            ]
        );
        for pair in attempts.windows(2) {
            assert_eq!(pair[0].retried_by.as_deref(), Some(pair[1].uuid.as_str()));
        }
        orchestrator.shutdown().await;
    }
}

mod interrupts {
    use super::*;

    #[tokio::test]
    async fn test_pause_all_then_resume_each_sibling() {
        let orchestrator = Orchestrator::builder().build();
        let plan = PlanBuilder::new("pause")
            .node(PlanNode::new("root", "fork").with_parameters(json!({"children": ["x", "y", "z"]})))
            .node(manual_delegate("x", ExecutionMode::Async, 1))
            .node(manual_delegate("y", ExecutionMode::Async, 1))
            .node(manual_delegate("z", ExecutionMode::Async, 1))
            .build()
            .unwrap();
        let pe = orchestrator
            .start_plan(Principal::user("ci"), plan, BTreeMap::new())
            .await
            .unwrap();

        let mut children = Vec::new();
        for id in ["x", "y", "z"] {
            children.push(wait_for_node(&orchestrator, &pe.uuid, id, Status::AsyncWaiting).await);
        }
        wait_for_node(&orchestrator, &pe.uuid, "root", Status::ChildrenWaiting).await;

        let receipt = orchestrator
            .register_interrupt(
                Principal::user("ops"),
                InterruptPackage::for_plan(&pe.uuid, InterruptType::PauseAll),
            )
            .await
            .unwrap();
        match &receipt.outcome {
            InterruptOutcome::Applied { node_execution_ids } => {
                assert_eq!(node_execution_ids.len(), 3)
            }
            other => panic!("expected PAUSE_ALL to apply, got {:?}", other),
        }

        // Callbacks arriving while paused are kept but do not finish the node.
        for child in &children {
            orchestrator.notify(&callback(child, 0), json!({})).unwrap();
        }
        let store = orchestrator.engine().store();
        for child in &children {
            let ne = wait_for_callbacks(&orchestrator, &child.uuid, 1).await;
            assert_eq!(ne.status, Status::Paused);
            assert_eq!(ne.prior_status, Some(Status::AsyncWaiting));
        }
        let root = wait_for_node(&orchestrator, &pe.uuid, "root", Status::ChildrenWaiting).await;
        assert!(root.interrupt_history.is_empty());

        for child in &children {
            let receipt = orchestrator
                .register_interrupt(
                    Principal::user("ops"),
                    InterruptPackage::for_node(&pe.uuid, &child.uuid, InterruptType::Resume),
                )
                .await
                .unwrap();
            assert!(receipt.outcome.is_applied());
        }

        let done = orchestrator.wait_for_completion(&pe.uuid, LIMIT).await.unwrap();
        assert_eq!(done.status, Status::Succeeded);
        for child in &children {
            let ne = store.get(&child.uuid).await.unwrap().unwrap();
            assert_eq!(ne.status, Status::Succeeded);
            let kinds: Vec<InterruptType> =
                ne.interrupt_history.iter().map(|h| h.interrupt_type).collect();
            assert_eq!(kinds, vec![InterruptType::PauseAll, InterruptType::Resume]);
        }
        assert_eq!(orchestrator.interrupts_for(&pe.uuid).await.unwrap().len(), 4);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_abort_while_waiting_aborts_plan() {
        let orchestrator = Orchestrator::builder().build();
        let plan = PlanBuilder::new("abort")
            .node(PlanNode::new("a", "noop").with_adviser(AdviserObtainment::next_step("b")))
            .node(manual_delegate("b", ExecutionMode::Async, 1))
            .build()
            .unwrap();
        let pe = orchestrator
            .start_plan(Principal::user("ci"), plan, BTreeMap::new())
            .await
            .unwrap();
        let b = wait_for_node(&orchestrator, &pe.uuid, "b", Status::AsyncWaiting).await;

        let receipt = orchestrator
            .register_interrupt(
                Principal::user("ops"),
                InterruptPackage::for_node(&pe.uuid, &b.uuid, InterruptType::Abort),
            )
            .await
            .unwrap();
        assert!(receipt.outcome.is_applied());

        let done = orchestrator.wait_for_completion(&pe.uuid, LIMIT).await.unwrap();
        assert_eq!(done.status, Status::Aborted);
        let aborted = orchestrator.engine().store().get(&b.uuid).await.unwrap().unwrap();
        assert_eq!(aborted.status, Status::Aborted);
        assert_eq!(aborted.failure_info.as_ref().unwrap().kind, FailureKind::Aborted);

        // A late callback changes nothing.
        orchestrator.notify(&callback(&b, 0), json!({})).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after = orchestrator.engine().store().get(&b.uuid).await.unwrap().unwrap();
        assert_eq!(after.status, Status::Aborted);
        assert_eq!(after.version, aborted.version);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_interrupt_reruns_failed_child() {
        let orchestrator = Orchestrator::builder().build();
        let plan = PlanBuilder::new("manual-retry")
            .node(PlanNode::new("root", "fork").with_parameters(json!({"children": ["bad", "slow"]})))
            .node(PlanNode::new("bad", "fail").with_parameters(json!({"fail_attempts": 1})))
            .node(manual_delegate("slow", ExecutionMode::Async, 1))
            .build()
            .unwrap();
        let pe = orchestrator
            .start_plan(Principal::user("ci"), plan, BTreeMap::new())
            .await
            .unwrap();
        let bad = wait_for_node(&orchestrator, &pe.uuid, "bad", Status::Failed).await;
        let slow = wait_for_node(&orchestrator, &pe.uuid, "slow", Status::AsyncWaiting).await;

        let receipt = orchestrator
            .register_interrupt(
                Principal::user("ops"),
                InterruptPackage::for_node(&pe.uuid, &bad.uuid, InterruptType::Retry),
            )
            .await
            .unwrap();
        let new_id = match receipt.outcome {
            InterruptOutcome::Applied { node_execution_ids } => node_execution_ids[0].clone(),
            other => panic!("expected RETRY to apply, got {:?}", other),
        };
        let again = orchestrator
            .register_interrupt(
                Principal::user("ops"),
                InterruptPackage::for_node(&pe.uuid, &bad.uuid, InterruptType::Retry),
            )
            .await
            .unwrap();
        assert!(!again.outcome.is_applied());

        wait_for_node(&orchestrator, &pe.uuid, "bad", Status::Succeeded).await;
        orchestrator.notify(&callback(&slow, 0), json!({})).unwrap();
        let done = orchestrator.wait_for_completion(&pe.uuid, LIMIT).await.unwrap();
        assert_eq!(done.status, Status::Succeeded);

        let store = orchestrator.engine().store();
        let old = store.get(&bad.uuid).await.unwrap().unwrap();
        let new = store.get(&new_id).await.unwrap().unwrap();
        assert!(old.old_retry);
        assert_eq!(old.retried_by.as_deref(), Some(new_id.as_str()));
        assert_eq!(new.retry_ids, vec![bad.uuid.clone()]);
        assert_eq!(new.parent_id, bad.parent_id);
        assert_eq!(new.interrupt_history.len(), 1);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_node_timeout_expires_node() {
        let orchestrator = Orchestrator::builder().build();
        let mut waiting = manual_delegate("b", ExecutionMode::Async, 1);
        waiting.timeout = Some(TimeoutConfig {
            duration: "100ms".to_string(),
        });
        let plan = PlanBuilder::new("expire").node(waiting).build().unwrap();
        let pe = orchestrator
            .start_plan(Principal::user("ci"), plan, BTreeMap::new())
            .await
            .unwrap();

        let done = orchestrator.wait_for_completion(&pe.uuid, LIMIT).await.unwrap();
        assert_eq!(done.status, Status::Expired);
        let nodes = orchestrator.node_executions(&pe.uuid).await.unwrap();
        assert_eq!(nodes[0].status, Status::Expired);
        assert_eq!(nodes[0].failure_info.as_ref().unwrap().kind, FailureKind::Timeout);

        let registered = orchestrator.interrupts_for(&pe.uuid).await.unwrap();
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].interrupt_type, InterruptType::Expire);
        assert_eq!(registered[0].created_by, Principal::system());
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_node_interrupt_without_node_is_rejected() {
        let orchestrator = Orchestrator::builder().build();
        let plan = PlanBuilder::new("p").node(PlanNode::new("a", "noop")).build().unwrap();
        let pe = orchestrator
            .start_plan(Principal::user("ci"), plan, BTreeMap::new())
            .await
            .unwrap();

        let result = orchestrator
            .register_interrupt(
                Principal::user("ops"),
                InterruptPackage::for_plan(&pe.uuid, InterruptType::Abort),
            )
            .await;
        assert!(result.is_err());

        let missing = orchestrator
            .register_interrupt(
                Principal::user("ops"),
                InterruptPackage::for_plan("no-such-plan", InterruptType::PauseAll),
            )
            .await;
        assert!(missing.is_err());
        orchestrator.shutdown().await;
    }
}

mod recovery {
    use super::*;
    use async_trait::async_trait;
    use cadence::errors::StoreError;
    use cadence::store::{InMemoryStore, Mutation, PlanExecutionStore, UpdateResult};
    use cadence_common::{Interrupt, PlanExecution};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// In-memory store whose first insert matching `fails_on` errors out.
    struct FailFirstSave {
        inner: InMemoryStore,
        fails_on: fn(&NodeExecution) -> bool,
        failed: AtomicBool,
    }

    impl FailFirstSave {
        fn new(fails_on: fn(&NodeExecution) -> bool) -> Self {
            Self {
                inner: InMemoryStore::new(),
                fails_on,
                failed: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl NodeExecutionStore for FailFirstSave {
        async fn get(&self, id: &str) -> Result<Option<NodeExecution>, StoreError> {
            self.inner.get(id).await
        }

        async fn save(&self, node_execution: NodeExecution) -> Result<NodeExecution, StoreError> {
            if (self.fails_on)(&node_execution) && !self.failed.swap(true, Ordering::SeqCst) {
                return Err(StoreError::Backend(anyhow::anyhow!("write rejected")));
            }
            self.inner.save(node_execution).await
        }

        async fn conditional_update(
            &self,
            id: &str,
            expected_version: u64,
            mutation: Mutation,
        ) -> Result<UpdateResult, StoreError> {
            self.inner.conditional_update(id, expected_version, mutation).await
        }

        async fn find_by_parent(&self, parent_id: &str) -> Result<Vec<NodeExecution>, StoreError> {
            self.inner.find_by_parent(parent_id).await
        }

        async fn find_by_plan_execution(
            &self,
            plan_execution_id: &str,
            status_filter: Option<&[Status]>,
        ) -> Result<Vec<NodeExecution>, StoreError> {
            self.inner
                .find_by_plan_execution(plan_execution_id, status_filter)
                .await
        }

        async fn find_by_callback_id(
            &self,
            callback_id: &str,
        ) -> Result<Option<NodeExecution>, StoreError> {
            self.inner.find_by_callback_id(callback_id).await
        }
    }

    #[async_trait]
    impl PlanExecutionStore for FailFirstSave {
        async fn save_plan_execution(
            &self,
            plan_execution: PlanExecution,
        ) -> Result<PlanExecution, StoreError> {
            self.inner.save_plan_execution(plan_execution).await
        }

        async fn get_plan_execution(&self, id: &str) -> Result<Option<PlanExecution>, StoreError> {
            self.inner.get_plan_execution(id).await
        }

        async fn conclude_plan_execution(
            &self,
            id: &str,
            status: Status,
        ) -> Result<Option<PlanExecution>, StoreError> {
            self.inner.conclude_plan_execution(id, status).await
        }

        async fn list_plan_executions(&self) -> Result<Vec<PlanExecution>, StoreError> {
            self.inner.list_plan_executions().await
        }

        async fn save_interrupt(&self, interrupt: Interrupt) -> Result<Interrupt, StoreError> {
            self.inner.save_interrupt(interrupt).await
        }

        async fn find_interrupts(
            &self,
            plan_execution_id: &str,
        ) -> Result<Vec<Interrupt>, StoreError> {
            self.inner.find_interrupts(plan_execution_id).await
        }
    }

    #[tokio::test]
    async fn test_next_step_survives_failed_successor_write() {
        let store = Arc::new(FailFirstSave::new(|ne| ne.node_id == "b"));
        let orchestrator = Orchestrator::builder().store(store.clone()).build();
        let plan = PlanBuilder::new("seq")
            .node(PlanNode::new("a", "noop").with_adviser(AdviserObtainment::next_step("b")))
            .node(PlanNode::new("b", "noop"))
            .build()
            .unwrap();
        let pe = orchestrator
            .start_plan(Principal::user("ci"), plan, BTreeMap::new())
            .await
            .unwrap();

        let done = orchestrator.wait_for_completion(&pe.uuid, LIMIT).await.unwrap();
        assert_eq!(done.status, Status::Succeeded);
        assert!(store.failed.load(Ordering::SeqCst));

        let nodes = orchestrator.node_executions(&pe.uuid).await.unwrap();
        assert_eq!(nodes.len(), 2);
        let a = by_node(&nodes, "a")[0];
        let b = by_node(&nodes, "b")[0];
        assert_eq!(a.next_id.as_deref(), Some(b.uuid.as_str()));
        assert_eq!(b.previous_id.as_deref(), Some(a.uuid.as_str()));
        assert_eq!(b.status, Status::Succeeded);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_survives_failed_attempt_write() {
        let store = Arc::new(FailFirstSave::new(|ne| !ne.retry_ids.is_empty()));
        let orchestrator = Orchestrator::builder().store(store.clone()).build();
        let plan = PlanBuilder::new("flaky")
            .node(
                PlanNode::new("fetch", "fail")
                    .with_parameters(json!({"fail_attempts": 1}))
                    .with_adviser(AdviserObtainment::retry(2)),
            )
            .build()
            .unwrap();
        let pe = orchestrator
            .start_plan(Principal::user("ci"), plan, BTreeMap::new())
            .await
            .unwrap();

        let done = orchestrator.wait_for_completion(&pe.uuid, LIMIT).await.unwrap();
        assert_eq!(done.status, Status::Succeeded);
        assert!(store.failed.load(Ordering::SeqCst));

        let nodes = orchestrator.node_executions(&pe.uuid).await.unwrap();
        let attempts = by_node(&nodes, "fetch");
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].retried_by.as_deref(), Some(attempts[1].uuid.as_str()));
        assert_eq!(attempts[1].retry_ids, vec![attempts[0].uuid.clone()]);
        assert_eq!(attempts[1].status, Status::Succeeded);
        orchestrator.shutdown().await;
    }
}

mod persistence {
    use super::*;
    use cadence::store::{Mutation, UpdateResult};

    #[tokio::test]
    async fn test_sqlite_store_keeps_finished_run() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("executions.db");

        let plan_execution_id = {
            let store = SqliteStore::open(&db).unwrap();
            let orchestrator = Orchestrator::builder().store(Arc::new(store)).build();
            let plan = PlanBuilder::new("durable")
                .node(PlanNode::new("a", "noop").with_adviser(AdviserObtainment::next_step("b")))
                .node(
                    PlanNode::new("b", "delegate")
                        .with_facilitators(vec![ExecutionMode::TaskChain])
                        .with_parameters(json!({"links": 2, "delay_ms": 1})),
                )
                .build()
                .unwrap();
            let pe = orchestrator
                .start_plan(Principal::user("ci"), plan, BTreeMap::new())
                .await
                .unwrap();
            let done = orchestrator.wait_for_completion(&pe.uuid, LIMIT).await.unwrap();
            assert_eq!(done.status, Status::Succeeded);
            orchestrator.shutdown().await;
            pe.uuid
        };

        let reopened = Orchestrator::builder()
            .store(Arc::new(SqliteStore::open(&db).unwrap()))
            .build();
        let pe = reopened.plan_execution(&plan_execution_id).await.unwrap();
        assert_eq!(pe.status, Status::Succeeded);
        assert!(pe.end_ts.is_some());

        let nodes = reopened.node_executions(&plan_execution_id).await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].node_id, "a");
        let chain = &nodes[1];
        assert_eq!(chain.status, Status::Succeeded);
        assert_eq!(chain.executable_responses.len(), 2);
        reopened.shutdown().await;
    }

    #[tokio::test]
    async fn test_racing_conditional_updates_have_one_winner() {
        let store = SqliteStore::in_memory().unwrap();
        let ambiance = cadence_common::Ambiance {
            plan_execution_id: "pe".to_string(),
            setup_abstractions: BTreeMap::new(),
            levels: Vec::new(),
        };
        let mut ne = NodeExecution::queued("pe", "a", ambiance);
        ne.uuid = "n1".to_string();
        let saved = store.save(ne).await.unwrap();

        let attempts = (0..8).map(|i| {
            let mutation: Mutation = Box::new(move |ne: &mut NodeExecution| {
                ne.callback_responses.insert(format!("writer-{}", i), json!(i));
            });
            store.conditional_update("n1", saved.version, mutation)
        });
        let results = futures::future::join_all(attempts).await;

        let winners = results
            .iter()
            .filter(|r| matches!(r, Ok(UpdateResult::Applied(_))))
            .count();
        assert_eq!(winners, 1);
        let stored = store.get("n1").await.unwrap().unwrap();
        assert_eq!(stored.version, saved.version + 1);
        assert_eq!(stored.callback_responses.len(), 1);
    }
}
