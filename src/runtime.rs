//! The `Orchestrator`: one engine, its worker pool, interrupts and timeouts
//! wired together behind a small async API.
//!
//! ```ignore
//! let orchestrator = OrchestratorBuilder::new().build();
//! let pe = orchestrator.start_plan(Principal::user("ci"), plan, setup).await?;
//! let pe = orchestrator.wait_for_completion(&pe.uuid, Duration::from_secs(60)).await?;
//! orchestrator.shutdown().await;
//! ```

use crate::engine::{
    DispatchHandle, DispatchUnit, Dispatcher, EngineConfig, EngineParts, EventBus,
    OrchestrationEngine, OrchestrationEvent,
};
use crate::errors::{EngineError, InterruptError};
use crate::expression::{ExpressionResolver, TemplateResolver};
use crate::facilitator::FacilitatorRegistry;
use crate::interrupt::{InterruptManager, InterruptReceipt};
use crate::step::{StepHandler, StepRegistry};
use crate::steps::builtin_registry;
use crate::store::{ExecutionStore, InMemoryStore};
use crate::timeout::{TimeoutExpiry, TokioTimeoutTracker};
use cadence_common::{
    Interrupt, InterruptPackage, InterruptType, NodeExecution, Plan, PlanExecution, Principal,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

pub struct OrchestratorBuilder {
    store: Option<Arc<dyn ExecutionStore>>,
    steps: StepRegistry,
    facilitators: FacilitatorRegistry,
    resolver: Arc<dyn ExpressionResolver>,
    config: EngineConfig,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorBuilder {
    /// Built-in steps, every execution mode, template expressions and an
    /// in-memory store.
    pub fn new() -> Self {
        Self {
            store: None,
            steps: builtin_registry(),
            facilitators: FacilitatorRegistry::default(),
            resolver: Arc::new(TemplateResolver::new()),
            config: EngineConfig::default(),
        }
    }

    pub fn store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Add or replace one step handler.
    pub fn step(mut self, handler: Arc<dyn StepHandler>) -> Self {
        self.steps.register(handler);
        self
    }

    /// Replace the whole step registry.
    pub fn steps(mut self, steps: StepRegistry) -> Self {
        self.steps = steps;
        self
    }

    pub fn facilitators(mut self, facilitators: FacilitatorRegistry) -> Self {
        self.facilitators = facilitators;
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn ExpressionResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Assemble the engine and start its worker pool. Must be called inside
    /// a tokio runtime.
    pub fn build(self) -> Orchestrator {
        let (dispatch, queue) = DispatchHandle::channel();
        let (timeouts, expiries) = TokioTimeoutTracker::new();
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()));

        let engine = Arc::new(OrchestrationEngine::new(
            EngineParts {
                store,
                steps: Arc::new(self.steps),
                facilitators: Arc::new(self.facilitators),
                resolver: self.resolver,
                timeouts: Arc::new(timeouts),
                dispatch: dispatch.clone(),
                events: EventBus::new(self.config.event_buffer),
            },
            self.config.clone(),
        ));
        let interrupts = Arc::new(InterruptManager::new(engine.clone()));
        let dispatcher = Dispatcher::spawn(
            engine.clone(),
            queue,
            dispatch,
            self.config.dispatcher_config(),
        );
        let expiry_forwarder = tokio::spawn(forward_expiries(
            engine.clone(),
            interrupts.clone(),
            expiries,
        ));

        tracing::debug!(
            max_workers = self.config.max_workers,
            step_types = ?engine.steps().step_types(),
            "Orchestrator started"
        );
        Orchestrator {
            engine,
            interrupts,
            dispatcher,
            expiry_forwarder,
        }
    }
}

/// Turn elapsed deadlines into EXPIRE interrupts issued by the system.
async fn forward_expiries(
    engine: Arc<OrchestrationEngine>,
    interrupts: Arc<InterruptManager>,
    mut expiries: mpsc::UnboundedReceiver<TimeoutExpiry>,
) {
    while let Some(expiry) = expiries.recv().await {
        // A deadline registered for an earlier run of the node is stale.
        let current = match engine.store().get(&expiry.node_execution_id).await {
            Ok(Some(ne)) => ne.timeout_instance_id == Some(expiry.instance_id.clone()),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(error = %e, "Could not load node execution for expired timeout");
                false
            }
        };
        if !current {
            continue;
        }

        tracing::info!(
            plan_execution_id = %expiry.plan_execution_id,
            node_execution_id = %expiry.node_execution_id,
            "Node timeout elapsed"
        );
        let package = InterruptPackage::for_node(
            expiry.plan_execution_id,
            expiry.node_execution_id,
            InterruptType::Expire,
        );
        if let Err(e) = interrupts.register(Principal::system(), package).await {
            tracing::warn!(error = %e, "EXPIRE interrupt failed");
        }
    }
}

pub struct Orchestrator {
    engine: Arc<OrchestrationEngine>,
    interrupts: Arc<InterruptManager>,
    dispatcher: Dispatcher,
    expiry_forwarder: JoinHandle<()>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn engine(&self) -> &Arc<OrchestrationEngine> {
        &self.engine
    }

    pub async fn start_plan(
        &self,
        principal: Principal,
        plan: Plan,
        setup_abstractions: BTreeMap<String, String>,
    ) -> Result<PlanExecution, EngineError> {
        self.engine
            .start_plan(principal, plan, setup_abstractions)
            .await
    }

    pub async fn register_interrupt(
        &self,
        principal: Principal,
        package: InterruptPackage,
    ) -> Result<InterruptReceipt, InterruptError> {
        self.interrupts.register(principal, package).await
    }

    /// Queue a callback for a known node execution.
    ///
    /// Delivery runs on the worker pool like every other unit, so a write
    /// conflict is requeued instead of reaching the caller.
    pub fn resume_node(
        &self,
        node_execution_id: &str,
        callback_id: &str,
        payload: Value,
    ) -> Result<(), EngineError> {
        self.engine.dispatch().submit(DispatchUnit::Resume {
            node_execution_id: node_execution_id.to_string(),
            callback_id: callback_id.to_string(),
            payload,
        })
    }

    /// Queue a callback identified by its id alone.
    pub fn notify(&self, callback_id: &str, payload: Value) -> Result<(), EngineError> {
        self.engine.dispatch().submit(DispatchUnit::Notify {
            callback_id: callback_id.to_string(),
            payload,
        })
    }

    pub async fn plan_execution(&self, id: &str) -> Result<PlanExecution, EngineError> {
        self.engine.plan_execution(id).await
    }

    /// Every node execution of a plan execution, in creation order.
    pub async fn node_executions(
        &self,
        plan_execution_id: &str,
    ) -> Result<Vec<NodeExecution>, EngineError> {
        Ok(self
            .engine
            .store()
            .find_by_plan_execution(plan_execution_id, None)
            .await?)
    }

    pub async fn interrupts_for(
        &self,
        plan_execution_id: &str,
    ) -> Result<Vec<Interrupt>, InterruptError> {
        self.interrupts.interrupts_for(plan_execution_id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestrationEvent> {
        self.engine.events().subscribe()
    }

    /// Wait until the plan execution reaches a terminal status.
    pub async fn wait_for_completion(
        &self,
        plan_execution_id: &str,
        limit: Duration,
    ) -> Result<PlanExecution, EngineError> {
        let mut events = self.subscribe();
        let wait = async {
            loop {
                let pe = self.plan_execution(plan_execution_id).await?;
                if pe.is_finished() {
                    return Ok(pe);
                }
                loop {
                    match events.recv().await {
                        Ok(OrchestrationEvent::PlanCompleted {
                            plan_execution_id: done,
                            ..
                        }) if done == plan_execution_id => break,
                        Ok(_) => continue,
                        // Missed events; re-read the store.
                        Err(broadcast::error::RecvError::Lagged(_)) => break,
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(EngineError::DispatcherClosed);
                        }
                    }
                }
            }
        };

        tokio::time::timeout(limit, wait)
            .await
            .map_err(|_| EngineError::WaitTimedOut {
                id: plan_execution_id.to_string(),
                waited_ms: limit.as_millis() as u64,
            })?
    }

    /// Stop the timeout forwarder and drain the worker pool.
    pub async fn shutdown(self) {
        self.expiry_forwarder.abort();
        self.dispatcher.shutdown().await;
        tracing::debug!("Orchestrator stopped");
    }
}
