//! The orchestration engine.
//!
//! Every change to a node execution happens inside a dispatch unit run by
//! the [`Dispatcher`](dispatcher::Dispatcher) worker pool. Units are small:
//! start a node, record one callback, react to one child finishing, apply
//! one advise. A node waiting on callbacks or children holds no worker.

pub mod dispatcher;
pub mod events;
mod orchestration;

pub use dispatcher::{
    DispatchHandle, DispatchQueue, DispatchTarget, DispatchUnit, Dispatcher, DispatcherConfig,
};
pub use events::{EventBus, OrchestrationEvent};

use crate::expression::ExpressionResolver;
use crate::facilitator::FacilitatorRegistry;
use crate::retry::RetryHelper;
use crate::step::StepRegistry;
use crate::store::ExecutionStore;
use crate::timeout::TimeoutTracker;
use cadence_common::Plan;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Dispatch units processed concurrently
    pub max_workers: usize,
    /// Re-reads after a version conflict before a unit is requeued
    pub max_conflict_retries: u32,
    pub requeue_delay: Duration,
    /// Requeues before a conflicting unit is dropped
    pub max_requeues: u32,
    pub event_buffer: usize,
    /// Timeout for nodes that declare none
    pub default_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            max_conflict_retries: 1,
            requeue_delay: Duration::from_millis(50),
            max_requeues: 5,
            event_buffer: 1024,
            default_timeout: None,
        }
    }
}

impl EngineConfig {
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            max_workers: self.max_workers.max(1),
            max_requeues: self.max_requeues,
            requeue_delay: self.requeue_delay,
        }
    }
}

/// Collaborators the engine is assembled from.
pub struct EngineParts {
    pub store: Arc<dyn ExecutionStore>,
    pub steps: Arc<StepRegistry>,
    pub facilitators: Arc<FacilitatorRegistry>,
    pub resolver: Arc<dyn ExpressionResolver>,
    pub timeouts: Arc<dyn TimeoutTracker>,
    pub dispatch: DispatchHandle,
    pub events: EventBus,
}

pub struct OrchestrationEngine {
    store: Arc<dyn ExecutionStore>,
    steps: Arc<StepRegistry>,
    facilitators: Arc<FacilitatorRegistry>,
    resolver: Arc<dyn ExpressionResolver>,
    timeouts: Arc<dyn TimeoutTracker>,
    dispatch: DispatchHandle,
    events: EventBus,
    retry: RetryHelper,
    /// Plans of running executions, loaded from the store on a miss
    plans: DashMap<String, Arc<Plan>>,
    config: EngineConfig,
}

impl OrchestrationEngine {
    pub fn new(parts: EngineParts, config: EngineConfig) -> Self {
        let retry = RetryHelper::new(
            parts.store.clone(),
            parts.dispatch.clone(),
            config.max_conflict_retries,
        );
        Self {
            store: parts.store,
            steps: parts.steps,
            facilitators: parts.facilitators,
            resolver: parts.resolver,
            timeouts: parts.timeouts,
            dispatch: parts.dispatch,
            events: parts.events,
            retry,
            plans: DashMap::new(),
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn dispatch(&self) -> &DispatchHandle {
        &self.dispatch
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn retry_helper(&self) -> &RetryHelper {
        &self.retry
    }

    pub fn steps(&self) -> &StepRegistry {
        &self.steps
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
