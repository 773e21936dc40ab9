//! In-memory execution store for tests, the CLI and embedding.

use super::{Mutation, NodeExecutionStore, PlanExecutionStore, UpdateResult};
use crate::errors::StoreError;
use async_trait::async_trait;
use cadence_common::{Interrupt, NodeExecution, PlanExecution, Status};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Default)]
struct NodeTable {
    records: HashMap<String, NodeExecution>,
    /// Insertion order, for stable listings
    order: Vec<String>,
}

pub struct InMemoryStore {
    nodes: RwLock<NodeTable>,
    plans: RwLock<HashMap<String, PlanExecution>>,
    interrupts: RwLock<HashMap<String, Vec<Interrupt>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(NodeTable::default()),
            plans: RwLock::new(HashMap::new()),
            interrupts: RwLock::new(HashMap::new()),
        }
    }

    fn collect<F>(&self, filter: F) -> Result<Vec<NodeExecution>, StoreError>
    where
        F: Fn(&NodeExecution) -> bool,
    {
        let table = self.nodes.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(table
            .order
            .iter()
            .filter_map(|id| table.records.get(id))
            .filter(|ne| filter(ne))
            .cloned()
            .collect())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeExecutionStore for InMemoryStore {
    async fn get(&self, id: &str) -> Result<Option<NodeExecution>, StoreError> {
        let table = self.nodes.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(table.records.get(id).cloned())
    }

    async fn save(&self, node_execution: NodeExecution) -> Result<NodeExecution, StoreError> {
        let mut table = self.nodes.write().map_err(|_| StoreError::LockPoisoned)?;
        if table.records.contains_key(&node_execution.uuid) {
            return Err(StoreError::Duplicate {
                id: node_execution.uuid,
            });
        }
        table.order.push(node_execution.uuid.clone());
        table
            .records
            .insert(node_execution.uuid.clone(), node_execution.clone());
        Ok(node_execution)
    }

    async fn conditional_update(
        &self,
        id: &str,
        expected_version: u64,
        mutation: Mutation,
    ) -> Result<UpdateResult, StoreError> {
        let mut table = self.nodes.write().map_err(|_| StoreError::LockPoisoned)?;
        let record = table
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;

        if record.version != expected_version {
            return Ok(UpdateResult::Conflict(record.clone()));
        }

        mutation(record);
        record.uuid = id.to_string();
        record.version = expected_version + 1;
        Ok(UpdateResult::Applied(record.clone()))
    }

    async fn find_by_parent(&self, parent_id: &str) -> Result<Vec<NodeExecution>, StoreError> {
        self.collect(|ne| ne.parent_id.as_deref() == Some(parent_id))
    }

    async fn find_by_plan_execution(
        &self,
        plan_execution_id: &str,
        status_filter: Option<&[Status]>,
    ) -> Result<Vec<NodeExecution>, StoreError> {
        self.collect(|ne| {
            ne.plan_execution_id == plan_execution_id
                && status_filter.is_none_or(|statuses| statuses.contains(&ne.status))
        })
    }

    async fn find_by_callback_id(
        &self,
        callback_id: &str,
    ) -> Result<Option<NodeExecution>, StoreError> {
        let matches = self.collect(|ne| {
            ne.waiting_on.contains(callback_id)
                || ne
                    .executable_responses
                    .iter()
                    .any(|r| r.callback_ids().iter().any(|c| c == callback_id))
        })?;
        Ok(matches.into_iter().next())
    }
}

#[async_trait]
impl PlanExecutionStore for InMemoryStore {
    async fn save_plan_execution(
        &self,
        plan_execution: PlanExecution,
    ) -> Result<PlanExecution, StoreError> {
        let mut plans = self.plans.write().map_err(|_| StoreError::LockPoisoned)?;
        if plans.contains_key(&plan_execution.uuid) {
            return Err(StoreError::Duplicate {
                id: plan_execution.uuid,
            });
        }
        plans.insert(plan_execution.uuid.clone(), plan_execution.clone());
        Ok(plan_execution)
    }

    async fn get_plan_execution(&self, id: &str) -> Result<Option<PlanExecution>, StoreError> {
        let plans = self.plans.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(plans.get(id).cloned())
    }

    async fn conclude_plan_execution(
        &self,
        id: &str,
        status: Status,
    ) -> Result<Option<PlanExecution>, StoreError> {
        let mut plans = self.plans.write().map_err(|_| StoreError::LockPoisoned)?;
        let plan = plans
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        if plan.is_finished() {
            return Ok(None);
        }
        plan.finish(status);
        plan.version += 1;
        Ok(Some(plan.clone()))
    }

    async fn list_plan_executions(&self) -> Result<Vec<PlanExecution>, StoreError> {
        let plans = self.plans.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut all: Vec<PlanExecution> = plans.values().cloned().collect();
        all.sort_by_key(|p| p.created_at);
        Ok(all)
    }

    async fn save_interrupt(&self, interrupt: Interrupt) -> Result<Interrupt, StoreError> {
        let mut log = self.interrupts.write().map_err(|_| StoreError::LockPoisoned)?;
        let entries = log.entry(interrupt.plan_execution_id.clone()).or_default();
        if entries.iter().any(|i| i.uuid == interrupt.uuid) {
            return Err(StoreError::Duplicate { id: interrupt.uuid });
        }
        entries.push(interrupt.clone());
        Ok(interrupt)
    }

    async fn find_interrupts(
        &self,
        plan_execution_id: &str,
    ) -> Result<Vec<Interrupt>, StoreError> {
        let log = self.interrupts.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(log.get(plan_execution_id).cloned().unwrap_or_default())
    }
}
