//! Node and plan execution persistence.
//!
//! The store is the single source of truth for execution state. Every
//! mutation of an existing node execution goes through
//! [`NodeExecutionStore::conditional_update`], a compare-and-swap on the
//! record's version; [`update_with_retry`] wraps it in the bounded
//! read-compute-write loop used by the engine and interrupt handlers.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use crate::errors::{EngineError, StoreError};
use async_trait::async_trait;
use cadence_common::{Interrupt, NodeExecution, PlanExecution, Status};

/// A change applied to a node execution inside a conditional update.
pub type Mutation = Box<dyn FnOnce(&mut NodeExecution) + Send>;

/// Result of a conditional update.
#[derive(Debug, Clone)]
pub enum UpdateResult {
    /// The mutation was applied; carries the new record (version bumped).
    Applied(NodeExecution),
    /// The stored version differed; carries the current record untouched.
    Conflict(NodeExecution),
}

#[async_trait]
pub trait NodeExecutionStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<NodeExecution>, StoreError>;

    /// Insert a new record. Fails with `Duplicate` if the id exists.
    async fn save(&self, node_execution: NodeExecution) -> Result<NodeExecution, StoreError>;

    /// Apply `mutation` only if the stored version equals `expected_version`.
    /// The version is incremented on success.
    async fn conditional_update(
        &self,
        id: &str,
        expected_version: u64,
        mutation: Mutation,
    ) -> Result<UpdateResult, StoreError>;

    async fn find_by_parent(&self, parent_id: &str) -> Result<Vec<NodeExecution>, StoreError>;

    /// All node executions of a plan execution, optionally restricted to the
    /// given statuses, in creation order.
    async fn find_by_plan_execution(
        &self,
        plan_execution_id: &str,
        status_filter: Option<&[Status]>,
    ) -> Result<Vec<NodeExecution>, StoreError>;

    /// The node execution that issued `callback_id`, if any.
    async fn find_by_callback_id(
        &self,
        callback_id: &str,
    ) -> Result<Option<NodeExecution>, StoreError>;
}

#[async_trait]
pub trait PlanExecutionStore: Send + Sync {
    async fn save_plan_execution(
        &self,
        plan_execution: PlanExecution,
    ) -> Result<PlanExecution, StoreError>;

    async fn get_plan_execution(&self, id: &str) -> Result<Option<PlanExecution>, StoreError>;

    /// Move a running plan execution to a terminal status.
    ///
    /// Returns the updated record when this call concluded it, `None` when it
    /// was already terminal.
    async fn conclude_plan_execution(
        &self,
        id: &str,
        status: Status,
    ) -> Result<Option<PlanExecution>, StoreError>;

    async fn list_plan_executions(&self) -> Result<Vec<PlanExecution>, StoreError>;

    /// Append an interrupt to its plan execution's log.
    async fn save_interrupt(&self, interrupt: Interrupt) -> Result<Interrupt, StoreError>;

    /// Interrupts registered against a plan execution, oldest first.
    async fn find_interrupts(&self, plan_execution_id: &str)
    -> Result<Vec<Interrupt>, StoreError>;
}

/// Both halves of the execution store.
pub trait ExecutionStore: NodeExecutionStore + PlanExecutionStore {}

impl<T: NodeExecutionStore + PlanExecutionStore> ExecutionStore for T {}

/// Outcome of [`update_with_retry`].
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    Applied(NodeExecution),
    /// The compute step declined to change the record.
    Skipped(NodeExecution),
}

impl UpdateOutcome {
    pub fn node_execution(&self) -> &NodeExecution {
        match self {
            Self::Applied(ne) | Self::Skipped(ne) => ne,
        }
    }

    pub fn into_node_execution(self) -> NodeExecution {
        match self {
            Self::Applied(ne) | Self::Skipped(ne) => ne,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Read, compute and conditionally write a node execution.
///
/// `compute` sees the latest record and returns the mutation to apply, or
/// `None` to leave it unchanged. On a version conflict the mutation is
/// recomputed against the record that won, up to `max_conflict_retries`
/// times; after that the caller gets [`EngineError::Conflict`] and is
/// expected to requeue.
pub async fn update_with_retry<S, F>(
    store: &S,
    id: &str,
    max_conflict_retries: u32,
    mut compute: F,
) -> Result<UpdateOutcome, EngineError>
where
    S: NodeExecutionStore + ?Sized,
    F: FnMut(&NodeExecution) -> Option<Mutation> + Send,
{
    let mut current = store
        .get(id)
        .await?
        .ok_or_else(|| EngineError::NodeExecutionNotFound { id: id.to_string() })?;
    let mut conflicts = 0;

    loop {
        let Some(mutation) = compute(&current) else {
            return Ok(UpdateOutcome::Skipped(current));
        };

        match store
            .conditional_update(id, current.version, mutation)
            .await?
        {
            UpdateResult::Applied(updated) => return Ok(UpdateOutcome::Applied(updated)),
            UpdateResult::Conflict(latest) => {
                conflicts += 1;
                tracing::debug!(
                    node_execution_id = %id,
                    expected = current.version,
                    found = latest.version,
                    conflicts,
                    "Version conflict on node execution"
                );
                if conflicts > max_conflict_retries {
                    tracing::warn!(
                        node_execution_id = %id,
                        conflicts,
                        "Giving up on conflicting update"
                    );
                    return Err(EngineError::Conflict {
                        node_execution_id: id.to_string(),
                    });
                }
                current = latest;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_common::Ambiance;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    pub(crate) fn sample(id: &str, plan_execution_id: &str) -> NodeExecution {
        let mut ne = NodeExecution::queued(
            plan_execution_id,
            "node",
            Ambiance {
                plan_execution_id: plan_execution_id.to_string(),
                setup_abstractions: BTreeMap::new(),
                levels: Vec::new(),
            },
        );
        ne.uuid = id.to_string();
        ne
    }

    /// Store that lets another writer sneak in before the first N updates.
    struct RacingStore {
        inner: InMemoryStore,
        races_left: AtomicU32,
    }

    #[async_trait]
    impl NodeExecutionStore for RacingStore {
        async fn get(&self, id: &str) -> Result<Option<NodeExecution>, StoreError> {
            self.inner.get(id).await
        }

        async fn save(&self, ne: NodeExecution) -> Result<NodeExecution, StoreError> {
            self.inner.save(ne).await
        }

        async fn conditional_update(
            &self,
            id: &str,
            expected_version: u64,
            mutation: Mutation,
        ) -> Result<UpdateResult, StoreError> {
            if self.races_left.load(Ordering::SeqCst) > 0 {
                self.races_left.fetch_sub(1, Ordering::SeqCst);
                let current = self.inner.get(id).await?.ok_or(StoreError::NotFound {
                    id: id.to_string(),
                })?;
                self.inner
                    .conditional_update(
                        id,
                        current.version,
                        Box::new(|ne: &mut NodeExecution| ne.outcomes.clear()),
                    )
                    .await?;
            }
            self.inner
                .conditional_update(id, expected_version, mutation)
                .await
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

    #[tokio::test]
    async fn test_update_with_retry_recomputes_after_one_conflict() {
        let store = RacingStore {
            inner: InMemoryStore::new(),
            races_left: AtomicU32::new(1),
        };
        store.save(sample("ne", "pe")).await.unwrap();

        let computed = Arc::new(AtomicU32::new(0));
        let counter = computed.clone();
        let outcome = update_with_retry(&store, "ne", 1, |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Some(Box::new(|ne: &mut NodeExecution| ne.set_status(Status::Running)) as Mutation)
        })
        .await
        .unwrap();

        assert!(outcome.is_applied());
        assert_eq!(outcome.node_execution().status, Status::Running);
        assert_eq!(outcome.node_execution().version, 2);
        assert_eq!(computed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_update_with_retry_gives_up_after_bound() {
        let store = RacingStore {
            inner: InMemoryStore::new(),
            races_left: AtomicU32::new(5),
        };
        store.save(sample("ne", "pe")).await.unwrap();

        let result = update_with_retry(&store, "ne", 1, |_| {
            Some(Box::new(|ne: &mut NodeExecution| ne.set_status(Status::Running)) as Mutation)
        })
        .await;
        assert!(matches!(result, Err(EngineError::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_update_with_retry_skip_and_missing() {
        let store = InMemoryStore::new();
        store.save(sample("ne", "pe")).await.unwrap();

        let outcome = update_with_retry(&store, "ne", 1, |_| None).await.unwrap();
        assert!(!outcome.is_applied());
        assert_eq!(outcome.node_execution().version, 0);

        let missing = update_with_retry(&store, "nope", 1, |_| None).await;
        assert!(matches!(
            missing,
            Err(EngineError::NodeExecutionNotFound { .. })
        ));
    }
}
