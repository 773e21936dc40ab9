//! SQLite-backed execution store.
//!
//! Records are kept as JSON bodies next to the columns the finders filter
//! on. The version compare-and-swap runs inside one transaction while the
//! connection mutex is held.

use super::{Mutation, NodeExecutionStore, PlanExecutionStore, UpdateResult};
use crate::errors::StoreError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use cadence_common::{Interrupt, NodeExecution, PlanExecution, Status};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;

/// Async-safe handle to the execution database.
///
/// Wraps `ExecutionDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<ExecutionDb>>,
}

impl DbHandle {
    pub fn new(db: ExecutionDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&ExecutionDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct ExecutionDb {
    conn: Connection,
}

impl ExecutionDb {
    /// Open (or create) a database at `path` and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.run_migrations()?;
        Ok(db)
    }

    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS plan_executions (
                    uuid TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    body TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS node_executions (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    uuid TEXT NOT NULL UNIQUE,
                    plan_execution_id TEXT NOT NULL,
                    parent_id TEXT,
                    status TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    body TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS node_callbacks (
                    callback_id TEXT PRIMARY KEY,
                    node_execution_id TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS interrupts (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    uuid TEXT NOT NULL UNIQUE,
                    plan_execution_id TEXT NOT NULL,
                    body TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_interrupts_plan
                    ON interrupts(plan_execution_id);
                CREATE INDEX IF NOT EXISTS idx_node_executions_plan
                    ON node_executions(plan_execution_id);
                CREATE INDEX IF NOT EXISTS idx_node_executions_parent
                    ON node_executions(parent_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    pub fn get_node(&self, id: &str) -> Result<Option<NodeExecution>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM node_executions WHERE uuid = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query node execution")?;
        body.map(|b| serde_json::from_str(&b).context("Corrupt node execution body"))
            .transpose()
    }

    /// Insert a node execution; `false` if the id is taken.
    pub fn insert_node(&self, ne: &NodeExecution) -> Result<bool> {
        let body = serde_json::to_string(ne)?;
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO node_executions
                    (uuid, plan_execution_id, parent_id, status, version, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    ne.uuid,
                    ne.plan_execution_id,
                    ne.parent_id,
                    ne.status.as_str(),
                    ne.version as i64,
                    body
                ],
            )
            .context("Failed to insert node execution")?;
        if inserted == 1 {
            self.index_callbacks(ne)?;
        }
        Ok(inserted == 1)
    }

    /// Compare-and-swap on `version`. `None` if the record does not exist.
    pub fn update_node(
        &self,
        id: &str,
        expected_version: u64,
        mutation: Mutation,
    ) -> Result<Option<UpdateResult>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let Some(mut current) = self.get_node(id)? else {
            return Ok(None);
        };
        if current.version != expected_version {
            return Ok(Some(UpdateResult::Conflict(current)));
        }

        mutation(&mut current);
        current.uuid = id.to_string();
        current.version = expected_version + 1;

        let body = serde_json::to_string(&current)?;
        let updated = tx
            .execute(
                "UPDATE node_executions
                 SET status = ?1, parent_id = ?2, version = ?3, body = ?4
                 WHERE uuid = ?5 AND version = ?6",
                params![
                    current.status.as_str(),
                    current.parent_id,
                    current.version as i64,
                    body,
                    id,
                    expected_version as i64
                ],
            )
            .context("Failed to update node execution")?;
        if updated != 1 {
            anyhow::bail!("Node execution {} changed during update", id);
        }
        self.index_callbacks(&current)?;
        tx.commit().context("Failed to commit node execution update")?;

        Ok(Some(UpdateResult::Applied(current)))
    }

    fn index_callbacks(&self, ne: &NodeExecution) -> Result<()> {
        for response in &ne.executable_responses {
            for callback_id in response.callback_ids() {
                self.conn
                    .execute(
                        "INSERT OR IGNORE INTO node_callbacks (callback_id, node_execution_id)
                         VALUES (?1, ?2)",
                        params![callback_id, ne.uuid],
                    )
                    .context("Failed to index callback id")?;
            }
        }
        Ok(())
    }

    fn query_nodes(&self, sql: &str, key: &str) -> Result<Vec<NodeExecution>> {
        let mut stmt = self.conn.prepare(sql)?;
        let bodies = stmt
            .query_map(params![key], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).context("Corrupt node execution body"))
            .collect()
    }

    pub fn nodes_by_parent(&self, parent_id: &str) -> Result<Vec<NodeExecution>> {
        self.query_nodes(
            "SELECT body FROM node_executions WHERE parent_id = ?1 ORDER BY seq",
            parent_id,
        )
    }

    pub fn nodes_by_plan_execution(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
        self.query_nodes(
            "SELECT body FROM node_executions WHERE plan_execution_id = ?1 ORDER BY seq",
            plan_execution_id,
        )
    }

    pub fn node_by_callback(&self, callback_id: &str) -> Result<Option<NodeExecution>> {
        let owner: Option<String> = self
            .conn
            .query_row(
                "SELECT node_execution_id FROM node_callbacks WHERE callback_id = ?1",
                params![callback_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query callback index")?;
        match owner {
            Some(id) => self.get_node(&id),
            None => Ok(None),
        }
    }

    pub fn insert_plan(&self, pe: &PlanExecution) -> Result<bool> {
        let body = serde_json::to_string(pe)?;
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO plan_executions (uuid, status, version, created_at, body)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    pe.uuid,
                    pe.status.as_str(),
                    pe.version as i64,
                    pe.created_at.to_rfc3339(),
                    body
                ],
            )
            .context("Failed to insert plan execution")?;
        Ok(inserted == 1)
    }

    pub fn get_plan(&self, id: &str) -> Result<Option<PlanExecution>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM plan_executions WHERE uuid = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query plan execution")?;
        body.map(|b| serde_json::from_str(&b).context("Corrupt plan execution body"))
            .transpose()
    }

    /// `Ok(None)` if missing, `Ok(Some(None))` if already terminal.
    pub fn conclude_plan(&self, id: &str, status: Status) -> Result<Option<Option<PlanExecution>>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let Some(mut pe) = self.get_plan(id)? else {
            return Ok(None);
        };
        if pe.is_finished() {
            return Ok(Some(None));
        }
        pe.finish(status);
        pe.version += 1;
        tx.execute(
            "UPDATE plan_executions SET status = ?1, version = ?2, body = ?3 WHERE uuid = ?4",
            params![
                pe.status.as_str(),
                pe.version as i64,
                serde_json::to_string(&pe)?,
                id
            ],
        )
        .context("Failed to update plan execution")?;
        tx.commit().context("Failed to commit plan execution update")?;
        Ok(Some(Some(pe)))
    }

    /// Insert an interrupt; `false` if the id is taken.
    pub fn insert_interrupt(&self, interrupt: &Interrupt) -> Result<bool> {
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO interrupts (uuid, plan_execution_id, body)
                 VALUES (?1, ?2, ?3)",
                params![
                    interrupt.uuid,
                    interrupt.plan_execution_id,
                    serde_json::to_string(interrupt)?
                ],
            )
            .context("Failed to insert interrupt")?;
        Ok(inserted == 1)
    }

    pub fn interrupts_by_plan_execution(&self, plan_execution_id: &str) -> Result<Vec<Interrupt>> {
        let mut stmt = self.conn.prepare(
            "SELECT body FROM interrupts WHERE plan_execution_id = ?1 ORDER BY seq",
        )?;
        let bodies = stmt
            .query_map(params![plan_execution_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).context("Corrupt interrupt body"))
            .collect()
    }

    pub fn list_plans(&self) -> Result<Vec<PlanExecution>> {
        let mut stmt = self
            .conn
            .prepare("SELECT body FROM plan_executions ORDER BY created_at")?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).context("Corrupt plan execution body"))
            .collect()
    }
}

/// Durable store over [`DbHandle`].
#[derive(Clone)]
pub struct SqliteStore {
    db: DbHandle,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            db: DbHandle::new(ExecutionDb::new(path)?),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            db: DbHandle::new(ExecutionDb::new_in_memory()?),
        })
    }

    async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&ExecutionDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.db.call(f).await.map_err(StoreError::Backend)
    }
}

#[async_trait]
impl NodeExecutionStore for SqliteStore {
    async fn get(&self, id: &str) -> Result<Option<NodeExecution>, StoreError> {
        let id = id.to_string();
        self.call(move |db| db.get_node(&id)).await
    }

    async fn save(&self, node_execution: NodeExecution) -> Result<NodeExecution, StoreError> {
        let record = node_execution.clone();
        let inserted = self.call(move |db| db.insert_node(&record)).await?;
        if !inserted {
            return Err(StoreError::Duplicate {
                id: node_execution.uuid,
            });
        }
        Ok(node_execution)
    }

    async fn conditional_update(
        &self,
        id: &str,
        expected_version: u64,
        mutation: Mutation,
    ) -> Result<UpdateResult, StoreError> {
        let key = id.to_string();
        self.call(move |db| db.update_node(&key, expected_version, mutation))
            .await?
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    async fn find_by_parent(&self, parent_id: &str) -> Result<Vec<NodeExecution>, StoreError> {
        let parent_id = parent_id.to_string();
        self.call(move |db| db.nodes_by_parent(&parent_id)).await
    }

    async fn find_by_plan_execution(
        &self,
        plan_execution_id: &str,
        status_filter: Option<&[Status]>,
    ) -> Result<Vec<NodeExecution>, StoreError> {
        let key = plan_execution_id.to_string();
        let all = self
            .call(move |db| db.nodes_by_plan_execution(&key))
            .await?;
        Ok(match status_filter {
            Some(statuses) => all
                .into_iter()
                .filter(|ne| statuses.contains(&ne.status))
                .collect(),
            None => all,
        })
    }

    async fn find_by_callback_id(
        &self,
        callback_id: &str,
    ) -> Result<Option<NodeExecution>, StoreError> {
        let callback_id = callback_id.to_string();
        self.call(move |db| db.node_by_callback(&callback_id)).await
    }
}

#[async_trait]
impl PlanExecutionStore for SqliteStore {
    async fn save_plan_execution(
        &self,
        plan_execution: PlanExecution,
    ) -> Result<PlanExecution, StoreError> {
        let record = plan_execution.clone();
        let inserted = self.call(move |db| db.insert_plan(&record)).await?;
        if !inserted {
            return Err(StoreError::Duplicate {
                id: plan_execution.uuid,
            });
        }
        Ok(plan_execution)
    }

    async fn get_plan_execution(&self, id: &str) -> Result<Option<PlanExecution>, StoreError> {
        let id = id.to_string();
        self.call(move |db| db.get_plan(&id)).await
    }

    async fn conclude_plan_execution(
        &self,
        id: &str,
        status: Status,
    ) -> Result<Option<PlanExecution>, StoreError> {
        let key = id.to_string();
        self.call(move |db| db.conclude_plan(&key, status))
            .await?
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    async fn list_plan_executions(&self) -> Result<Vec<PlanExecution>, StoreError> {
        self.call(|db| db.list_plans()).await
    }

    async fn save_interrupt(&self, interrupt: Interrupt) -> Result<Interrupt, StoreError> {
        let record = interrupt.clone();
        let inserted = self.call(move |db| db.insert_interrupt(&record)).await?;
        if !inserted {
            return Err(StoreError::Duplicate { id: interrupt.uuid });
        }
        Ok(interrupt)
    }

    async fn find_interrupts(
        &self,
        plan_execution_id: &str,
    ) -> Result<Vec<Interrupt>, StoreError> {
        let key = plan_execution_id.to_string();
        self.call(move |db| db.interrupts_by_plan_execution(&key))
            .await
    }
}
