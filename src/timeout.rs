//! Node timeouts.
//!
//! The engine registers a timeout when a node starts running and cancels it
//! when the node reaches a terminal status. An expired timeout becomes an
//! EXPIRE interrupt registered by the system principal.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// A deadline that elapsed without being cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutExpiry {
    pub instance_id: String,
    pub node_execution_id: String,
    pub plan_execution_id: String,
}

pub trait TimeoutTracker: Send + Sync {
    fn register(
        &self,
        instance_id: &str,
        node_execution_id: &str,
        plan_execution_id: &str,
        after: Duration,
    );

    /// Returns whether a pending timeout was cancelled.
    fn cancel(&self, instance_id: &str) -> bool;
}

/// In-process tracker backed by tokio timers.
///
/// Deadlines do not survive a restart.
#[derive(Clone)]
pub struct TokioTimeoutTracker {
    pending: Arc<DashMap<String, JoinHandle<()>>>,
    expiries: mpsc::UnboundedSender<TimeoutExpiry>,
}

impl TokioTimeoutTracker {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimeoutExpiry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                pending: Arc::new(DashMap::new()),
                expiries: tx,
            },
            rx,
        )
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl TimeoutTracker for TokioTimeoutTracker {
    fn register(
        &self,
        instance_id: &str,
        node_execution_id: &str,
        plan_execution_id: &str,
        after: Duration,
    ) {
        let expiry = TimeoutExpiry {
            instance_id: instance_id.to_string(),
            node_execution_id: node_execution_id.to_string(),
            plan_execution_id: plan_execution_id.to_string(),
        };
        let pending = self.pending.clone();
        let tx = self.expiries.clone();
        let key = instance_id.to_string();
        let (armed_tx, armed_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            // Wait until the handle is in the pending map.
            if armed_rx.await.is_err() {
                return;
            }
            tokio::time::sleep(after).await;
            // Only fire if nobody cancelled us in the meantime.
            if pending.remove(&expiry.instance_id).is_some() {
                tracing::info!(
                    node_execution_id = %expiry.node_execution_id,
                    timeout_ms = after.as_millis() as u64,
                    "Node timed out"
                );
                if tx.send(expiry).is_err() {
                    tracing::debug!("Timeout receiver dropped");
                }
            }
        });

        if let Some(previous) = self.pending.insert(key, handle) {
            previous.abort();
        }
        let _ = armed_tx.send(());
    }

    fn cancel(&self, instance_id: &str) -> bool {
        match self.pending.remove(instance_id) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}
