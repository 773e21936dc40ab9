//! Execution dispatcher: a bounded worker pool fed by an unbounded queue.
//!
//! Each [`DispatchUnit`] is one independently schedulable piece of engine
//! work. Units are processed concurrently up to `max_workers`; a unit that
//! fails with a transient error (a version conflict that survived the
//! in-place retry) is requeued after `requeue_delay`, at most
//! `max_requeues` times.

use crate::errors::EngineError;
use async_trait::async_trait;
use cadence_common::Status;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, mpsc};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchUnit {
    /// Trigger a QUEUED node execution.
    Start { node_execution_id: String },
    /// Deliver one callback to a waiting node execution.
    Resume {
        node_execution_id: String,
        callback_id: String,
        payload: Value,
    },
    /// Deliver a callback located by its id alone.
    Notify { callback_id: String, payload: Value },
    /// Continue a node whose work already finished while it was paused.
    Complete { node_execution_id: String },
    /// A child concluded; re-check the waiting parent.
    ChildCompleted { parent_id: String },
    /// Drive an ABORTING node to its final status.
    Finalize {
        node_execution_id: String,
        status: Status,
    },
    /// Run the end transition of a terminal node.
    Advance { node_execution_id: String },
}

impl DispatchUnit {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Resume { .. } => "resume",
            Self::Notify { .. } => "notify",
            Self::Complete { .. } => "complete",
            Self::ChildCompleted { .. } => "child_completed",
            Self::Finalize { .. } => "finalize",
            Self::Advance { .. } => "advance",
        }
    }

    pub fn target_id(&self) -> &str {
        match self {
            Self::Start { node_execution_id }
            | Self::Resume {
                node_execution_id, ..
            }
            | Self::Complete { node_execution_id }
            | Self::Finalize {
                node_execution_id, ..
            }
            | Self::Advance { node_execution_id } => node_execution_id,
            Self::Notify { callback_id, .. } => callback_id,
            Self::ChildCompleted { parent_id } => parent_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub unit: DispatchUnit,
    /// How many times this unit was requeued
    pub attempt: u32,
}

/// Cloneable submission side of the dispatch queue.
#[derive(Clone)]
pub struct DispatchHandle {
    tx: mpsc::UnboundedSender<Envelope>,
}

/// Receiving side, consumed by [`Dispatcher::spawn`].
pub struct DispatchQueue {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl DispatchHandle {
    pub fn channel() -> (DispatchHandle, DispatchQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (DispatchHandle { tx }, DispatchQueue { rx })
    }

    pub fn submit(&self, unit: DispatchUnit) -> Result<(), EngineError> {
        self.send(Envelope { unit, attempt: 0 })
    }

    /// Submit once `delay` has elapsed.
    pub fn submit_after(&self, unit: DispatchUnit, delay: Duration) -> Result<(), EngineError> {
        self.send_after(Envelope { unit, attempt: 0 }, delay)
    }

    fn send(&self, envelope: Envelope) -> Result<(), EngineError> {
        self.tx
            .send(envelope)
            .map_err(|_| EngineError::DispatcherClosed)
    }

    fn send_after(&self, envelope: Envelope, delay: Duration) -> Result<(), EngineError> {
        if delay.is_zero() {
            return self.send(envelope);
        }
        if self.tx.is_closed() {
            return Err(EngineError::DispatcherClosed);
        }
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(envelope).is_err() {
                tracing::debug!("Dispatcher closed before delayed unit was submitted");
            }
        });
        Ok(())
    }
}

impl DispatchQueue {
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

/// Whatever processes dispatch units; the orchestration engine in practice.
#[async_trait]
pub trait DispatchTarget: Send + Sync + 'static {
    async fn process(&self, unit: DispatchUnit) -> Result<(), EngineError>;
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_workers: usize,
    pub max_requeues: u32,
    pub requeue_delay: Duration,
}

pub struct Dispatcher {
    shutdown: Arc<Notify>,
    semaphore: Arc<Semaphore>,
    max_workers: usize,
    loop_handle: JoinHandle<()>,
}

impl Dispatcher {
    /// Start the dispatch loop on the current tokio runtime.
    pub fn spawn<T: DispatchTarget>(
        target: Arc<T>,
        queue: DispatchQueue,
        handle: DispatchHandle,
        config: DispatcherConfig,
    ) -> Self {
        let max_workers = config.max_workers.max(1);
        let semaphore = Arc::new(Semaphore::new(max_workers));
        let shutdown = Arc::new(Notify::new());

        let loop_handle = tokio::spawn(run_loop(
            target,
            queue,
            handle,
            config,
            semaphore.clone(),
            shutdown.clone(),
        ));

        Self {
            shutdown,
            semaphore,
            max_workers,
            loop_handle,
        }
    }

    /// Stop taking new units and wait for in-flight ones to finish.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.loop_handle.await {
            tracing::warn!(error = %e, "Dispatch loop ended abnormally");
        }
        // Every permit back means every worker task is done.
        match self.semaphore.acquire_many(self.max_workers as u32).await {
            Ok(_permits) => {}
            Err(e) => tracing::warn!(error = %e, "Worker pool closed during shutdown"),
        }
    }
}

async fn run_loop<T: DispatchTarget>(
    target: Arc<T>,
    mut queue: DispatchQueue,
    handle: DispatchHandle,
    config: DispatcherConfig,
    semaphore: Arc<Semaphore>,
    shutdown: Arc<Notify>,
) {
    loop {
        let envelope = tokio::select! {
            biased;
            _ = shutdown.notified() => break,
            next = queue.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };

        let target = target.clone();
        let handle = handle.clone();
        let max_requeues = config.max_requeues;
        let requeue_delay = config.requeue_delay;

        tokio::spawn(async move {
            let _permit = permit;
            let kind = envelope.unit.kind();
            let target_id = envelope.unit.target_id().to_string();

            match target.process(envelope.unit.clone()).await {
                Ok(()) => {}
                Err(e) if e.is_transient() && envelope.attempt < max_requeues => {
                    tracing::warn!(
                        unit = kind,
                        target = %target_id,
                        attempt = envelope.attempt + 1,
                        error = %e,
                        "Requeueing dispatch unit"
                    );
                    let retry = Envelope {
                        unit: envelope.unit,
                        attempt: envelope.attempt + 1,
                    };
                    if let Err(e) = handle.send_after(retry, requeue_delay) {
                        tracing::error!(unit = kind, error = %e, "Failed to requeue dispatch unit");
                    }
                }
                Err(e) => {
                    tracing::error!(
                        unit = kind,
                        target = %target_id,
                        attempt = envelope.attempt,
                        error = %e,
                        "Dispatch unit failed"
                    );
                }
            }
        });
    }
    tracing::debug!("Dispatch loop stopped");
}
