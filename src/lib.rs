//! Cadence: a pipeline orchestration engine.
//!
//! A [`Plan`](cadence_common::Plan) of nodes is executed as a tree of node
//! executions. Each node runs through a step handler in one of six modes,
//! may wait on callbacks or children without holding a worker, and is
//! advised on what happens next once it finishes. Interrupts pause, resume,
//! abort, retry or expire nodes while the plan runs.
//!
//! Start with [`runtime::OrchestratorBuilder`].

pub mod adviser;
pub mod ambiance;
pub mod config;
pub mod engine;
pub mod errors;
pub mod expression;
pub mod facilitator;
pub mod interrupt;
pub mod logging;
pub mod plan;
pub mod retry;
pub mod runtime;
pub mod step;
pub mod steps;
pub mod store;
pub mod timeout;

pub use runtime::{Orchestrator, OrchestratorBuilder};
