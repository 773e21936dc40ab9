//! Shared domain types for the Cadence orchestration engine.
//!
//! Everything in this crate is plain data: the engine, stores and interrupt
//! handlers in the `cadence` crate operate on these types but the types
//! themselves carry no behavior beyond local invariants (status transitions,
//! ambiance addressing, id generation, timeout parsing).

pub mod advise;
pub mod ambiance;
pub mod execution;
pub mod ids;
pub mod interrupt;
pub mod plan;
pub mod plan_execution;
pub mod status;
pub mod timeout;

pub use advise::{Advise, AdviserObtainment, ExhaustedAction};
pub use ambiance::{Ambiance, Level};
pub use execution::{
    AdviseRecord, ExecutableResponse, ExecutionMode, FailureInfo, FailureKind, InterruptEffect,
    NodeExecution, Outcome, StepResponse,
};
pub use ids::generate_id;
pub use interrupt::{Interrupt, InterruptPackage, InterruptType, Principal, PrincipalKind};
pub use plan::{Plan, PlanNode, TimeoutConfig};
pub use plan_execution::PlanExecution;
pub use status::Status;
pub use timeout::{TimeoutParseError, format_timeout, parse_timeout};
