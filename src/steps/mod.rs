//! Built-in step handlers.
//!
//! | step type  | modes                  | behavior                                  |
//! |------------|------------------------|-------------------------------------------|
//! | `noop`     | SYNC                   | succeeds, publishing `outcomes`           |
//! | `fail`     | SYNC                   | fails, optionally only for early attempts |
//! | `section`  | CHILD                  | runs the node named by `child`            |
//! | `fork`     | CHILDREN               | runs every node in `children` in parallel |
//! | `delegate` | ASYNC, TASK, TASK_CHAIN| waits on callbacks it completes itself    |

mod container;
mod delegate;
mod fail;
mod noop;

pub use container::{ForkStep, SectionStep};
pub use delegate::DelegateStep;
pub use fail::FailStep;
pub use noop::NoopStep;

use crate::errors::StepError;
use crate::step::StepRegistry;
use serde_json::Value;
use std::sync::Arc;

/// Registry holding every built-in handler.
pub fn builtin_registry() -> StepRegistry {
    StepRegistry::new()
        .with(Arc::new(NoopStep))
        .with(Arc::new(FailStep))
        .with(Arc::new(SectionStep))
        .with(Arc::new(ForkStep))
        .with(Arc::new(DelegateStep))
}

fn u64_param(params: &Value, key: &str, default: u64) -> Result<u64, StepError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_u64()
            .ok_or_else(|| StepError::InvalidParameters(format!("'{}' must be a non-negative integer", key))),
    }
}

fn bool_param(params: &Value, key: &str, default: bool) -> Result<bool, StepError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_bool()
            .ok_or_else(|| StepError::InvalidParameters(format!("'{}' must be a boolean", key))),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::engine::dispatcher::{DispatchHandle, DispatchQueue};
    use crate::step::{CompletionHandle, StepContext};
    use cadence_common::{Ambiance, PlanNode};
    use std::collections::BTreeMap;

    pub fn context(node: PlanNode, attempt: u32) -> (StepContext, DispatchQueue) {
        let (handle, queue) = DispatchHandle::channel();
        let ctx = StepContext {
            plan_execution_id: "pe".to_string(),
            node_execution_id: "ne".to_string(),
            node,
            ambiance: Ambiance {
                plan_execution_id: "pe".to_string(),
                setup_abstractions: BTreeMap::new(),
                levels: Vec::new(),
            },
            attempt,
            completions: CompletionHandle::new(handle),
        };
        (ctx, queue)
    }
}
