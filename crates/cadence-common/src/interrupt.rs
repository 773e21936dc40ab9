//! Interrupt requests and the principals that issue them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptType {
    Abort,
    AbortAll,
    Pause,
    PauseAll,
    Resume,
    ResumeAll,
    Retry,
    Expire,
}

impl InterruptType {
    /// Interrupt types that must name a node execution.
    pub fn requires_node(&self) -> bool {
        matches!(
            self,
            Self::Abort | Self::Pause | Self::Resume | Self::Retry | Self::Expire
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Abort => "ABORT",
            Self::AbortAll => "ABORT_ALL",
            Self::Pause => "PAUSE",
            Self::PauseAll => "PAUSE_ALL",
            Self::Resume => "RESUME",
            Self::ResumeAll => "RESUME_ALL",
            Self::Retry => "RETRY",
            Self::Expire => "EXPIRE",
        }
    }
}

impl fmt::Display for InterruptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    User,
    ServiceAccount,
    #[default]
    System,
}

/// Who is acting. Passed explicitly through every entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub kind: PrincipalKind,
    pub id: String,
}

impl Principal {
    pub fn system() -> Self {
        Self {
            kind: PrincipalKind::System,
            id: "system".to_string(),
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            kind: PrincipalKind::User,
            id: id.into(),
        }
    }

    pub fn service_account(id: impl Into<String>) -> Self {
        Self {
            kind: PrincipalKind::ServiceAccount,
            id: id.into(),
        }
    }
}

impl Default for Principal {
    fn default() -> Self {
        Self::system()
    }
}

/// An interrupt as submitted by a caller, before it gets an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptPackage {
    pub plan_execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_execution_id: Option<String>,
    pub interrupt_type: InterruptType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl InterruptPackage {
    pub fn for_plan(plan_execution_id: impl Into<String>, interrupt_type: InterruptType) -> Self {
        Self {
            plan_execution_id: plan_execution_id.into(),
            node_execution_id: None,
            interrupt_type,
            parameters: None,
        }
    }

    pub fn for_node(
        plan_execution_id: impl Into<String>,
        node_execution_id: impl Into<String>,
        interrupt_type: InterruptType,
    ) -> Self {
        Self {
            plan_execution_id: plan_execution_id.into(),
            node_execution_id: Some(node_execution_id.into()),
            interrupt_type,
            parameters: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = Some(parameters);
        self
    }
}

/// Immutable record of a registered interrupt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    pub uuid: String,
    pub plan_execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_execution_id: Option<String>,
    pub interrupt_type: InterruptType,
    pub created_by: Principal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl Interrupt {
    pub fn from_package(package: InterruptPackage, principal: Principal) -> Self {
        Self {
            uuid: crate::ids::generate_id(),
            plan_execution_id: package.plan_execution_id,
            node_execution_id: package.node_execution_id,
            interrupt_type: package.interrupt_type,
            created_by: principal,
            parameters: package.parameters,
            created_at: Utc::now(),
        }
    }
}
