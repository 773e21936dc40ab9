//! The root aggregate of one plan run.

use crate::interrupt::Principal;
use crate::plan::Plan;
use crate::status::Status;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanExecution {
    pub uuid: String,
    pub plan: Plan,
    pub status: Status,
    #[serde(default)]
    pub setup_abstractions: BTreeMap<String, String>,
    pub triggered_by: Principal,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub end_ts: Option<DateTime<Utc>>,
    pub version: u64,
}

impl PlanExecution {
    pub fn new(
        uuid: impl Into<String>,
        plan: Plan,
        setup_abstractions: BTreeMap<String, String>,
        triggered_by: Principal,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            plan,
            status: Status::Running,
            setup_abstractions,
            triggered_by,
            created_at: Utc::now(),
            end_ts: None,
            version: 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn finish(&mut self, status: Status) {
        self.status = status;
        self.end_ts = Some(Utc::now());
    }
}
