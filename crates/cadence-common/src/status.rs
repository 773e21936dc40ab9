//! Node and plan execution status.
//!
//! ```text
//! QUEUED -> RUNNING -> {ASYNC_WAITING, TASK_WAITING, CHILDREN_WAITING}
//!        -> RUNNING -> {SUCCEEDED, FAILED, SKIPPED, EXPIRED, ABORTED, ERRORED}
//! RUNNING | *_WAITING -> PAUSED -> RUNNING | *_WAITING
//! any non-terminal -> ABORTING -> ABORTED
//! ```
//!
//! Terminal statuses are final for a given attempt. A retry produces a new
//! node execution, it never reopens a terminal one.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    Queued,
    Running,
    /// Waiting on callbacks of an ASYNC step.
    AsyncWaiting,
    /// Waiting on callbacks of a TASK or TASK_CHAIN step.
    TaskWaiting,
    /// Waiting for spawned child node executions to finish.
    ChildrenWaiting,
    Paused,
    /// Abort requested; finalized to `Aborted` on the next engine touch.
    Aborting,
    Succeeded,
    Failed,
    Skipped,
    Expired,
    Aborted,
    /// Configuration error (no facilitator, missing handler, bad adviser rule).
    Errored,
}

impl Status {
    pub const TERMINAL: [Status; 6] = [
        Status::Succeeded,
        Status::Failed,
        Status::Skipped,
        Status::Expired,
        Status::Aborted,
        Status::Errored,
    ];

    /// Check if the status is final for an attempt.
    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    /// Waiting on external callbacks (ASYNC / TASK / TASK_CHAIN).
    pub fn is_callback_waiting(&self) -> bool {
        matches!(self, Self::AsyncWaiting | Self::TaskWaiting)
    }

    /// Any of the parked statuses where no worker holds the node.
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            Self::AsyncWaiting | Self::TaskWaiting | Self::ChildrenWaiting
        )
    }

    /// Terminal statuses that count as a positive outcome.
    pub fn is_positive(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }

    /// Terminal statuses that represent a failure of some kind.
    pub fn is_broken(&self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Expired | Self::Aborted | Self::Errored
        )
    }

    /// Statuses a PAUSE interrupt may take a node from.
    pub fn is_pausable(&self) -> bool {
        matches!(
            self,
            Self::Queued
                | Self::Running
                | Self::AsyncWaiting
                | Self::TaskWaiting
                | Self::ChildrenWaiting
        )
    }

    /// Rank used when reducing several statuses into one; higher is worse.
    pub fn severity(&self) -> u8 {
        match self {
            Self::Skipped => 0,
            Self::Succeeded => 1,
            Self::Queued => 2,
            Self::Running
            | Self::AsyncWaiting
            | Self::TaskWaiting
            | Self::ChildrenWaiting
            | Self::Paused => 3,
            Self::Aborting => 4,
            Self::Failed => 5,
            Self::Expired => 6,
            Self::Aborted => 7,
            Self::Errored => 8,
        }
    }

    /// Reduce a set of terminal statuses into the status their parent takes.
    ///
    /// The worst status wins. All-skipped reduces to `Skipped`, an empty set
    /// reduces to `Succeeded`.
    pub fn reduce<I>(statuses: I) -> Status
    where
        I: IntoIterator<Item = Status>,
    {
        let mut seen_any = false;
        let mut all_skipped = true;
        let mut worst = Status::Succeeded;
        for status in statuses {
            seen_any = true;
            if status != Status::Skipped {
                all_skipped = false;
            }
            if status.severity() > worst.severity() {
                worst = status;
            }
        }
        if seen_any && all_skipped {
            return Status::Skipped;
        }
        if worst == Status::Skipped {
            Status::Succeeded
        } else {
            worst
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::AsyncWaiting => "ASYNC_WAITING",
            Self::TaskWaiting => "TASK_WAITING",
            Self::ChildrenWaiting => "CHILDREN_WAITING",
            Self::Paused => "PAUSED",
            Self::Aborting => "ABORTING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
            Self::Expired => "EXPIRED",
            Self::Aborted => "ABORTED",
            Self::Errored => "ERRORED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s.to_ascii_uppercase().as_str() {
            "QUEUED" => Self::Queued,
            "RUNNING" => Self::Running,
            "ASYNC_WAITING" => Self::AsyncWaiting,
            "TASK_WAITING" => Self::TaskWaiting,
            "CHILDREN_WAITING" => Self::ChildrenWaiting,
            "PAUSED" => Self::Paused,
            "ABORTING" => Self::Aborting,
            "SUCCEEDED" => Self::Succeeded,
            "FAILED" => Self::Failed,
            "SKIPPED" => Self::Skipped,
            "EXPIRED" => Self::Expired,
            "ABORTED" => Self::Aborted,
            "ERRORED" => Self::Errored,
            other => return Err(format!("Unknown status '{}'", other)),
        };
        Ok(status)
    }
}
