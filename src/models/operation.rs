use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::NodeId;

pub type OperationId = Uuid;

/// The kind of node-lifecycle work an operation performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Provision,
    Deprovision,
    RoleChange,
    Restart,
}

impl OperationKind {
    /// The playbook tag which executes this kind of operation.
    pub fn ansible_tag(&self) -> &'static str {
        match self {
            Self::Provision => "start",
            Self::Deprovision => "stop",
            Self::RoleChange | Self::Restart => "restart",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provision => write!(f, "provision"),
            Self::Deprovision => write!(f, "deprovision"),
            Self::RoleChange => write!(f, "role_change"),
            Self::Restart => write!(f, "restart"),
        }
    }
}

/// The lifecycle state of an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// Accepted by the runner, not yet observed by a poll.
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }

    /// Timed out operations count as failures for every downstream decision.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut)
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// The state of a runner job as reported by the runner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Succeeded,
    Failed,
}

/// One runner job of an operation, there is one job per target node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerJob {
    pub node_id: NodeId,
    pub job_id: String,
    pub state: JobState,
    #[serde(default)]
    pub detail: String,
}

/// A tracked asynchronous unit of work executed by the automation runner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub targets: Vec<NodeId>,
    pub state: OperationState,
    pub created_at: i64,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub finished_at: Option<i64>,
    #[serde(default)]
    pub last_polled_at: Option<i64>,
    #[serde(default)]
    pub jobs: Vec<RunnerJob>,
    /// Combined runner output of all jobs once terminal.
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub cancelled: bool,
}
