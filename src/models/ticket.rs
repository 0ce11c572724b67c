use std::fmt;

use serde::{Deserialize, Serialize};

use super::{ConfigDomain, OperationId};

pub type TicketId = u64;

/// The lifecycle state of a change ticket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketState {
    Open,
    Processing,
    Done,
    Rejected,
}

impl fmt::Display for TicketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Processing => write!(f, "processing"),
            Self::Done => write!(f, "done"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// A reference to one config version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRef {
    pub domain: ConfigDomain,
    pub version: u64,
}

/// A human-initiated change request and the mechanical effects it caused.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub description: String,
    pub state: TicketState,
    #[serde(default)]
    pub operations: Vec<OperationId>,
    #[serde(default)]
    pub versions: Vec<VersionRef>,
    #[serde(default)]
    pub reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}
