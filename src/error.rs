//! Controller error abstractions.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{GroupId, NodeId, ShardId};

// Error messages.
pub const ERR_ITER_FAILURE: &str = "error returned during key/value iteration from database";
pub const ERR_DB_FLUSH: &str = "error flushing database state";
pub const ERR_DECODE_ROW: &str = "error decoding stored record, storage may be corrupted";

/// Application error variants.
#[derive(Debug, Error)]
pub enum AppError {
    /// The mutation would break one or more topology invariants.
    #[error("invariant violation: {}", .0.join("; "))]
    InvariantViolation(Vec<String>),
    /// A shard assignment failed validation.
    #[error("invalid assignment for shard {shard_id}: {reason}")]
    InvalidAssignment { shard_id: ShardId, reason: String },
    /// The target node already has an active operation.
    #[error("node {node_id} is busy with operation {operation_id}")]
    NodeBusy { node_id: NodeId, operation_id: Uuid },
    /// The automation runner could not accept the operation.
    #[error("error submitting operation to runner: {0}")]
    SubmissionError(String),
    /// An operation's precomputed assignment delta no longer matches the group.
    #[error("stale assignment delta for group {group_id}, computed against version {expected} but group is at version {found}")]
    StaleDelta { group_id: GroupId, expected: u64, found: u64 },
    /// A coordination store push failed.
    #[error("error syncing config to coordination store: {0}")]
    SyncFailure(String),
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// The referenced resource does not exist.
    #[error("resource not found: {0}")]
    ResourceNotFound(String),
    /// The server has hit an internal error, but will remain online.
    #[error("internal server error")]
    Ise(anyhow::Error),
}

impl AppError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvariantViolation(_) | Self::InvalidAssignment { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::NodeBusy { .. } | Self::StaleDelta { .. } => StatusCode::CONFLICT,
            Self::SubmissionError(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::SyncFailure(_) => StatusCode::BAD_GATEWAY,
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::ResourceNotFound(_) => StatusCode::NOT_FOUND,
            Self::Ise(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// A short machine readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvariantViolation(_) => "InvariantViolation",
            Self::InvalidAssignment { .. } => "InvalidAssignment",
            Self::NodeBusy { .. } => "NodeBusy",
            Self::SubmissionError(_) => "SubmissionError",
            Self::StaleDelta { .. } => "StaleDelta",
            Self::SyncFailure(_) => "SyncFailure",
            Self::InvalidInput(_) => "InvalidInput",
            Self::ResourceNotFound(_) => "ResourceNotFound",
            Self::Ise(_) => "InternalError",
        }
    }
}

/// An error returned from an HTTP handler.
///
/// Wraps any `anyhow::Error`; typed `AppError`s are recovered by downcasting, anything else is
/// treated as an internal error and logged.
#[derive(Debug)]
pub struct ServerError(pub anyhow::Error);

impl From<anyhow::Error> for ServerError {
    fn from(err: anyhow::Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let app_err = match self.0.downcast::<AppError>() {
            Ok(app_err) => app_err,
            Err(err) => {
                tracing::error!(error = ?err, "unexpected error while handling request");
                AppError::Ise(err)
            }
        };
        let body = Json(json!({"error": app_err.kind(), "message": app_err.to_string()}));
        (app_err.status_code(), body).into_response()
    }
}

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;

/// A result type used by HTTP handlers.
pub type ServerResult<T> = ::std::result::Result<T, ServerError>;
