//! Crate-wide error types.
//!
//! Each subsystem gets its own `thiserror` enum with a machine-readable
//! variant and a human-readable message, serialized to JSON when it crosses
//! the REST boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Errors raised by the PTY adapter during spawn, write, resize, or kill.
#[derive(Debug, Error, Clone, Serialize)]
pub enum PtyError {
    #[error("failed to spawn shell: {0}")]
    SpawnFailed(String),
    #[error("write to PTY failed: {0}")]
    WriteFailed(String),
    #[error("resize failed: {0}")]
    ResizeFailed(String),
    #[error("kill failed: {0}")]
    KillFailed(String),
}

/// Errors raised by `Registry` operations.
#[derive(Debug, Error, Clone, Serialize)]
pub enum RegistryError {
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error(transparent)]
    Pty(#[from] PtyError),
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = match &self {
            RegistryError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::Pty(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

/// Errors raised while probing a session's descendant process tree.
#[derive(Debug, Error, Clone, Serialize)]
pub enum ProcessError {
    #[error("process {0} not found")]
    NotFound(u32),
    #[error("refusing to kill the session's root process (use DELETE /api/sessions/:id)")]
    CannotKillRoot,
    #[error("failed to kill process {pid}: {reason}")]
    KillFailed { pid: u32, reason: String },
}

impl IntoResponse for ProcessError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProcessError::NotFound(_) => StatusCode::NOT_FOUND,
            ProcessError::CannotKillRoot => StatusCode::CONFLICT,
            ProcessError::KillFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}
