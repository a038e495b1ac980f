use axum::http::StatusCode;
use thiserror::Error;
use tnet_process::{InstanceId, ServiceKind};

/// Failures surfaced by the lifecycle controller and the dashboard API.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Bad or ambiguous user input.
    #[error("invalid input: {0}")]
    Validation(String),
    /// The referenced id does not exist in the kind's namespace.
    #[error("{kind} with ID {id} not found")]
    NotFound { kind: ServiceKind, id: InstanceId },
    /// The process supervisor rejected a launch or terminate.
    #[error("process error: {0}")]
    Process(String),
    /// A supervisor call exceeded its bound; the outcome is indeterminate.
    #[error("timed out, result is indeterminate: {0}")]
    Timeout(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type ControlResult<T> = Result<T, ControlError>;

impl ControlError {
    pub fn not_found(kind: ServiceKind, id: &InstanceId) -> Self {
        Self::NotFound {
            kind,
            id: id.clone(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ControlError::Validation(_) => "validation",
            ControlError::NotFound { .. } => "not_found",
            ControlError::Process(_) => "process",
            ControlError::Timeout(_) => "timeout",
            ControlError::Unauthorized => "unauthorized",
            ControlError::Forbidden(_) => "forbidden",
            ControlError::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ControlError::Validation(_) => StatusCode::BAD_REQUEST,
            ControlError::NotFound { .. } => StatusCode::NOT_FOUND,
            ControlError::Process(_) => StatusCode::BAD_GATEWAY,
            ControlError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ControlError::Unauthorized => StatusCode::UNAUTHORIZED,
            ControlError::Forbidden(_) => StatusCode::FORBIDDEN,
            ControlError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Flattens an error chain into `outer: inner: root`, skipping repeats.
pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}
