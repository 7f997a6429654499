//! Error taxonomy shared by every component of the core.
//!
//! Expected business outcomes (approval required, insufficient stock, an illegal transition)
//! and genuine failures (storage, corrupt records) live in one enum so callers can match on
//! them directly. [`ErrorKind`] collapses the variants into the categories a boundary layer
//! turns into status codes.

use std::fmt;

#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(
        "insufficient stock for item `{item_id}` at warehouse `{warehouse_id}`: available {available}, requested {requested}"
    )]
    InsufficientStock {
        item_id: String,
        warehouse_id: String,
        available: u64,
        requested: u64,
    },
    #[error("transfer `{transfer_id}` cannot move from {from} to {to}")]
    InvalidStateTransition {
        transfer_id: String,
        from: String,
        to: String,
    },
    #[error("authorization required, pending approval request `{request_id}`")]
    ApprovalRequired { request_id: String },
    #[error("approval request `{request_id}` was already {status}")]
    AlreadyDecided { request_id: String, status: String },
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("corrupt data: {0}")]
    CorruptData(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Category of a [`CoreError`] as seen at the module boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Validation,
    BusinessRule,
    ApprovalRequired,
    Conflict,
    Forbidden,
    Internal,
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        CoreError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        CoreError::Validation(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::NotFound { .. } => ErrorKind::NotFound,
            CoreError::Validation(_) => ErrorKind::Validation,
            CoreError::InsufficientStock { .. } | CoreError::InvalidStateTransition { .. } => {
                ErrorKind::BusinessRule
            }
            CoreError::ApprovalRequired { .. } => ErrorKind::ApprovalRequired,
            CoreError::AlreadyDecided { .. } => ErrorKind::Conflict,
            CoreError::Forbidden(_) => ErrorKind::Forbidden,
            CoreError::Storage(_)
            | CoreError::Codec(_)
            | CoreError::CorruptData(_)
            | CoreError::Config(_)
            | CoreError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True for outcomes the business flow anticipates, false for defects and outages.
    pub fn is_expected(&self) -> bool {
        self.kind() != ErrorKind::Internal
    }
}

impl ErrorKind {
    /// Conflict-class signals: the caller should wait or re-read rather than fix its input.
    pub fn is_conflict(self) -> bool {
        matches!(self, ErrorKind::ApprovalRequired | ErrorKind::Conflict)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::BusinessRule => "business_rule",
            ErrorKind::ApprovalRequired => "approval_required",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl From<config::ConfigError> for CoreError {
    fn from(err: config::ConfigError) -> Self {
        CoreError::Config(err.to_string())
    }
}
