//! Structured errors returned by lifecycle operations.

use crate::chain::ChainError;
use crate::state_machine::InvalidTransition;
use crate::types::TaskStatus;
use serde::Serialize;
use std::fmt;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors
    MissingRequiredField,
    InvalidFieldValue,
    DepositInvalid,

    // Not found errors
    TaskNotFound,
    ProviderNotFound,

    // Conflict errors
    InvalidTransition,
    ProviderIneligible,
    EscrowAlreadyFunded,
    NoBudget,
    DepositAlreadyUsed,
    SettlementInProgress,
    SlaNotExpired,
    NoProof,
    NoPayee,
    TargetMismatch,
    ConcurrentModification,

    // Chain errors
    ChainUnavailable,
    ChainRejected,
    ChainUnconfirmed,
    ChainNotConfigured,

    // Internal errors
    DatabaseError,
    InternalError,
}

/// Error family, which fixes the HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    StateConflict,
    Chain,
    Persistence,
    Internal,
}

impl ErrorKind {
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::StateConflict => 409,
            ErrorKind::Chain | ErrorKind::Persistence | ErrorKind::Internal => 500,
        }
    }
}

impl ErrorCode {
    pub fn kind(&self) -> ErrorKind {
        use ErrorCode::*;
        match self {
            MissingRequiredField | InvalidFieldValue | DepositInvalid => ErrorKind::Validation,
            TaskNotFound | ProviderNotFound => ErrorKind::NotFound,
            InvalidTransition | ProviderIneligible | EscrowAlreadyFunded | NoBudget
            | DepositAlreadyUsed | SettlementInProgress | SlaNotExpired | NoProof | NoPayee
            | TargetMismatch | ConcurrentModification => ErrorKind::StateConflict,
            ChainUnavailable | ChainRejected | ChainUnconfirmed | ChainNotConfigured => {
                ErrorKind::Chain
            }
            DatabaseError => ErrorKind::Persistence,
            InternalError => ErrorKind::Internal,
        }
    }
}

/// Structured error for lifecycle operations.
#[derive(Debug, Serialize)]
pub struct LifecycleError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LifecycleError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            field: None,
            details: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.code.kind()
    }

    // Convenience constructors

    pub fn missing_field(field: &str) -> Self {
        Self::new(
            ErrorCode::MissingRequiredField,
            format!("{} is required", field),
        )
        .with_field(field)
    }

    pub fn invalid_value(field: &str, reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidFieldValue, reason).with_field(field)
    }

    pub fn task_not_found(task_id: &str) -> Self {
        Self::new(
            ErrorCode::TaskNotFound,
            format!("Task not found: {}", task_id),
        )
    }

    pub fn provider_not_found(provider_id: &str) -> Self {
        Self::new(
            ErrorCode::ProviderNotFound,
            format!("Provider not found: {}", provider_id),
        )
        .with_field("providerId")
    }

    pub fn conflict(code: ErrorCode, message: impl Into<String>) -> Self {
        debug_assert_eq!(code.kind(), ErrorKind::StateConflict);
        Self::new(code, message)
    }

    /// The row changed underneath the operation.
    pub fn stale(task_id: &str, expected: TaskStatus) -> Self {
        Self::new(
            ErrorCode::ConcurrentModification,
            format!(
                "Task {} is no longer in {} or has a settlement in progress",
                task_id, expected
            ),
        )
    }

    pub fn database(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::DatabaseError, err.to_string())
    }

    pub fn internal(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::InternalError, err.to_string())
    }

    pub fn http_status(&self) -> u16 {
        self.kind().http_status()
    }
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for LifecycleError {}

impl From<InvalidTransition> for LifecycleError {
    fn from(err: InvalidTransition) -> Self {
        Self::new(ErrorCode::InvalidTransition, err.to_string())
            .with_details(format!("status={} action={}", err.from, err.action))
    }
}

impl From<ChainError> for LifecycleError {
    fn from(err: ChainError) -> Self {
        let code = match &err {
            ChainError::Transport(_)
            | ChainError::Unreachable(_)
            | ChainError::Rpc { .. }
            | ChainError::Decode(_) => ErrorCode::ChainUnavailable,
            ChainError::Reverted { .. } | ChainError::InvalidAddress(_) => ErrorCode::ChainRejected,
            ChainError::ReceiptTimeout { .. }
            | ChainError::Unconfirmed { .. }
            | ChainError::SubmissionUnknown { .. } => ErrorCode::ChainUnconfirmed,
            ChainError::NotConfigured(_) => ErrorCode::ChainNotConfigured,
        };
        Self::new(code, err.to_string())
    }
}

// Persistence failures arrive as anyhow errors from the db layer.
impl From<anyhow::Error> for LifecycleError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<LifecycleError>() {
            Ok(lifecycle_err) => lifecycle_err,
            Err(err) => LifecycleError::database(format!("{:#}", err)),
        }
    }
}

/// Result type for lifecycle operations.
pub type LifecycleResult<T> = std::result::Result<T, LifecycleError>;
