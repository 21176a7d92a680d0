use crate::ids::TaskId;
use std::fmt;
use thiserror::Error;

/// Unified error type for Igloo crates.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Execution error: {0}")]
    Execution(String),
    #[error("Operation not supported: {0}")]
    NotSupported(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of an error code. Query level retries only consider
/// internal and external errors, plus cluster memory exhaustion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    UserError,
    InternalError,
    InsufficientResources,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode {
    code: i32,
    name: &'static str,
    error_type: ErrorType,
}

impl ErrorCode {
    pub const GENERIC_USER_ERROR: ErrorCode = ErrorCode::new(0, "GENERIC_USER_ERROR", ErrorType::UserError);
    pub const USER_CANCELED: ErrorCode = ErrorCode::new(3, "USER_CANCELED", ErrorType::UserError);

    pub const GENERIC_INTERNAL_ERROR: ErrorCode =
        ErrorCode::new(65536, "GENERIC_INTERNAL_ERROR", ErrorType::InternalError);
    pub const NO_NODES_AVAILABLE: ErrorCode =
        ErrorCode::new(65541, "NO_NODES_AVAILABLE", ErrorType::InternalError);
    pub const REMOTE_TASK_FAILED: ErrorCode =
        ErrorCode::new(65563, "REMOTE_TASK_FAILED", ErrorType::InternalError);
    pub const TOO_MANY_TASK_FAILURES: ErrorCode =
        ErrorCode::new(65567, "TOO_MANY_TASK_FAILURES", ErrorType::InternalError);
    pub const EXCHANGE_MANAGER_NOT_CONFIGURED: ErrorCode =
        ErrorCode::new(65568, "EXCHANGE_MANAGER_NOT_CONFIGURED", ErrorType::InternalError);

    pub const EXCEEDED_LOCAL_MEMORY_LIMIT: ErrorCode =
        ErrorCode::new(131079, "EXCEEDED_LOCAL_MEMORY_LIMIT", ErrorType::InsufficientResources);
    pub const CLUSTER_OUT_OF_MEMORY: ErrorCode =
        ErrorCode::new(131081, "CLUSTER_OUT_OF_MEMORY", ErrorType::InsufficientResources);

    pub const REMOTE_HOST_GONE: ErrorCode = ErrorCode::new(16777216, "REMOTE_HOST_GONE", ErrorType::External);

    pub const fn new(code: i32, name: &'static str, error_type: ErrorType) -> Self {
        Self {
            code,
            name,
            error_type,
        }
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn error_type(&self) -> ErrorType {
        self.error_type
    }

    pub fn is_out_of_memory(&self) -> bool {
        *self == Self::CLUSTER_OUT_OF_MEMORY || *self == Self::EXCEEDED_LOCAL_MEMORY_LIMIT
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.code)
    }
}

/// A failure as recorded by the scheduling state machines.
///
/// Failures are cheap to clone so that the same cause can be attached to a
/// stage, the distributed scheduler and the query.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct ExecutionFailure {
    error_code: Option<ErrorCode>,
    message: String,
    remote_task: Option<TaskId>,
    suppressed: Vec<ExecutionFailure>,
}

impl ExecutionFailure {
    pub fn new(error_code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code: Some(error_code),
            message: message.into(),
            remote_task: None,
            suppressed: Vec::new(),
        }
    }

    /// A failure that carries no error code. Such failures are treated as
    /// retryable by the query level retry logic.
    pub fn unclassified(message: impl Into<String>) -> Self {
        Self {
            error_code: None,
            message: message.into(),
            remote_task: None,
            suppressed: Vec::new(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::GENERIC_INTERNAL_ERROR, message)
    }

    /// Reported by a downstream task that tried to fetch results from an
    /// upstream task already marked as failed.
    pub fn remote_task_failed(upstream_task: TaskId, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::REMOTE_TASK_FAILED, message).with_remote_task(upstream_task)
    }

    pub fn with_remote_task(mut self, task_id: TaskId) -> Self {
        self.remote_task = Some(task_id);
        self
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error_code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn remote_task(&self) -> Option<&TaskId> {
        self.remote_task.as_ref()
    }

    pub fn suppressed(&self) -> &[ExecutionFailure] {
        &self.suppressed
    }

    pub fn add_suppressed(&mut self, failure: ExecutionFailure) {
        if *self != failure {
            self.suppressed.push(failure);
        }
    }

    pub fn is_remote_task_failure(&self) -> bool {
        self.error_code == Some(ErrorCode::REMOTE_TASK_FAILED)
    }

    pub fn is_user_error(&self) -> bool {
        matches!(self.error_code, Some(code) if code.error_type() == ErrorType::UserError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{QueryId, StageId};

    #[test]
    fn test_remote_task_failure_references_upstream_task() {
        let upstream = TaskId::new(StageId::new(QueryId::new("q"), 2), 0, 0);
        let failure = ExecutionFailure::remote_task_failed(upstream.clone(), "upstream gone");
        assert!(failure.is_remote_task_failure());
        assert_eq!(failure.remote_task(), Some(&upstream));
        assert_eq!(failure.to_string(), "upstream gone");
    }

    #[test]
    fn test_add_suppressed_ignores_self() {
        let mut failure = ExecutionFailure::internal("primary");
        failure.add_suppressed(failure.clone());
        assert!(failure.suppressed().is_empty());
        failure.add_suppressed(ExecutionFailure::internal("secondary"));
        assert_eq!(failure.suppressed().len(), 1);
    }

    #[test]
    fn test_error_classification() {
        assert!(ExecutionFailure::new(ErrorCode::USER_CANCELED, "canceled").is_user_error());
        assert!(!ExecutionFailure::unclassified("boom").is_user_error());
        assert!(ErrorCode::CLUSTER_OUT_OF_MEMORY.is_out_of_memory());
        assert_eq!(ErrorCode::REMOTE_HOST_GONE.error_type(), ErrorType::External);
    }
}
