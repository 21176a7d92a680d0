use igloo_common::ExecutionFailure;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Failed to load configuration")]
    Config(#[from] config::ConfigError),

    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Execution(#[from] ExecutionFailure),

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("An internal error occurred: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

impl From<CoordinatorError> for ExecutionFailure {
    fn from(error: CoordinatorError) -> Self {
        match error {
            CoordinatorError::Execution(failure) => failure,
            other => ExecutionFailure::internal(other.to_string()),
        }
    }
}

/// Fails with an internal error when `condition` does not hold.
pub(crate) fn verify(condition: bool, message: impl FnOnce() -> String) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(CoordinatorError::Internal(message()))
    }
}

/// Folds close failures into a single error. The first failure is the
/// primary one, the rest are attached to it as suppressed failures.
pub(crate) fn combine_failures(errors: Vec<CoordinatorError>) -> Result<()> {
    let mut failures = errors.into_iter().map(ExecutionFailure::from);
    let Some(mut primary) = failures.next() else {
        return Ok(());
    };
    for failure in failures {
        primary.add_suppressed(failure);
    }
    Err(CoordinatorError::Execution(primary))
}
