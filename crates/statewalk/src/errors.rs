use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("unsupported configuration: {0}")]
    Unsupported(String),
    #[error("traversal interrupted")]
    Interrupted,
    #[error("traversal exceeded the step limit of {0}")]
    StepLimitExceeded(u64),
    #[error("executor error: {0}")]
    Executor(String),
    #[error("DOT parse error: {0}")]
    DotParse(String),
    #[error("invalid graph: {0}")]
    InvalidGraph(String),
    #[error("io error: {0}")]
    Io(String),
}

impl SchedulerError {
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}
