use crate::llm::LlmError;

/// Crate-level error taxonomy. NotFound/Disabled abort a request before the
/// pipeline starts; Executor errors are recoverable via the SQL fixer and only
/// surface here once its retry budget is exhausted.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} is disabled")]
    Disabled(String),

    #[error("{0}")]
    Invalid(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("SQL execution error: {0}")]
    Executor(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;
