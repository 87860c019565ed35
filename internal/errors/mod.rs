use thiserror::Error;

/// Error surfaced by the core. Every variant maps to one of the stable
/// machine-readable codes returned by [`CoreError::code`].
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("task is already running")]
    TaskRunning,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("dry run error: {0}")]
    DryRun(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("operation cancelled")]
    Cancelled,
}

impl CoreError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::TaskRunning => "TASK_RUNNING",
            Self::ConnectionFailed(_) => "CONNECTION_FAILED",
            Self::Execution(_) => "EXECUTION_ERROR",
            Self::DryRun(_) => "DRY_RUN_ERROR",
            Self::Io(_) | Self::Database(_) => "IO_ERROR",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::CoreError;

    #[test]
    fn codes_are_stable() {
        assert_eq!(CoreError::Validation("x".into()).code(), "VALIDATION_ERROR");
        assert_eq!(CoreError::NotFound("x".into()).code(), "NOT_FOUND");
        assert_eq!(CoreError::Conflict("x".into()).code(), "CONFLICT");
        assert_eq!(CoreError::TaskRunning.code(), "TASK_RUNNING");
        assert_eq!(
            CoreError::ConnectionFailed("x".into()).code(),
            "CONNECTION_FAILED"
        );
        assert_eq!(CoreError::Execution("x".into()).code(), "EXECUTION_ERROR");
        assert_eq!(CoreError::DryRun("x".into()).code(), "DRY_RUN_ERROR");
        assert_eq!(CoreError::Cancelled.code(), "CANCELLED");
    }

    #[test]
    fn io_and_database_map_to_io_error() {
        let io = CoreError::from(std::io::Error::other("disk"));
        assert_eq!(io.code(), "IO_ERROR");
        let db = CoreError::from(sqlx::Error::PoolTimedOut);
        assert_eq!(db.code(), "IO_ERROR");
    }

    #[test]
    fn cancelled_is_detectable() {
        assert!(CoreError::Cancelled.is_cancelled());
        assert!(!CoreError::TaskRunning.is_cancelled());
    }

    #[test]
    fn display_includes_detail() {
        let err = CoreError::ConnectionFailed("bucket unreachable".into());
        assert!(err.to_string().contains("bucket unreachable"));
    }
}
