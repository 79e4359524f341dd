use spindle_common::error::CommonError;
use spindle_server::actor::ActorError;
use thiserror::Error;

use crate::codec::RemoteError;

pub type ExecutionResult<T> = Result<T, ExecutionError>;

#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The worker died while the request could not be safely resubmitted.
    /// The caller may reattempt the request.
    #[error("worker process died, please reattempt the call")]
    Retry,
    #[error("call cancelled")]
    Cancelled,
    #[error("{0}")]
    Remote(#[from] RemoteError),
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("failed to launch worker: {0}")]
    WorkerLaunchError(String),
    #[error("{0}")]
    WorkerExited(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error(transparent)]
    CommonError(#[from] CommonError),
    #[error("internal error: {0}")]
    InternalError(String),
}

impl ExecutionError {
    pub fn protocol(message: impl Into<String>) -> Self {
        ExecutionError::ProtocolError(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        ExecutionError::InvalidArgument(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ExecutionError::InternalError(message.into())
    }

    /// Whether the caller is expected to reattempt the request.
    pub fn is_retry(&self) -> bool {
        matches!(self, ExecutionError::Retry)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecutionError::Cancelled)
    }
}

impl From<ActorError> for ExecutionError {
    fn from(error: ActorError) -> Self {
        ExecutionError::InternalError(error.to_string())
    }
}
