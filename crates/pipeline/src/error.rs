use shared::{
    domain::{MessageKind, UserId},
    error::{ApiError, ErrorCode},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// No handler registered for the message type. A configuration error:
    /// surfaced loudly, never retried.
    #[error("no handler registered for message type '{0}'")]
    UnsupportedMessageType(MessageKind),

    #[error("{0}")]
    Validation(String),

    #[error("a voice training task is already pending for user {}", .0 .0)]
    TrainingAlreadyPending(UserId),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<PipelineError> for ApiError {
    fn from(value: PipelineError) -> Self {
        let code = match &value {
            PipelineError::UnsupportedMessageType(_) => ErrorCode::Unsupported,
            PipelineError::Validation(_) => ErrorCode::Validation,
            PipelineError::TrainingAlreadyPending(_) => ErrorCode::Validation,
            PipelineError::Internal(_) => ErrorCode::Internal,
        };
        ApiError::new(code, value.to_string())
    }
}
