use crate::db::RepositoryError;
use crate::services::bg_removal::BgRemovalError;
use crate::services::storage::StorageError;
use crate::services::transforms::TransformError;

/// Everything that can fail inside one job, caught once at the processor boundary.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Provider(#[from] BgRemovalError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("transform task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Stable `{code, message}` pair persisted onto a failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorClassification {
    pub code: &'static str,
    pub message: String,
}

pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
pub const PROVIDER_RETRYABLE: &str = "PROVIDER_RETRYABLE";
pub const PROVIDER_REJECTED: &str = "PROVIDER_REJECTED";
pub const PROVIDER_EXHAUSTED: &str = "PROVIDER_EXHAUSTED";
pub const PROVIDER_UNAVAILABLE: &str = "PROVIDER_UNAVAILABLE";
pub const STORAGE_ERROR: &str = "STORAGE_ERROR";
pub const PROCESSING_ERROR: &str = "PROCESSING_ERROR";

/// Upper bound on persisted validation detail.
const MAX_MESSAGE_LEN: usize = 300;

impl JobError {
    pub fn classify(&self) -> ErrorClassification {
        let (code, message) = match self {
            JobError::Validation(detail) => (VALIDATION_ERROR, truncate(detail)),
            JobError::Transform(err) if err.is_input_error() => {
                (VALIDATION_ERROR, truncate(&err.to_string()))
            }
            JobError::Transform(_) => (PROCESSING_ERROR, "Image could not be encoded".to_string()),
            JobError::Provider(err) => match err {
                BgRemovalError::Exhausted { .. } => (
                    PROVIDER_EXHAUSTED,
                    "Background removal is temporarily unavailable, retries exhausted".to_string(),
                ),
                BgRemovalError::CircuitOpen => (
                    PROVIDER_UNAVAILABLE,
                    "Background removal is temporarily unavailable".to_string(),
                ),
                e if e.is_retryable() => (
                    PROVIDER_RETRYABLE,
                    "Background removal failed with a transient error".to_string(),
                ),
                _ => (
                    PROVIDER_REJECTED,
                    "Background removal provider rejected the image".to_string(),
                ),
            },
            JobError::Storage(_) => (STORAGE_ERROR, "Object storage operation failed".to_string()),
            JobError::Repository(_) | JobError::Task(_) => {
                (PROCESSING_ERROR, "Job processing failed".to_string())
            }
        };
        ErrorClassification { code, message }
    }
}

fn truncate(message: &str) -> String {
    if message.len() <= MAX_MESSAGE_LEN {
        return message.to_string();
    }
    let mut end = MAX_MESSAGE_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &message[..end])
}
