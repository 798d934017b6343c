use epigraph_core::error::{ErrorCode, MemoryError};
use epigraph_core::model::{EdgeValidationError, SourceValidationError};
use ingestion::ExtractError;
use query::QueryError;
use slm::clients::CompletionError;
use storage::RepoError;
use thiserror::Error;

use crate::queue::PayloadValidationError;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid job payload: {0}")]
    InvalidPayload(#[from] PayloadValidationError),
    #[error("repository error: {0}")]
    Repo(#[from] RepoError),
    #[error("extraction error: {0}")]
    Extract(#[from] ExtractError),
    #[error("query engine error: {0}")]
    Query(#[from] QueryError),
    #[error("completion error: {0}")]
    Completion(#[from] CompletionError),
    #[error("edge validation error: {0}")]
    EdgeValidation(#[from] EdgeValidationError),
    #[error("source validation error: {0}")]
    SourceValidation(#[from] SourceValidationError),
    #[error("could not parse completion response against {schema}: {reason}")]
    ResponseShape { schema: &'static str, reason: String },
    #[error("logic error: {0}")]
    Logic(String),
}

impl MemoryError for JobError {
    fn error_code(&self) -> ErrorCode {
        match self {
            JobError::InvalidPayload(_) => ErrorCode::InvalidArgument,
            JobError::EdgeValidation(_) | JobError::SourceValidation(_) => {
                ErrorCode::InvalidArgument
            }
            JobError::Logic(_) => ErrorCode::Internal,
            JobError::Completion(_) => ErrorCode::Internal,
            _ => ErrorCode::Internal,
        }
    }
}
