use serde::{Deserialize, Serialize};

/// Closed error taxonomy every crate's error enum maps onto, regardless
/// of which error kind from the job/retrieval design raised it:
/// - `InvalidArgument` ~ ValidationError (4xx, no retry)
/// - `ResourceExhausted`/`Internal` ~ TransientBackendError (job retries with backoff)
/// - `NotFound`/`Internal` ~ LogicError (per-item skip, job continues)
/// - `Internal` ~ LLMParseError (job fails, partial effects preserved)
///
/// `ConflictIgnored` is not an error at all — it is an outcome (see
/// `storage::repo`'s inserted-row counts), so it has no `ErrorCode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::Unauthenticated => "UNAUTHENTICATED",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::Internal => "INTERNAL",
        };
        write!(f, "{}", s)
    }
}

pub trait MemoryError: std::error::Error {
    fn error_code(&self) -> ErrorCode;
}
