//! Backend error -> gRPC status mapping.

use crate::backend::BackendError;
use tonic::Status;

/// Message returned for failures whose detail stays server-side.
pub const INTERNAL_ERROR_MESSAGE: &str = "An internal error occurred.";

impl From<BackendError> for Status {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::DocumentNotFound(_)
            | BackendError::BucketNotFound(_)
            | BackendError::ScopeNotFound(_)
            | BackendError::CollectionNotFound(_)
            | BackendError::IndexNotFound(_)
            | BackendError::TransactionNotFound(_) => Status::not_found(err.to_string()),

            BackendError::DocumentExists(_)
            | BackendError::BucketExists(_)
            | BackendError::CollectionExists(_)
            | BackendError::IndexExists(_) => Status::already_exists(err.to_string()),

            BackendError::CasMismatch(_) => Status::aborted(err.to_string()),
            BackendError::InvalidArgument(_) => Status::invalid_argument(err.to_string()),
            BackendError::ServiceUnavailable(_) => Status::unavailable(err.to_string()),
            BackendError::Timeout => Status::deadline_exceeded(err.to_string()),
            BackendError::Unsupported(_) => Status::unimplemented(err.to_string()),

            BackendError::Other(detail) => {
                tracing::error!(error = %detail, "Backend operation failed");
                Status::internal(INTERNAL_ERROR_MESSAGE)
            }
        }
    }
}
