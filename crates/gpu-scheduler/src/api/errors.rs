use core::error::Error;

use poem::error::ResponseError;
use poem::http::StatusCode;

/// API errors
#[derive(Debug, derive_more::Display)]
pub enum ApiError {
    #[display("Server error: {message}")]
    ServerError { message: String },
    #[display("Resource index unavailable")]
    IndexUnavailable,
    #[display("Failed to store {what}: {message}")]
    StoreFailed { what: &'static str, message: String },
}

impl Error for ApiError {}

impl ResponseError for ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::ServerError { .. } | ApiError::StoreFailed { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::IndexUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}
