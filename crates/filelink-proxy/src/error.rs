//! HTTP error responses.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use filelink_types::ErrorBody;

use crate::chunk_source::ChunkError;
use crate::registry::ResolveError;

/// Terminal error for a link request, sent before any body bytes.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("link not found")]
    NotFound,

    #[error("link expired")]
    Expired,

    #[error("range not satisfiable for {total_size} bytes")]
    RangeNotSatisfiable { total_size: u64 },

    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("remote handle invalid: {0}")]
    HandleInvalid(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Expired => "expired",
            Self::RangeNotSatisfiable { .. } => "range_not_satisfiable",
            Self::RemoteUnavailable(_) => "remote_unavailable",
            Self::HandleInvalid(_) => "handle_invalid",
            Self::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Expired => StatusCode::GONE,
            Self::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::RemoteUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::HandleInvalid(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ResolveError> for ApiError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::NotFound => Self::NotFound,
            ResolveError::Expired => Self::Expired,
            ResolveError::Backend(msg) => Self::Internal(msg),
        }
    }
}

impl From<ChunkError> for ApiError {
    fn from(e: ChunkError) -> Self {
        match e {
            ChunkError::RemoteUnavailable(msg) => Self::RemoteUnavailable(msg),
            ChunkError::HandleInvalid(msg) => Self::HandleInvalid(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if let Self::RangeNotSatisfiable { total_size } = self {
            let mut response = status.into_response();
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", total_size)) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
            return response;
        }
        (status, Json(ErrorBody::new(self.code()))).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::Expired.status_code(), StatusCode::GONE);
        assert_eq!(
            ApiError::from(ChunkError::RemoteUnavailable("x".into())).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(ChunkError::HandleInvalid("x".into())).code(),
            "handle_invalid"
        );
        assert_eq!(
            ApiError::from(ResolveError::Backend("disk".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_unsatisfiable_carries_content_range() {
        let response = ApiError::RangeNotSatisfiable { total_size: 1000 }.into_response();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */1000");
    }
}
