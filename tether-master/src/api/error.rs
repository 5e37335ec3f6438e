//! API Error Handling
//!
//! Unified error types and conversion for API responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tether_core::store::StoreError;

use crate::service::dispatcher::DispatchError;
use crate::service::engine::EngineError;

/// API error type
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unavailable(String),
    Timeout(String),
    InternalError(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                msg
            }
            ApiError::NotFound(msg)
            | ApiError::BadRequest(msg)
            | ApiError::Conflict(msg)
            | ApiError::Unavailable(msg)
            | ApiError::Timeout(msg) => msg,
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let message = err.to_string();
        match err {
            EngineError::Store(store) => match store {
                StoreError::JobNotFound(_) | StoreError::DetailNotFound { .. } => {
                    ApiError::NotFound(message)
                }
                StoreError::JobExists(_) => ApiError::Conflict(message),
                StoreError::Definition(_) | StoreError::InvalidPath(_) => {
                    ApiError::BadRequest(message)
                }
                StoreError::Io(_) | StoreError::Json(_) => ApiError::InternalError(message),
            },
            EngineError::Dispatch(dispatch) => match dispatch {
                DispatchError::NoNodeAvailable | DispatchError::UnknownNode(_) => {
                    ApiError::Unavailable(message)
                }
                DispatchError::NotDispatched(_) | DispatchError::AlreadyRegistered(_) => {
                    ApiError::Conflict(message)
                }
            },
            EngineError::Transport(_) => ApiError::Unavailable(message),
            EngineError::StatusTimeout(_) => ApiError::Timeout(message),
            EngineError::StageNotFound { .. } | EngineError::StepNotFound { .. } => {
                ApiError::NotFound(message)
            }
            EngineError::StillRunning(_) | EngineError::AlreadyStarted(_) => {
                ApiError::Conflict(message)
            }
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::dto::message::JobRef;

    fn status_of(err: EngineError) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn test_engine_error_status_mapping() {
        assert_eq!(
            status_of(StoreError::JobNotFound("build".into()).into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(StoreError::JobExists("build".into()).into()),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(StoreError::InvalidPath("../x".into()).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(DispatchError::NoNodeAvailable.into()),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(EngineError::StatusTimeout(JobRef::new("build", 1))),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_of(EngineError::StageNotFound {
                job: JobRef::new("build", 1),
                stage: "deploy".into(),
            }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(EngineError::AlreadyStarted(JobRef::new("build", 1))),
            StatusCode::CONFLICT
        );
    }
}
