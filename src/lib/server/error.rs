use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

use crate::db::StoreError;
use crate::instance::InstanceError;
use crate::submission::SubmitError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("missing or invalid user")]
    Unauthorized,
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    TooManyRequests(String),
    /// the proxy could not reach the instance
    #[error("{0}")]
    Teapot(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("internal error")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Teapot(_) => StatusCode::IM_A_TEAPOT,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "status": "error", "message": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}

/// `{"status": "ok", "data": ...}`
pub fn ok<T: Serialize>(data: T) -> Json<Value> {
    json!({ "status": "ok", "data": data }).into()
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        warn!("store error: {:?}", e);
        Self::Internal
    }
}

impl From<InstanceError> for ApiError {
    fn from(e: InstanceError) -> Self {
        match e {
            InstanceError::NotContainerType
            | InstanceError::AlreadyRunning
            | InstanceError::NoInstance
            | InstanceError::NotYetProlongable(_)
            | InstanceError::ProlongLimitReached
            | InstanceError::Misconfigured => Self::BadRequest(e.to_string()),
            InstanceError::CooldownActive(_) | InstanceError::QuotaExceeded(_) => {
                Self::TooManyRequests(e.to_string())
            }
            InstanceError::Runtime(_) => Self::Unavailable("container runtime unavailable".into()),
            InstanceError::Store(e) => e.into(),
        }
    }
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::NotAccepted => Self::Forbidden(e.to_string()),
            SubmitError::GameNotActive
            | SubmitError::ChallengeUnavailable
            | SubmitError::EmptyAnswer
            | SubmitError::AnswerTooLong => Self::BadRequest(e.to_string()),
            SubmitError::NotFound => Self::NotFound(e.to_string()),
            SubmitError::QueueClosed => Self::Unavailable(e.to_string()),
            SubmitError::Store(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_errors_map_to_status() {
        let cases = [
            (InstanceError::AlreadyRunning, StatusCode::BAD_REQUEST),
            (InstanceError::NotContainerType, StatusCode::BAD_REQUEST),
            (InstanceError::NoInstance, StatusCode::BAD_REQUEST),
            (InstanceError::NotYetProlongable(30), StatusCode::BAD_REQUEST),
            (InstanceError::CooldownActive(5), StatusCode::TOO_MANY_REQUESTS),
            (InstanceError::QuotaExceeded(3), StatusCode::TOO_MANY_REQUESTS),
            (
                InstanceError::Store(StoreError::Corrupt("x".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn submit_errors_map_to_status() {
        assert_eq!(ApiError::from(SubmitError::NotAccepted).status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::from(SubmitError::NotFound).status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::from(SubmitError::EmptyAnswer).status(), StatusCode::BAD_REQUEST);
    }
}
