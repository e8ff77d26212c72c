use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::merge::MergeError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorObject,
}

#[derive(Debug, Serialize)]
pub struct ErrorObject {
    pub reason: String,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(&'static str, String),
    Forbidden(&'static str, String),
    BadRequest(&'static str, String),
    NotFound(&'static str, String),
    Conflict(&'static str, String),
    ServiceUnavailable(&'static str, String),
    Internal(String),
}

impl ApiError {
    pub fn session_expired() -> Self {
        ApiError::Unauthorized("SESSION_EXPIRED", "Session expired".into())
    }

    fn to_error_response(reason: &str, message: &str) -> Json<ErrorResponse> {
        Json(ErrorResponse {
            error: ErrorObject {
                reason: reason.to_string(),
                message: message.to_string(),
            },
        })
    }

    fn status_and_body(&self) -> (StatusCode, &str, &str) {
        match self {
            ApiError::Unauthorized(r, m) => (StatusCode::UNAUTHORIZED, *r, m.as_str()),
            ApiError::Forbidden(r, m) => (StatusCode::FORBIDDEN, *r, m.as_str()),
            ApiError::BadRequest(r, m) => (StatusCode::BAD_REQUEST, *r, m.as_str()),
            ApiError::NotFound(r, m) => (StatusCode::NOT_FOUND, *r, m.as_str()),
            ApiError::Conflict(r, m) => (StatusCode::CONFLICT, *r, m.as_str()),
            ApiError::ServiceUnavailable(r, m) => (StatusCode::SERVICE_UNAVAILABLE, *r, m.as_str()),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", m.as_str()),
        }
    }
}

impl From<MergeError> for ApiError {
    fn from(e: MergeError) -> Self {
        let reason = e.reason();
        let message = e.to_string();
        match e {
            MergeError::PatientNotFound(_) => ApiError::NotFound(reason, message),
            MergeError::SelfMerge(_) | MergeError::Validation(_) => {
                ApiError::BadRequest(reason, message)
            }
            MergeError::SourceAlreadyMerged(_)
            | MergeError::TargetAlreadyMerged(_)
            | MergeError::CircularMerge { .. } => ApiError::Conflict(reason, message),
            MergeError::Transaction(_) => ApiError::ServiceUnavailable(reason, message),
        }
    }
}

// Malformed input is a VALIDATION_ERROR in the usual envelope, never axum's
// plain-text rejection.
impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        MergeError::Validation(rejection.body_text()).into()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        MergeError::Validation(rejection.body_text()).into()
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        MergeError::Validation(rejection.body_text()).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, reason, message) = self.status_and_body();
        (status, ApiError::to_error_response(reason, message)).into_response()
    }
}
