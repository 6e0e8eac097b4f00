//! Problem details error responses.

use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::jobs::JobError;
use crate::resources::ResourceError;
use crate::store::Retryable;

#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
    pub retryable: bool,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://hydromaas.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            code,
            retryable: false,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn with_status(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::CONFLICT, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn retryable(mut self) -> Self {
        self.problem.retryable = true;
        self
    }
}

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        match &e {
            JobError::InvalidRequest(_) => ApiError::bad_request("invalid_request", e.to_string()),
            JobError::UnrecognizedParadigm(_) => {
                ApiError::bad_request("unrecognized_paradigm", e.to_string())
            }
            JobError::InvalidJobId(_) => ApiError::bad_request("invalid_job_id", e.to_string()),
            JobError::Resource(ResourceError::InvalidParameters { .. }) => {
                ApiError::bad_request("invalid_allocation", e.to_string())
            }
            JobError::DuplicateJob(_) => ApiError::conflict("duplicate_job", e.to_string()),
            JobError::NotFound(_) => ApiError::not_found("job_not_found", e.to_string()),
            _ if e.is_conflict() => ApiError::conflict("write_conflict", e.to_string()).retryable(),
            _ => {
                tracing::error!(error = %e, "Job operation failed");
                ApiError::internal("internal_error", "Job operation failed")
            }
        }
    }
}

impl From<ResourceError> for ApiError {
    fn from(e: ResourceError) -> Self {
        tracing::error!(error = %e, "Resource query failed");
        ApiError::internal("internal_error", "Resource query failed")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}
