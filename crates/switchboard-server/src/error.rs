use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use switchboard_core::Error;
use tracing::error;

/// Error envelope returned by every endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub detail: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: Option<&str>) -> Self {
        if self.detail.is_none() {
            self.detail = detail.map(str::to_string);
        }
        self
    }

    /// Map a failure from a named function. Failures with their own status
    /// keep it; everything else takes the function's `fallback`.
    pub fn from_function(err: Error, fallback: StatusCode) -> Self {
        let status = specific_status(&err).unwrap_or(fallback);
        Self::build(err, status)
    }

    fn build(err: Error, status: StatusCode) -> Self {
        if let Error::Other(inner) = &err {
            error!("internal failure: {:#}", inner);
        }
        Self {
            status,
            detail: err.detail().map(str::to_string),
            message: err.to_string(),
        }
    }
}

fn specific_status(err: &Error) -> Option<StatusCode> {
    match err {
        Error::Unauthorized { .. } => Some(StatusCode::UNAUTHORIZED),
        Error::NotConnected(_) => Some(StatusCode::NOT_FOUND),
        Error::BadGateway(_) => Some(StatusCode::BAD_GATEWAY),
        Error::Rejected(_) => Some(StatusCode::BAD_REQUEST),
        _ => None,
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = specific_status(&err).unwrap_or(match &err {
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        });
        Self::build(err, status)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
            detail: self.detail,
        };
        (self.status, Json(body)).into_response()
    }
}
