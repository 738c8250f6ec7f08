use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use durastream::Error;
use serde::Serialize;

/// A library error on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub Error);

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    pub const fn status(&self) -> StatusCode {
        match &self.0 {
            Error::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Error::ServiceShutdown => StatusCode::SERVICE_UNAVAILABLE,
            Error::DuplicateSequence { .. } | Error::OutOfOrder { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!("Request failed: {}", self.0);
        }
        let body = ErrorBody {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
