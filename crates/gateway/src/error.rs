//! Relay errors as HTTP responses.

use {
    axum::{
        http::StatusCode,
        response::{IntoResponse, Json, Response},
    },
    serde_json::json,
    switchboard_relay::Error,
    tracing::warn,
};

pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

/// Status code for a relay error.
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Session(switchboard_sessions::Error::NotFound { .. }) | Error::UnknownSession { .. } => {
            StatusCode::NOT_FOUND
        },
        Error::Session(switchboard_sessions::Error::InvalidTransition { .. }) | Error::NotRoutable { .. } => {
            StatusCode::CONFLICT
        },
        Error::Backend { source, .. } if source.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
        Error::Backend { .. } | Error::HandoffEstablishFailed { .. } => StatusCode::BAD_GATEWAY,
        Error::Session(_) | Error::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// 400 with a message, for request validation failures.
pub fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}
