use std::time::Duration;

use switchboard_channels::{Error, Result};

/// Map a transport failure onto the backend error taxonomy.
pub(crate) fn request_error(operation: &'static str, after: Duration, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::timeout(operation, after)
    } else if err.is_decode() {
        Error::decode(format!("{operation}: {err}"))
    } else {
        Error::unavailable(format!("{operation}: {err}"))
    }
}

/// Non-2xx responses become `Rejected` with the body as the message.
pub(crate) async fn check_status(
    operation: &'static str,
    resp: reqwest::Response,
) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(Error::rejected(status.as_u16(), format!("{operation}: {body}")))
}
