//! Inbound push callbacks from the backends.
//!
//! `POST /api/webhooks/{backend}` takes one payload object or an array of
//! them. Each one goes through the same ingestion path as polled records.

use std::str::FromStr;

use {
    axum::{
        Json,
        extract::{Path, State},
        http::{HeaderMap, StatusCode, header::AUTHORIZATION},
        response::{IntoResponse, Response},
    },
    secrecy::ExposeSecret,
    serde_json::{Value, json},
    switchboard_common::BackendKind,
    switchboard_relay::IngestOutcome,
    tracing::{debug, warn},
};

use crate::{
    error::{ApiError, bad_request},
    state::AppState,
};

pub const TOKEN_HEADER: &str = "x-webhook-token";

/// Accepts the secret in `X-Webhook-Token`, as a bearer token, or as the
/// bare `Authorization` value.
pub fn authorized(headers: &HeaderMap, secret: &str) -> bool {
    let presented = |name| headers.get(name).and_then(|v| v.to_str().ok());
    if presented(TOKEN_HEADER) == Some(secret) {
        return true;
    }
    match presented(AUTHORIZATION.as_str()) {
        Some(value) => value == secret || value.strip_prefix("Bearer ") == Some(secret),
        None => false,
    }
}

fn outcome_label(outcome: &IngestOutcome) -> &'static str {
    match outcome {
        IngestOutcome::Delivered(_) => "delivered",
        IngestOutcome::Stale => "stale",
        IngestOutcome::Duplicate => "duplicate",
        IngestOutcome::Skipped(_) => "skipped",
        IngestOutcome::Orphaned => "orphaned",
        IngestOutcome::Dropped => "dropped",
    }
}

pub async fn receive(
    State(state): State<AppState>,
    Path(backend): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let Ok(backend) = BackendKind::from_str(&backend) else {
        return Ok((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown backend: {backend}") })),
        )
            .into_response());
    };
    if let Some(secret) = &state.webhook_secret
        && !authorized(&headers, secret.expose_secret())
    {
        warn!(backend = %backend, "webhook rejected: bad token");
        return Ok((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid webhook token" })),
        )
            .into_response());
    }

    let payloads = match body {
        Value::Array(items) => items,
        Value::Object(_) => vec![body],
        _ => return Ok(bad_request("expected a JSON object or array")),
    };

    let mut outcomes = Vec::with_capacity(payloads.len());
    for raw in &payloads {
        let outcome = state.switchboard.ingest_push(backend, raw).await?;
        outcomes.push(outcome_label(&outcome));
    }
    debug!(backend = %backend, count = outcomes.len(), "webhook payloads ingested");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "accepted": outcomes.len(), "outcomes": outcomes })),
    )
        .into_response())
}
