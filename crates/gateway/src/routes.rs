//! Session routes.

use std::convert::Infallible;

use {
    axum::{
        Json, Router,
        extract::{Path, State},
        http::StatusCode,
        response::{
            IntoResponse, Response,
            sse::{Event, KeepAlive, Sse},
        },
        routing::{get, post},
    },
    futures::{Stream, StreamExt},
    serde::Deserialize,
    serde_json::json,
    switchboard_common::{CanonicalMessage, ClientIdentity, Origin, SessionId},
    tracing::warn,
};

use crate::{
    error::{ApiError, bad_request},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub client_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub text: String,
}

pub fn session_router() -> Router<AppState> {
    Router::new()
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{id}", get(get_session).delete(end_session))
        .route("/api/sessions/{id}/messages", post(send_message))
        .route("/api/sessions/{id}/history", get(history))
        .route("/api/sessions/{id}/events", get(events))
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.switchboard.stats().await;
    Json(json!({
        "status": "ok",
        "version": state.version,
        "sessions": stats.sessions,
        "active_sessions": stats.active_sessions,
        "orphaned_payloads": stats.orphaned_payloads,
    }))
}

async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionRequest>,
) -> Result<Response, ApiError> {
    if body.client_id.trim().is_empty() {
        return Ok(bad_request("client_id is required"));
    }
    let mut client = ClientIdentity::new(body.client_id);
    if let Some(name) = body.display_name {
        client = client.with_display_name(name);
    }
    if let Some(email) = body.email {
        client = client.with_email(email);
    }
    let session = state.switchboard.create_session(client).await?;
    Ok((StatusCode::CREATED, Json(session)).into_response())
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let session = state.switchboard.session(&SessionId::from(id)).await?;
    Ok(Json(session).into_response())
}

async fn end_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let session = state.switchboard.end_session(&SessionId::from(id)).await?;
    Ok(Json(session).into_response())
}

async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SendMessageRequest>,
) -> Result<Response, ApiError> {
    let text = body.text.trim();
    if text.is_empty() {
        return Ok(bad_request("text must not be empty"));
    }
    let message = state
        .switchboard
        .send_client_message(&SessionId::from(id), text)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(message)).into_response())
}

async fn history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let messages = state.switchboard.history(&SessionId::from(id)).await?;
    Ok(Json(messages).into_response())
}

fn to_event(message: &CanonicalMessage) -> Event {
    let kind = match message.origin {
        Origin::System => "notice",
        _ => "message",
    };
    Event::default()
        .event(kind)
        .id(message.id.clone())
        .json_data(message)
        .unwrap_or_else(|e| {
            warn!(message_id = %message.id, error = %e, "unserializable message on feed");
            Event::default().event("error").data("unserializable message")
        })
}

async fn events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let feed = state.switchboard.subscribe(&SessionId::from(id)).await?;
    let stream = feed.map(|message| Ok(to_event(&message)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
