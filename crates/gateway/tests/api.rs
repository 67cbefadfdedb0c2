#![allow(clippy::unwrap_used, clippy::expect_used)]
//! HTTP surface tests against a live listener and in-memory backends.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    async_trait::async_trait,
    futures::StreamExt,
    secrecy::Secret,
    serde_json::{Value, json},
    switchboard_channels::{
        AgentBackend, AssistantBackend, BroadcastPushChannel, ContextPayload, ConversationRef,
        InMemoryMessageStore, PollFilter, PollPage, Result as BackendResult, Token,
    },
    switchboard_common::Cursor,
    switchboard_config::SwitchboardConfig,
    switchboard_gateway::{server::build_app, state::AppState},
    switchboard_relay::{Collaborators, Switchboard},
};

#[derive(Default)]
struct QuietAssistant {
    posted: Mutex<Vec<String>>,
}

#[async_trait]
impl AssistantBackend for QuietAssistant {
    async fn issue_token(&self) -> BackendResult<Token> {
        Ok(Token(Secret::new("dl-token".into())))
    }

    async fn start_conversation(&self, _token: &Token) -> BackendResult<ConversationRef> {
        Ok(ConversationRef::new("dl-conv", Secret::new("conv-token".into())))
    }

    async fn post_message(&self, _conversation: &ConversationRef, text: &str) -> BackendResult<()> {
        self.posted.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn poll(&self, _conversation: &ConversationRef, _cursor: Option<&Cursor>) -> BackendResult<PollPage> {
        Ok(PollPage {
            records: Vec::new(),
            next_cursor: None,
        })
    }
}

struct QuietAgent;

#[async_trait]
impl AgentBackend for QuietAgent {
    async fn establish_session(&self, _context: &ContextPayload) -> BackendResult<Value> {
        Ok(json!({ "chatSessionId": "agent-1" }))
    }

    async fn post_message(&self, _agent_session: &str, _text: &str) -> BackendResult<()> {
        Ok(())
    }

    async fn poll(&self, _agent_session: &str, _filter: &PollFilter) -> BackendResult<Vec<Value>> {
        Ok(Vec::new())
    }
}

struct Server {
    base: String,
    assistant: Arc<QuietAssistant>,
    http: reqwest::Client,
}

async fn start(secret: Option<&str>) -> Server {
    let mut config = SwitchboardConfig::default();
    config.relay.assistant_poll_interval_ms = 100;
    config.relay.agent_poll_interval_ms = 100;
    let assistant = Arc::new(QuietAssistant::default());
    let switchboard = Switchboard::new(&config, Collaborators {
        assistant: assistant.clone(),
        agent: Arc::new(QuietAgent),
        push: Arc::new(BroadcastPushChannel::new(16)),
        store: Arc::new(InMemoryMessageStore::new()),
    });
    let state = AppState::new(switchboard, secret.map(|s| Secret::new(s.to_string())));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_app(state)).await.unwrap();
    });
    Server {
        base: format!("http://{addr}"),
        assistant,
        http: reqwest::Client::new(),
    }
}

impl Server {
    async fn create_session(&self) -> Value {
        let resp = self
            .http
            .post(format!("{}/api/sessions", self.base))
            .json(&json!({ "client_id": "u1", "display_name": "Ada" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        resp.json().await.unwrap()
    }
}

fn bot_activity(seq: u32, text: &str) -> Value {
    json!({
        "type": "message",
        "id": format!("dl-conv|{seq:07}"),
        "timestamp": format!("2025-10-23T12:00:{seq:02}Z"),
        "from": { "id": "bot", "name": "Helper", "role": "bot" },
        "conversation": { "id": "dl-conv" },
        "text": text,
    })
}

#[tokio::test]
async fn health_reports_session_counts() {
    let server = start(None).await;
    server.create_session().await;

    let body: Value = server
        .http
        .get(format!("{}/api/health", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"], 1);
    assert_eq!(body["active_sessions"], 1);
}

#[tokio::test]
async fn create_send_and_end() {
    let server = start(None).await;
    let session = server.create_session().await;
    assert_eq!(session["state"], "assistant_active");
    let id = session["id"].as_str().unwrap();

    let resp = server
        .http
        .post(format!("{}/api/sessions/{id}/messages", server.base))
        .json(&json!({ "text": "  where is my order?  " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let message: Value = resp.json().await.unwrap();
    assert_eq!(message["origin"], "client");
    assert_eq!(
        *server.assistant.posted.lock().unwrap(),
        vec!["where is my order?".to_string()]
    );

    let resp = server
        .http
        .delete(format!("{}/api/sessions/{id}", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let ended: Value = resp.json().await.unwrap();
    assert_eq!(ended["state"], "ended");

    let resp = server
        .http
        .post(format!("{}/api/sessions/{id}/messages", server.base))
        .json(&json!({ "text": "hello?" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
}

#[tokio::test]
async fn blank_input_is_rejected() {
    let server = start(None).await;
    let session = server.create_session().await;
    let id = session["id"].as_str().unwrap();

    let resp = server
        .http
        .post(format!("{}/api/sessions/{id}/messages", server.base))
        .json(&json!({ "text": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = server
        .http
        .post(format!("{}/api/sessions", server.base))
        .json(&json!({ "client_id": "" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn unknown_session_is_404() {
    let server = start(None).await;
    for path in ["", "/history", "/events"] {
        let resp = server
            .http
            .get(format!("{}/api/sessions/nope{path}", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404, "GET /api/sessions/nope{path}");
    }
}

#[tokio::test]
async fn webhook_delivers_to_history_and_feed() {
    let server = start(None).await;
    let session = server.create_session().await;
    let id = session["id"].as_str().unwrap();

    let events = server
        .http
        .get(format!("{}/api/sessions/{id}/events", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(events.status(), 200);
    let mut body = events.bytes_stream();

    let resp = server
        .http
        .post(format!("{}/api/webhooks/assistant", server.base))
        .json(&json!([bot_activity(1, "Hi there"), bot_activity(1, "Hi there")]))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let ack: Value = resp.json().await.unwrap();
    assert_eq!(ack["accepted"], 2);
    assert_eq!(ack["outcomes"], json!(["delivered", "duplicate"]));

    let mut seen = String::new();
    while !seen.contains("Hi there") {
        let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .expect("feed stalled")
            .expect("feed closed")
            .unwrap();
        seen.push_str(&String::from_utf8_lossy(&chunk));
    }
    assert!(seen.contains("event: message"));

    let history: Vec<Value> = server
        .http
        .get(format!("{}/api/sessions/{id}/history", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        history.iter().filter(|m| m["text"] == "Hi there").count(),
        1
    );
}

#[tokio::test]
async fn webhook_checks_token_and_backend() {
    let server = start(Some("s3cret")).await;
    let url = format!("{}/api/webhooks/assistant", server.base);

    let resp = server
        .http
        .post(&url)
        .json(&bot_activity(1, "hi"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = server
        .http
        .post(&url)
        .bearer_auth("s3cret")
        .json(&bot_activity(1, "hi"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let ack: Value = resp.json().await.unwrap();
    assert_eq!(ack["outcomes"], json!(["orphaned"]));

    let resp = server
        .http
        .post(format!("{}/api/webhooks/fax", server.base))
        .header("x-webhook-token", "s3cret")
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}
