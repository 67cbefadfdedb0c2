use std::time::Duration;

use {
    async_trait::async_trait,
    chrono::Utc,
    dashmap::DashMap,
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
    serde_json::{Value, json},
    switchboard_channels::{AgentBackend, ContextPayload, Error, PollFilter, Result},
    switchboard_config::AgentConfig,
    tracing::{debug, info},
    uuid::Uuid,
};

use crate::{
    http::{check_status, request_error},
    query,
};

const INTEGRATION_PATH: &str = "/api/sn_va_as_service/bot/integration";
const MESSAGE_TABLE_PATH: &str = "/api/now/table/sys_cs_message";

/// Bot-integration state needed to keep talking on an opened session.
#[derive(Debug, Clone)]
struct OpenSession {
    request_id: String,
    now_bot_id: Option<String>,
    now_session_id: Option<String>,
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct TableResponse {
    #[serde(default)]
    result: Vec<Value>,
}

pub struct ServiceNowClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: Secret<String>,
    token: Secret<String>,
    topic_id: String,
    enterprise_id: String,
    email_domain: String,
    timeout: Duration,
    /// Keyed by every session id the establish response exposed, since the
    /// relay decides which one it uses.
    sessions: DashMap<String, OpenSession>,
}

impl ServiceNowClient {
    pub fn new(config: &AgentConfig, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::external("building ServiceNow HTTP client", e))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            token: config.token.clone(),
            topic_id: config.topic_id.clone(),
            enterprise_id: config.enterprise_id.clone(),
            email_domain: config.email_domain.clone(),
            timeout,
            sessions: DashMap::new(),
        })
    }

    async fn integrate(&self, operation: &'static str, payload: &Value) -> Result<Value> {
        let resp = self
            .http
            .post(format!("{}{INTEGRATION_PATH}", self.base_url))
            .header("Token", self.token.expose_secret())
            .basic_auth(&self.username, Some(self.password.expose_secret()))
            .json(payload)
            .send()
            .await
            .map_err(|e| request_error(operation, self.timeout, e))?;
        let resp = check_status(operation, resp).await?;
        // Message posts may come back with an empty body.
        let body = resp
            .text()
            .await
            .map_err(|e| request_error(operation, self.timeout, e))?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }

    fn message(&self, open: &OpenSession, session_id: Option<&str>, text: &str, typed: bool) -> Value {
        json!({
            "requestId": open.request_id,
            "enterpriseId": self.enterprise_id,
            "nowBotId": open.now_bot_id,
            "nowSessionId": session_id.or(open.now_session_id.as_deref()),
            "topic": self.topic_id,
            "message": {
                "text": text,
                "typed": typed,
                "clientMessageId": format!("msg_{}", Uuid::new_v4().simple()),
                "attachment": null,
            },
            "timestamp": Utc::now().timestamp(),
            "userId": open.user_id,
        })
    }
}

/// Every session identifier an establish response carries.
fn session_ids(response: &Value) -> Vec<String> {
    const KEYS: [&str; 3] = ["chatSessionId", "nowSessionId", "conversationId"];
    let mut ids = Vec::new();
    let mut collect = |obj: &Value| {
        for key in KEYS {
            if let Some(id) = obj.get(key).and_then(Value::as_str)
                && !id.is_empty()
                && !ids.iter().any(|known| known == id)
            {
                ids.push(id.to_string());
            }
        }
    };
    collect(response);
    match response.get("body") {
        Some(Value::Array(items)) => items.iter().for_each(&mut collect),
        Some(body) => {
            if let Some(ui) = body.get("uiData") {
                collect(ui);
            }
        },
        None => {},
    }
    ids
}

#[async_trait]
impl AgentBackend for ServiceNowClient {
    async fn establish_session(&self, context: &ContextPayload) -> Result<Value> {
        let client = &context.client;
        let open = OpenSession {
            request_id: format!("req_{}", Uuid::new_v4().simple()),
            now_bot_id: None,
            now_session_id: None,
            user_id: client.id.clone(),
        };
        let mut payload = self.message(&open, None, &context.summary(), false);
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("clientVariables".into(), json!({}));
            obj.insert("contextVariables".into(), json!({}));
            obj.insert("botToBot".into(), Value::Bool(true));
            obj.insert(
                "emailId".into(),
                Value::String(
                    client
                        .email
                        .clone()
                        .unwrap_or_else(|| format!("{}@{}", client.id, self.email_domain)),
                ),
            );
            obj.insert(
                "userName".into(),
                Value::String(
                    client
                        .display_name
                        .clone()
                        .unwrap_or_else(|| "Guest User".to_string()),
                ),
            );
        }

        let response = self.integrate("establish session", &payload).await?;
        let open = OpenSession {
            now_bot_id: response
                .get("nowBotId")
                .and_then(Value::as_str)
                .map(String::from),
            now_session_id: response
                .get("nowSessionId")
                .and_then(Value::as_str)
                .map(String::from),
            ..open
        };
        let ids = session_ids(&response);
        info!(session_id = %context.session_id, agent_ids = ?ids, "ServiceNow session requested");
        for id in ids {
            self.sessions.insert(id, open.clone());
        }
        Ok(response)
    }

    async fn post_message(&self, agent_session: &str, text: &str) -> Result<()> {
        let open = match self.sessions.get(agent_session) {
            Some(open) => open.value().clone(),
            None => {
                debug!(agent_session, "no integration state for session, posting with defaults");
                OpenSession {
                    request_id: format!("req_{}", Uuid::new_v4().simple()),
                    now_bot_id: None,
                    now_session_id: None,
                    user_id: agent_session.to_string(),
                }
            },
        };
        let payload = self.message(&open, Some(agent_session), text, true);
        self.integrate("post message", &payload).await?;
        Ok(())
    }

    async fn poll(&self, agent_session: &str, filter: &PollFilter) -> Result<Vec<Value>> {
        const OP: &str = "query messages";
        let since = filter.since.as_ref().map(|c| c.as_str());
        let sysparm_query = query::agent_messages(agent_session, since);
        let limit = filter.limit.max(1).to_string();
        let resp = self
            .http
            .get(format!("{}{MESSAGE_TABLE_PATH}", self.base_url))
            .basic_auth(&self.username, Some(self.password.expose_secret()))
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&[("sysparm_query", sysparm_query.as_str()), ("sysparm_limit", limit.as_str())])
            .send()
            .await
            .map_err(|e| request_error(OP, self.timeout, e))?;
        let table: TableResponse = check_status(OP, resp)
            .await?
            .json()
            .await
            .map_err(|e| request_error(OP, self.timeout, e))?;
        Ok(table.result)
    }
}
