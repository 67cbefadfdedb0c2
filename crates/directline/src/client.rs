use std::time::Duration;

use {
    async_trait::async_trait,
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
    serde_json::{Value, json},
    switchboard_channels::{AssistantBackend, ConversationRef, Error, PollPage, Result, Token},
    switchboard_common::Cursor,
    switchboard_config::AssistantConfig,
    tracing::debug,
};

use crate::http::{check_status, request_error};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationResponse {
    conversation_id: String,
    /// Direct Line may hand back a refreshed, conversation-scoped token.
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ActivitySet {
    #[serde(default)]
    activities: Vec<Value>,
    watermark: Option<String>,
}

pub struct DirectLineClient {
    http: reqwest::Client,
    base_url: String,
    secret: Secret<String>,
    user_id: String,
    user_name: String,
    timeout: Duration,
}

impl DirectLineClient {
    pub fn new(config: &AssistantConfig, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::external("building Direct Line HTTP client", e))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            secret: config.secret.clone(),
            user_id: config.user_id.clone(),
            user_name: config.user_name.clone(),
            timeout,
        })
    }

    fn conversation_url(&self, conversation_id: &str, tail: &str) -> String {
        format!(
            "{}/v3/directline/conversations/{}{tail}",
            self.base_url,
            urlencoding::encode(conversation_id)
        )
    }
}

#[async_trait]
impl AssistantBackend for DirectLineClient {
    async fn issue_token(&self) -> Result<Token> {
        const OP: &str = "generate token";
        let resp = self
            .http
            .post(format!("{}/v3/directline/tokens/generate", self.base_url))
            .bearer_auth(self.secret.expose_secret())
            .json(&json!({ "user": { "id": self.user_id, "name": self.user_name } }))
            .send()
            .await
            .map_err(|e| request_error(OP, self.timeout, e))?;
        let body: TokenResponse = check_status(OP, resp)
            .await?
            .json()
            .await
            .map_err(|e| request_error(OP, self.timeout, e))?;
        Ok(Token(Secret::new(body.token)))
    }

    async fn start_conversation(&self, token: &Token) -> Result<ConversationRef> {
        const OP: &str = "start conversation";
        let resp = self
            .http
            .post(format!("{}/v3/directline/conversations", self.base_url))
            .bearer_auth(token.0.expose_secret())
            .send()
            .await
            .map_err(|e| request_error(OP, self.timeout, e))?;
        let body: ConversationResponse = check_status(OP, resp)
            .await?
            .json()
            .await
            .map_err(|e| request_error(OP, self.timeout, e))?;
        debug!(conversation_id = %body.conversation_id, "Direct Line conversation started");
        let scoped = body
            .token
            .map(Secret::new)
            .unwrap_or_else(|| token.0.clone());
        Ok(ConversationRef::new(body.conversation_id, scoped))
    }

    async fn post_message(&self, conversation: &ConversationRef, text: &str) -> Result<()> {
        const OP: &str = "post activity";
        let activity = json!({
            "type": "message",
            "from": { "id": self.user_id, "name": self.user_name },
            "text": text,
        });
        let resp = self
            .http
            .post(self.conversation_url(&conversation.conversation_id, "/activities"))
            .bearer_auth(conversation.token.expose_secret())
            .json(&activity)
            .send()
            .await
            .map_err(|e| request_error(OP, self.timeout, e))?;
        check_status(OP, resp).await?;
        Ok(())
    }

    async fn poll(&self, conversation: &ConversationRef, cursor: Option<&Cursor>) -> Result<PollPage> {
        const OP: &str = "get activities";
        let mut request = self
            .http
            .get(self.conversation_url(&conversation.conversation_id, "/activities"))
            .bearer_auth(conversation.token.expose_secret());
        if let Some(watermark) = cursor {
            request = request.query(&[("watermark", watermark.as_str())]);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| request_error(OP, self.timeout, e))?;
        let set: ActivitySet = check_status(OP, resp)
            .await?
            .json()
            .await
            .map_err(|e| request_error(OP, self.timeout, e))?;
        Ok(PollPage {
            records: set.activities,
            next_cursor: set.watermark.filter(|w| !w.is_empty()).map(Cursor::new),
        })
    }
}
