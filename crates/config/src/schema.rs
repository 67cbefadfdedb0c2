/// Config schema types (server, backends, relay timing, handoff, store).
use std::time::Duration;

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardConfig {
    pub server: ServerConfig,
    pub assistant: AssistantConfig,
    pub agent: AgentConfig,
    pub relay: RelayConfig,
    pub handoff: HandoffConfig,
    pub store: StoreConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to. Defaults to "127.0.0.1".
    pub bind: String,
    /// Port to listen on. Defaults to 3001.
    pub port: u16,
    /// Shared secret expected on inbound webhook calls, either as
    /// `X-Webhook-Token` or `Authorization: Bearer <secret>`.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_option_redacted"
    )]
    pub webhook_secret: Option<Secret<String>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 3001,
            webhook_secret: None,
        }
    }
}

/// Assistant backend (Direct Line) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    pub base_url: String,
    /// Direct Line secret used to mint conversation tokens.
    #[serde(serialize_with = "serialize_redacted")]
    pub secret: Secret<String>,
    /// `from.id` the client's messages are posted under. Activities echoed
    /// back with this sender are treated as client echoes.
    pub user_id: String,
    pub user_name: String,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            base_url: "https://directline.botframework.com".into(),
            secret: Secret::new(String::new()),
            user_id: "user".into(),
            user_name: "User".into(),
        }
    }
}

/// Agent backend (ServiceNow) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub base_url: String,
    pub username: String,
    #[serde(serialize_with = "serialize_redacted")]
    pub password: Secret<String>,
    /// Value for the `Token` header on bot-integration calls.
    #[serde(serialize_with = "serialize_redacted")]
    pub token: Secret<String>,
    pub topic_id: String,
    pub enterprise_id: String,
    /// Maximum records requested per poll.
    pub poll_limit: u32,
    /// Domain used to synthesize a client email when none is known.
    pub email_domain: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            username: String::new(),
            password: Secret::new(String::new()),
            token: Secret::new(String::new()),
            topic_id: String::new(),
            enterprise_id: "ServiceNow".into(),
            poll_limit: 100,
            email_domain: "example.com".into(),
        }
    }
}

/// Timing and capacity knobs for the relay core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub assistant_poll_interval_ms: u64,
    pub agent_poll_interval_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Consecutive poll failures before the session is flagged degraded.
    pub degraded_after_failures: u32,
    /// Bound on every post-message and poll call.
    pub call_timeout_ms: u64,
    pub orphan_capacity: usize,
    pub orphan_ttl_secs: u64,
    /// How long an ended session keeps its registry entry and dedup record.
    pub session_retention_secs: u64,
    pub sweep_interval_secs: u64,
    /// Per-session subscriber channel capacity.
    pub subscriber_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            assistant_poll_interval_ms: 1_000,
            agent_poll_interval_ms: 3_000,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            degraded_after_failures: 5,
            call_timeout_ms: 10_000,
            orphan_capacity: 256,
            orphan_ttl_secs: 30,
            session_retention_secs: 3_600,
            sweep_interval_secs: 900,
            subscriber_buffer: 256,
        }
    }
}

impl RelayConfig {
    pub fn assistant_poll_interval(&self) -> Duration {
        Duration::from_millis(self.assistant_poll_interval_ms)
    }

    pub fn agent_poll_interval(&self) -> Duration {
        Duration::from_millis(self.agent_poll_interval_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn orphan_ttl(&self) -> Duration {
        Duration::from_secs(self.orphan_ttl_secs)
    }

    pub fn session_retention(&self) -> Duration {
        Duration::from_secs(self.session_retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// One step in the agent-session-id extraction chain. Rules are tried in
/// the configured order; the first that yields a non-empty string wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdExtractionRule {
    /// JSON pointer (RFC 6901) into the response body.
    Pointer { pointer: String },
    /// Find the first object in the array at `array` whose `match_field`
    /// equals `match_value`, then read `field` from it.
    ArrayItem {
        array: String,
        match_field: String,
        match_value: String,
        field: String,
    },
}

impl IdExtractionRule {
    fn array_item(match_value: &str, field: &str) -> Self {
        Self::ArrayItem {
            array: "/body".into(),
            match_field: "actionType".into(),
            match_value: match_value.into(),
            field: field.into(),
        }
    }

    fn pointer(pointer: &str) -> Self {
        Self::Pointer {
            pointer: pointer.into(),
        }
    }
}

/// Establishment is retried at most once before the session rolls back.
pub const MAX_ESTABLISH_RETRIES: u32 = 1;

/// Escalation detection and handoff protocol settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffConfig {
    /// Case-insensitive substrings that trigger a handoff when they appear
    /// in an assistant message.
    pub triggers: Vec<String>,
    /// Most recent transcript entries forwarded to the agent.
    pub transcript_limit: usize,
    pub establish_timeout_ms: u64,
    /// Extra establish attempts after the first one fails, at most
    /// [`MAX_ESTABLISH_RETRIES`].
    pub establish_retries: u32,
    pub id_extraction: Vec<IdExtractionRule>,
    /// Fall back to an id derived from the assistant conversation when no
    /// extraction rule matches.
    pub synthesize_from_assistant_ref: bool,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            triggers: [
                "transferring you to an agent",
                "connect you with an agent",
                "live agent",
                "human agent",
                "transfer to agent",
                "speak to someone",
                "escalate",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            transcript_limit: 20,
            establish_timeout_ms: 15_000,
            establish_retries: 1,
            id_extraction: vec![
                IdExtractionRule::array_item("SubscribeToChatPresence", "chatSessionId"),
                IdExtractionRule::pointer("/body/uiData/chatSessionId"),
                IdExtractionRule::pointer("/chatSessionId"),
                IdExtractionRule::array_item("StartConversation", "conversationId"),
            ],
            synthesize_from_assistant_ref: true,
        }
    }
}

impl HandoffConfig {
    pub fn establish_timeout(&self) -> Duration {
        Duration::from_millis(self.establish_timeout_ms)
    }
}

/// Message store selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite URL, or `memory` for the in-process store.
    pub database_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://switchboard.db?mode=rwc".into(),
        }
    }
}

impl StoreConfig {
    pub fn is_memory(&self) -> bool {
        self.database_url.eq_ignore_ascii_case("memory")
    }
}

fn serialize_redacted<S: serde::Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    if secret.expose_secret().is_empty() {
        serializer.serialize_str("")
    } else {
        serializer.serialize_str("[REDACTED]")
    }
}

fn serialize_option_redacted<S: serde::Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serialize_redacted(s, serializer),
        None => serializer.serialize_none(),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_roundtrip_through_toml() {
        let raw = toml::to_string(&SwitchboardConfig::default()).unwrap();
        let parsed: SwitchboardConfig = toml::from_str(&raw).unwrap();
        assert_eq!(parsed.server.port, 3001);
        assert_eq!(parsed.handoff.id_extraction.len(), 4);
    }

    #[test]
    fn extraction_rules_parse_from_toml() {
        let raw = r#"
            [handoff]
            triggers = ["human please"]

            [[handoff.id_extraction]]
            kind = "pointer"
            pointer = "/result/id"

            [[handoff.id_extraction]]
            kind = "array_item"
            array = "/body"
            match_field = "actionType"
            match_value = "SubscribeToChatPresence"
            field = "chatSessionId"
        "#;
        let cfg: SwitchboardConfig = toml::from_str(raw).unwrap();
        assert_eq!(cfg.handoff.triggers, vec!["human please".to_string()]);
        assert_eq!(
            cfg.handoff.id_extraction[0],
            IdExtractionRule::Pointer {
                pointer: "/result/id".into()
            }
        );
        assert!(matches!(
            cfg.handoff.id_extraction[1],
            IdExtractionRule::ArrayItem { .. }
        ));
    }

    #[test]
    fn secrets_are_redacted_on_serialize() {
        let mut cfg = SwitchboardConfig::default();
        cfg.agent.password = Secret::new("hunter2".into());
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["agent"]["password"], "[REDACTED]");
        assert_eq!(json["assistant"]["secret"], "");
    }

    #[test]
    fn memory_store_selector() {
        let store = StoreConfig {
            database_url: "MEMORY".into(),
        };
        assert!(store.is_memory());
        assert!(!StoreConfig::default().is_memory());
    }
}
