//! Ingestion normalizer: raw backend payloads to canonical messages.
//!
//! Producers disagree on field names and nesting, and the agent side often
//! ships its real content as a JSON-encoded string. Every field below is
//! optional and deserialized leniently: a wrong-typed field reads as absent
//! instead of failing the whole payload. Precedence when several aliases are
//! present is fixed and documented on each accessor.

use {
    chrono::{DateTime, NaiveDateTime, Utc},
    serde::{Deserialize, Deserializer},
    serde_json::Value,
    sha2::{Digest, Sha256},
    switchboard_common::{Attachment, BackendKind, CanonicalMessage, Origin, SessionId},
    tracing::debug,
};

/// Text used when an agent chat-ended event carries no message of its own.
pub const CHAT_ENDED_TEXT: &str = "The agent has ended the conversation.";

fn lenient_string<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(de)? {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_u64<'de, D: Deserializer<'de>>(de: D) -> Result<Option<u64>, D::Error> {
    Ok(match Value::deserialize(de)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    })
}

fn lenient_vec<'de, D, T>(de: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    Ok(match Value::deserialize(de)? {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect(),
        _ => Vec::new(),
    })
}

/// `{ "id": .., "name": .., "role": .. }` as sent by Direct Line.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawSender {
    #[serde(deserialize_with = "lenient_string")]
    id: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    name: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    role: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawAttachment {
    #[serde(rename = "contentType", alias = "content_type", deserialize_with = "lenient_string")]
    content_type: Option<String>,
    #[serde(rename = "contentUrl", alias = "url", deserialize_with = "lenient_string")]
    url: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    name: Option<String>,
}

/// Union of the fields either backend may send.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPayload {
    #[serde(rename = "type", deserialize_with = "lenient_string")]
    kind: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    id: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    sys_id: Option<String>,
    #[serde(rename = "messageId", deserialize_with = "lenient_string")]
    message_id: Option<String>,

    #[serde(deserialize_with = "lenient_string")]
    text: Option<String>,
    #[serde(rename = "messageText", deserialize_with = "lenient_string")]
    message_text: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    message: Option<String>,
    /// Agent content; a JSON-encoded string, an object, or plain text.
    payload: Option<Value>,

    #[serde(deserialize_with = "lenient_string")]
    timestamp: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    send_time: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    created_on: Option<String>,
    #[serde(rename = "createdOn", deserialize_with = "lenient_string")]
    created_on_camel: Option<String>,

    from: Option<Value>,
    #[serde(deserialize_with = "lenient_string")]
    sys_created_by: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    created_by: Option<String>,
    #[serde(rename = "createdBy", deserialize_with = "lenient_string")]
    created_by_camel: Option<String>,

    conversation: Option<Value>,
    #[serde(deserialize_with = "lenient_string")]
    conversation_id: Option<String>,
    #[serde(rename = "conversationId", deserialize_with = "lenient_string")]
    conversation_id_camel: Option<String>,
    #[serde(rename = "chatSessionId", deserialize_with = "lenient_string")]
    chat_session_id: Option<String>,
    #[serde(rename = "sessionId", deserialize_with = "lenient_string")]
    session_id: Option<String>,

    #[serde(rename = "eventType", deserialize_with = "lenient_string")]
    event_type: Option<String>,
    #[serde(deserialize_with = "lenient_u64")]
    sequence: Option<u64>,
    #[serde(deserialize_with = "lenient_vec")]
    attachments: Vec<RawAttachment>,
}

impl RawPayload {
    fn parse(raw: &Value) -> Self {
        match raw {
            Value::Object(_) => serde_json::from_value(raw.clone()).unwrap_or_default(),
            // A bare string body is still a message.
            Value::String(s) => Self {
                text: Some(s.clone()),
                ..Self::default()
            },
            _ => Self::default(),
        }
    }

    fn sender(&self) -> RawSender {
        self.from
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// `conversation_id` > `conversationId` > `conversation` (string, or
    /// object `id`/`value`) > `chatSessionId` > `sessionId`.
    fn session_hint(&self) -> Option<String> {
        self.conversation_id
            .clone()
            .or_else(|| self.conversation_id_camel.clone())
            .or_else(|| self.conversation.as_ref().and_then(conversation_reference))
            .or_else(|| self.chat_session_id.clone())
            .or_else(|| self.session_id.clone())
    }

    /// `send_time` > `created_on` > `createdOn` > `timestamp`.
    fn timestamp(&self) -> Option<DateTime<Utc>> {
        [
            &self.send_time,
            &self.created_on,
            &self.created_on_camel,
            &self.timestamp,
        ]
        .into_iter()
        .flatten()
        .find_map(|s| parse_timestamp(s))
    }

    fn attachments(&self) -> Vec<Attachment> {
        self.attachments
            .iter()
            .filter(|a| a.url.is_some() || a.name.is_some() || a.content_type.is_some())
            .map(|a| Attachment {
                content_type: a.content_type.clone(),
                url: a.url.clone(),
                name: a.name.clone(),
            })
            .collect()
    }
}

fn conversation_reference(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => ["id", "value"]
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_str))
            .filter(|s| !s.is_empty())
            .map(String::from),
        _ => None,
    }
}

/// RFC 3339, or the `YYYY-MM-DD HH:MM:SS` form the agent backend uses (UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Upstream timestamp of a raw record, for sorting poll pages before ingest.
pub fn upstream_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    RawPayload::parse(raw).timestamp()
}

// ── Nested agent payload ────────────────────────────────────────────────────

/// The structured body agent events wrap inside `payload`.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentEnvelope {
    #[serde(rename = "type", deserialize_with = "lenient_string")]
    pub kind: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub message: Option<String>,
    #[serde(rename = "eventType", deserialize_with = "lenient_string")]
    pub event_type: Option<String>,
    #[serde(rename = "notifyUser")]
    pub notify_user: Option<bool>,
}

/// Result of interpreting a `payload` field.
#[derive(Debug, Clone, PartialEq)]
pub enum NestedPayload {
    Structured(AgentEnvelope),
    /// Not structured data; the content is used as message text.
    Opaque(String),
}

impl NestedPayload {
    pub fn parse(value: &Value) -> Self {
        match value {
            Value::String(s) => {
                let trimmed = s.trim_start();
                if trimmed.starts_with('{') {
                    match serde_json::from_str::<AgentEnvelope>(s) {
                        Ok(envelope) => Self::Structured(envelope),
                        Err(e) => {
                            debug!(error = %e, "malformed nested payload, keeping as text");
                            Self::Opaque(s.clone())
                        },
                    }
                } else {
                    Self::Opaque(s.clone())
                }
            },
            Value::Object(_) => serde_json::from_value(value.clone())
                .map(Self::Structured)
                .unwrap_or_else(|_| Self::Opaque(value.to_string())),
            Value::Null => Self::Opaque(String::new()),
            other => Self::Opaque(other.to_string()),
        }
    }

    fn text(&self) -> Option<&str> {
        let text = match self {
            Self::Structured(env) => env.message.as_deref(),
            Self::Opaque(s) => Some(s.as_str()),
        };
        text.filter(|s| !s.trim().is_empty())
    }
}

// ── Output ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Typing indicators, conversation updates, and other non-message events.
    NotAMessage,
    /// The client's own message echoed back by the assistant transport.
    ClientEcho,
    Empty,
}

/// A normalized message not yet bound to a session.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMessage {
    pub backend: BackendKind,
    /// Reference used to resolve the owning session.
    pub session_hint: Option<String>,
    pub origin: Origin,
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub upstream_ts: Option<DateTime<Utc>>,
    pub source_id: String,
    pub sequence: Option<u64>,
    pub sender_name: Option<String>,
    /// The agent closed the chat.
    pub chat_ended: bool,
    /// Content fingerprint for producers whose push and poll shapes carry
    /// different ids. When set it identifies the message instead of
    /// `source_id`.
    pub content_key: Option<String>,
}

impl NormalizedMessage {
    /// Identity shared by every delivery path of the same message.
    pub fn identity(&self) -> &str {
        self.content_key.as_deref().unwrap_or(&self.source_id)
    }

    pub fn into_canonical(self, session_id: SessionId, received_at: DateTime<Utc>) -> CanonicalMessage {
        CanonicalMessage {
            id: CanonicalMessage::derive_id(&session_id, self.backend.as_str(), self.identity()),
            session_id,
            origin: self.origin,
            text: self.text,
            attachments: self.attachments,
            upstream_ts: self.upstream_ts,
            received_at,
            source_id: self.source_id,
            sequence: self.sequence,
            sender_name: self.sender_name,
            notice: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Message(NormalizedMessage),
    Skip(SkipReason),
}

/// Stable id for payloads that carry none.
pub fn fingerprint(
    backend: BackendKind,
    sender: Option<&str>,
    ts: Option<DateTime<Utc>>,
    text: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(backend.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(sender.unwrap_or_default().as_bytes());
    hasher.update([0]);
    hasher.update(ts.map(|t| t.to_rfc3339()).unwrap_or_default().as_bytes());
    hasher.update([0]);
    hasher.update(text.as_bytes());
    format!("fp:{:x}", hasher.finalize())
}

/// Direct Line ids look like `<conversation>|0000012`; the suffix orders
/// activities within a conversation.
fn sequence_from_activity_id(id: &str) -> Option<u64> {
    id.rsplit_once('|').and_then(|(_, seq)| seq.parse().ok())
}

pub struct Normalizer {
    client_user_id: String,
}

impl Normalizer {
    /// `client_user_id` is the sender id the relay posts client messages
    /// under on the assistant transport.
    pub fn new(client_user_id: impl Into<String>) -> Self {
        Self {
            client_user_id: client_user_id.into(),
        }
    }

    /// Never fails: unparseable input degrades to text or is skipped.
    pub fn normalize(&self, backend: BackendKind, raw: &Value) -> Normalized {
        let payload = RawPayload::parse(raw);
        match backend {
            BackendKind::Assistant => self.assistant(payload),
            BackendKind::Agent => Self::agent(payload),
        }
    }

    fn assistant(&self, p: RawPayload) -> Normalized {
        if let Some(kind) = p.kind.as_deref()
            && !kind.eq_ignore_ascii_case("message")
        {
            return Normalized::Skip(SkipReason::NotAMessage);
        }

        let sender = p.sender();
        let from_client = sender
            .role
            .as_deref()
            .is_some_and(|r| r.eq_ignore_ascii_case("user"))
            || sender.id.as_deref() == Some(self.client_user_id.as_str());
        if from_client {
            return Normalized::Skip(SkipReason::ClientEcho);
        }

        let text = p
            .text
            .clone()
            .or_else(|| p.message_text.clone())
            .or_else(|| p.message.clone())
            .unwrap_or_default();
        let attachments = p.attachments();
        if text.trim().is_empty() && attachments.is_empty() {
            return Normalized::Skip(SkipReason::Empty);
        }

        let upstream_ts = p.timestamp();
        let sequence = p
            .sequence
            .or_else(|| p.id.as_deref().and_then(sequence_from_activity_id));
        let source_id = p.id.clone().or_else(|| p.message_id.clone()).unwrap_or_else(|| {
            fingerprint(
                BackendKind::Assistant,
                sender.id.as_deref(),
                upstream_ts,
                &text,
            )
        });

        Normalized::Message(NormalizedMessage {
            backend: BackendKind::Assistant,
            session_hint: p.session_hint(),
            origin: Origin::Assistant,
            text,
            attachments,
            upstream_ts,
            source_id,
            sequence,
            sender_name: sender.name,
            chat_ended: false,
            content_key: None,
        })
    }

    fn agent(p: RawPayload) -> Normalized {
        let nested = p.payload.as_ref().map(NestedPayload::parse);
        let envelope = match &nested {
            Some(NestedPayload::Structured(env)) => Some(env),
            _ => None,
        };

        let event_type = p
            .event_type
            .as_deref()
            .or_else(|| envelope.and_then(|e| e.event_type.as_deref()));
        let chat_ended = event_type.is_some_and(|e| e.eq_ignore_ascii_case("ChatEnded"));

        // messageText > message > nested payload text > text
        let text = p
            .message_text
            .clone()
            .or_else(|| p.message.clone())
            .or_else(|| nested.as_ref().and_then(|n| n.text()).map(String::from))
            .or_else(|| p.text.clone())
            .unwrap_or_default();
        let text = if text.trim().is_empty() && chat_ended {
            CHAT_ENDED_TEXT.to_string()
        } else {
            text
        };
        let attachments = p.attachments();
        if text.trim().is_empty() && attachments.is_empty() {
            return Normalized::Skip(SkipReason::Empty);
        }

        let is_system = chat_ended
            || envelope
                .and_then(|e| e.kind.as_deref())
                .is_some_and(|k| k.eq_ignore_ascii_case("system"));

        let sender = p.sender();
        let sender_name = p
            .sys_created_by
            .clone()
            .or_else(|| p.created_by.clone())
            .or_else(|| p.created_by_camel.clone())
            .or(sender.name);

        let upstream_ts = p.timestamp();
        // Webhook pushes carry no sys_id while polled rows do, so both
        // copies are keyed by content.
        let content_key = fingerprint(
            BackendKind::Agent,
            sender_name.as_deref(),
            upstream_ts,
            &text,
        );
        let source_id = p
            .sys_id
            .clone()
            .or_else(|| p.message_id.clone())
            .or_else(|| p.id.clone())
            .unwrap_or_else(|| content_key.clone());

        Normalized::Message(NormalizedMessage {
            backend: BackendKind::Agent,
            session_hint: p.session_hint(),
            origin: if is_system {
                Origin::System
            } else {
                Origin::Agent
            },
            text,
            attachments,
            upstream_ts,
            source_id,
            sequence: p.sequence,
            sender_name,
            chat_ended,
            content_key: Some(content_key),
        })
    }
}
