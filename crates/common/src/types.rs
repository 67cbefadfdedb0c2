//! Domain types shared by the registry, the relay core, and the backends.

use std::fmt;

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    uuid::Uuid,
};

// ── Identifiers ─────────────────────────────────────────────────────────────

/// Client-facing session identifier. One per logical conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Allocate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Opaque per-backend poll position. Only the backend that issued it can
/// interpret the contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Backends and origins ────────────────────────────────────────────────────

/// Which upstream conversational backend a payload or task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Assistant,
    Agent,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Assistant => "assistant",
            Self::Agent => "agent",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = crate::UnknownBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "assistant" | "copilot" | "directline" => Ok(Self::Assistant),
            "agent" | "servicenow" => Ok(Self::Agent),
            other => Err(crate::UnknownBackend(other.to_string())),
        }
    }
}

/// Who authored a canonical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Assistant,
    Agent,
    System,
    Client,
}

/// Severity of a locally generated system notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

// ── Messages ────────────────────────────────────────────────────────────────

/// A file or card attached to a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// The normalized message shape shared by every delivery path.
///
/// Created once by ingestion or polling and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    pub id: String,
    pub session_id: SessionId,
    pub origin: Origin,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_ts: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
    /// Upstream-assigned identifier; the dedup key.
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// Set only for locally generated system notices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notice: Option<NoticeLevel>,
}

impl CanonicalMessage {
    /// Upstream timestamp, or local receipt time when the producer sent none.
    pub fn effective_ts(&self) -> DateTime<Utc> {
        self.upstream_ts.unwrap_or(self.received_at)
    }

    /// Deterministic message id for `(session, producer, source id)`.
    ///
    /// Push and poll copies of the same upstream message map to the same id,
    /// which makes the store upsert a no-op on re-delivery.
    pub fn derive_id(session_id: &SessionId, producer: &str, source_id: &str) -> String {
        let name = format!("switchboard:{session_id}:{producer}:{source_id}");
        Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
    }
}

// ── Client identity ─────────────────────────────────────────────────────────

/// Who is on the client side of a session. Forwarded to the agent backend
/// as part of the handoff context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl ClientIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            email: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}
