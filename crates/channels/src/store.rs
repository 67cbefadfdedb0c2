use std::{collections::HashMap, sync::Mutex};

use {
    async_trait::async_trait,
    switchboard_common::{CanonicalMessage, SessionId},
};

use crate::error::Result;

/// Persistent transcript storage, keyed by session.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert `record` unless `(session_id, message_id)` already exists.
    /// Returns `true` when a new row was written.
    async fn upsert(
        &self,
        session_id: &SessionId,
        message_id: &str,
        record: &CanonicalMessage,
    ) -> Result<bool>;

    /// All records for a session, oldest first by effective timestamp.
    async fn query(&self, session_id: &SessionId) -> Result<Vec<CanonicalMessage>>;

    /// Most recent `limit` records, oldest first.
    async fn recent(&self, session_id: &SessionId, limit: usize) -> Result<Vec<CanonicalMessage>> {
        let mut all = self.query(session_id).await?;
        let skip = all.len().saturating_sub(limit);
        Ok(all.split_off(skip))
    }

    async fn delete_session(&self, session_id: &SessionId) -> Result<u64>;
}

/// Sort key used by every store: effective timestamp, then receipt time,
/// then id for a total order.
pub fn transcript_order(a: &CanonicalMessage, b: &CanonicalMessage) -> std::cmp::Ordering {
    a.effective_ts()
        .cmp(&b.effective_ts())
        .then_with(|| a.received_at.cmp(&b.received_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// In-memory store for tests and `database_url = "memory"`.
pub struct InMemoryMessageStore {
    sessions: Mutex<HashMap<SessionId, HashMap<String, CanonicalMessage>>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn upsert(
        &self,
        session_id: &SessionId,
        message_id: &str,
        record: &CanonicalMessage,
    ) -> Result<bool> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let rows = sessions.entry(session_id.clone()).or_default();
        if rows.contains_key(message_id) {
            return Ok(false);
        }
        rows.insert(message_id.to_string(), record.clone());
        Ok(true)
    }

    async fn query(&self, session_id: &SessionId) -> Result<Vec<CanonicalMessage>> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<CanonicalMessage> = sessions
            .get(session_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        rows.sort_by(transcript_order);
        Ok(rows)
    }

    async fn delete_session(&self, session_id: &SessionId) -> Result<u64> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        Ok(sessions
            .remove(session_id)
            .map(|m| m.len() as u64)
            .unwrap_or(0))
    }
}
