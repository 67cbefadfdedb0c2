//! Poll sources: one per (session, backend), wrapping a backend client with
//! the session's reference and a call timeout.

use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    switchboard_channels::{
        AgentBackend, AssistantBackend, ConversationRef, PollFilter, PollPage, Result,
        with_timeout,
    },
    switchboard_common::{BackendKind, Cursor},
};

use crate::normalize::upstream_timestamp;

#[async_trait]
pub trait PollSource: Send + Sync {
    fn backend(&self) -> BackendKind;

    async fn fetch(&self, cursor: Option<&Cursor>) -> Result<PollPage>;
}

pub struct AssistantPollSource {
    backend: Arc<dyn AssistantBackend>,
    conversation: ConversationRef,
    timeout: Duration,
}

impl AssistantPollSource {
    pub fn new(
        backend: Arc<dyn AssistantBackend>,
        conversation: ConversationRef,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            conversation,
            timeout,
        }
    }
}

#[async_trait]
impl PollSource for AssistantPollSource {
    fn backend(&self) -> BackendKind {
        BackendKind::Assistant
    }

    async fn fetch(&self, cursor: Option<&Cursor>) -> Result<PollPage> {
        with_timeout(
            "assistant poll",
            self.timeout,
            self.backend.poll(&self.conversation, cursor),
        )
        .await
    }
}

/// The agent backend returns bare records oldest first; the cursor is the
/// newest upstream timestamp on the page, as RFC 3339, and is applied
/// inclusively so the next page resumes where a limited one stopped.
pub struct AgentPollSource {
    backend: Arc<dyn AgentBackend>,
    agent_session: String,
    limit: u32,
    timeout: Duration,
}

impl AgentPollSource {
    pub fn new(
        backend: Arc<dyn AgentBackend>,
        agent_session: impl Into<String>,
        limit: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            agent_session: agent_session.into(),
            limit,
            timeout,
        }
    }
}

#[async_trait]
impl PollSource for AgentPollSource {
    fn backend(&self) -> BackendKind {
        BackendKind::Agent
    }

    async fn fetch(&self, cursor: Option<&Cursor>) -> Result<PollPage> {
        let filter = PollFilter {
            since: cursor.cloned(),
            limit: self.limit,
        };
        let records = with_timeout(
            "agent poll",
            self.timeout,
            self.backend.poll(&self.agent_session, &filter),
        )
        .await?;
        let next_cursor = records
            .iter()
            .filter_map(upstream_timestamp)
            .max()
            .map(|ts| Cursor::new(ts.to_rfc3339()));
        Ok(PollPage {
            records,
            next_cursor,
        })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        serde_json::{Value, json},
        std::sync::Mutex,
        switchboard_channels::ContextPayload,
    };

    struct RecordingAgent {
        records: Vec<Value>,
        filters: Mutex<Vec<PollFilter>>,
    }

    #[async_trait]
    impl AgentBackend for RecordingAgent {
        async fn establish_session(&self, _: &ContextPayload) -> Result<Value> {
            Ok(json!({}))
        }

        async fn post_message(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }

        async fn poll(&self, _: &str, filter: &PollFilter) -> Result<Vec<Value>> {
            self.filters.lock().unwrap().push(filter.clone());
            Ok(self.records.clone())
        }
    }

    #[tokio::test]
    async fn agent_cursor_is_newest_timestamp() {
        let agent = Arc::new(RecordingAgent {
            records: vec![
                json!({"sys_id": "b", "send_time": "2025-10-23 12:05:00"}),
                json!({"sys_id": "a", "send_time": "2025-10-23 12:01:00"}),
                json!({"sys_id": "c"}),
            ],
            filters: Mutex::new(Vec::new()),
        });
        let source = AgentPollSource::new(agent.clone(), "abc", 50, Duration::from_secs(1));

        let page = source.fetch(Some(&Cursor::new("prev"))).await.unwrap();
        assert_eq!(page.records.len(), 3);
        assert_eq!(
            page.next_cursor.unwrap().as_str(),
            "2025-10-23T12:05:00+00:00"
        );
        let filters = agent.filters.lock().unwrap();
        assert_eq!(filters[0].since.as_ref().unwrap().as_str(), "prev");
        assert_eq!(filters[0].limit, 50);
    }

    /// Serves records the way the table API does: ascending by send time,
    /// filtered inclusively by the cursor, truncated to the limit.
    struct TableAgent {
        rows: Vec<Value>,
    }

    #[async_trait]
    impl AgentBackend for TableAgent {
        async fn establish_session(&self, _: &ContextPayload) -> Result<Value> {
            Ok(json!({}))
        }

        async fn post_message(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }

        async fn poll(&self, _: &str, filter: &PollFilter) -> Result<Vec<Value>> {
            let since = filter
                .since
                .as_ref()
                .and_then(|c| chrono::DateTime::parse_from_rfc3339(c.as_str()).ok())
                .map(|ts| ts.with_timezone(&chrono::Utc));
            Ok(self
                .rows
                .iter()
                .filter(|row| match (since, upstream_timestamp(row)) {
                    (Some(since), Some(ts)) => ts >= since,
                    _ => true,
                })
                .take(filter.limit as usize)
                .cloned()
                .collect())
        }
    }

    #[tokio::test]
    async fn backlog_larger_than_limit_is_read_in_order() {
        let rows: Vec<Value> = (0..7)
            .map(|i| json!({"sys_id": format!("m{i}"), "send_time": format!("2025-10-23 12:00:{i:02}")}))
            .collect();
        let source = AgentPollSource::new(
            Arc::new(TableAgent { rows }),
            "abc",
            3,
            Duration::from_secs(1),
        );

        let mut cursor = None;
        let mut seen = Vec::new();
        for _ in 0..4 {
            let page = source.fetch(cursor.as_ref()).await.unwrap();
            assert!(page.records.len() <= 3);
            for record in &page.records {
                let id = record["sys_id"].as_str().unwrap().to_string();
                if !seen.contains(&id) {
                    seen.push(id);
                }
            }
            cursor = page.next_cursor.or(cursor);
        }

        let expected: Vec<String> = (0..7).map(|i| format!("m{i}")).collect();
        assert_eq!(seen, expected);
        assert_eq!(
            cursor.unwrap().as_str(),
            "2025-10-23T12:00:06+00:00"
        );
    }

    #[tokio::test]
    async fn empty_agent_page_keeps_cursor() {
        let agent = Arc::new(RecordingAgent {
            records: Vec::new(),
            filters: Mutex::new(Vec::new()),
        });
        let source = AgentPollSource::new(agent, "abc", 50, Duration::from_secs(1));
        assert!(source.fetch(None).await.unwrap().next_cursor.is_none());
    }
}
