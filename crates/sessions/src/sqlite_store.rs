//! SQLite-backed transcript store.

use {
    async_trait::async_trait,
    sqlx::{SqlitePool, sqlite::SqlitePoolOptions},
    switchboard_channels::{Error as StoreError, MessageStore},
    switchboard_common::{CanonicalMessage, SessionId},
    tracing::debug,
};

use crate::error::Result;

pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a pool at `database_url` and apply migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        crate::run_migrations(&pool).await?;
        debug!(database_url, "message store ready");
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn upsert(
        &self,
        session_id: &SessionId,
        message_id: &str,
        record: &CanonicalMessage,
    ) -> switchboard_channels::Result<bool> {
        let json = serde_json::to_string(record)?;
        let origin = serde_json::to_value(record.origin)?;
        let result = sqlx::query(
            r#"INSERT INTO messages
                 (session_id, message_id, origin, source_id, effective_ts, received_ts, record)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(session_id, message_id) DO NOTHING"#,
        )
        .bind(session_id.as_str())
        .bind(message_id)
        .bind(origin.as_str().unwrap_or_default())
        .bind(&record.source_id)
        .bind(record.effective_ts().timestamp_millis())
        .bind(record.received_at.timestamp_millis())
        .bind(json)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::external("sqlite upsert", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn query(&self, session_id: &SessionId) -> switchboard_channels::Result<Vec<CanonicalMessage>> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT record FROM messages WHERE session_id = ? \
             ORDER BY effective_ts, received_ts, message_id",
        )
        .bind(session_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::external("sqlite query", e))?;

        rows.iter()
            .map(|raw| serde_json::from_str(raw).map_err(StoreError::from))
            .collect()
    }

    async fn delete_session(&self, session_id: &SessionId) -> switchboard_channels::Result<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(session_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::external("sqlite delete", e))?;
        Ok(result.rows_affected())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        chrono::{TimeZone, Utc},
        switchboard_common::Origin,
    };

    async fn test_store() -> SqliteMessageStore {
        // One connection: every new connection to :memory: is a fresh database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::run_migrations(&pool).await.unwrap();
        SqliteMessageStore::new(pool)
    }

    fn msg(session: &str, source: &str, minute: Option<u32>) -> CanonicalMessage {
        let session_id = SessionId::from(session);
        CanonicalMessage {
            id: CanonicalMessage::derive_id(&session_id, "agent", source),
            session_id,
            origin: Origin::Agent,
            text: format!("from {source}"),
            attachments: Vec::new(),
            upstream_ts: minute.map(|m| Utc.with_ymd_and_hms(2025, 2, 1, 8, m, 0).unwrap()),
            received_at: Utc.with_ymd_and_hms(2025, 2, 1, 8, 15, 0).unwrap(),
            source_id: source.into(),
            sequence: None,
            sender_name: Some("Agent Smith".into()),
            notice: None,
        }
    }

    #[tokio::test]
    async fn same_key_twice_yields_one_record() {
        let store = test_store().await;
        let s = SessionId::from("s1");
        let m = msg("s1", "m1", Some(1));
        assert!(store.upsert(&s, &m.id, &m).await.unwrap());
        assert!(!store.upsert(&s, &m.id, &m).await.unwrap());

        let rows = store.query(&s).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], m);
    }

    #[tokio::test]
    async fn query_is_ordered_and_scoped() {
        let store = test_store().await;
        let s = SessionId::from("s1");
        for (source, minute) in [("late", Some(40)), ("early", Some(2)), ("no-ts", None)] {
            let m = msg("s1", source, minute);
            store.upsert(&s, &m.id, &m).await.unwrap();
        }
        let other = msg("s2", "elsewhere", Some(0));
        store
            .upsert(&SessionId::from("s2"), &other.id, &other)
            .await
            .unwrap();

        let sources: Vec<String> = store
            .query(&s)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.source_id)
            .collect();
        assert_eq!(sources, vec!["early", "no-ts", "late"]);
    }

    #[tokio::test]
    async fn delete_session_removes_rows() {
        let store = test_store().await;
        let s = SessionId::from("s1");
        let m = msg("s1", "m1", Some(1));
        store.upsert(&s, &m.id, &m).await.unwrap();
        assert_eq!(store.delete_session(&s).await.unwrap(), 1);
        assert!(store.query(&s).await.unwrap().is_empty());
    }
}
