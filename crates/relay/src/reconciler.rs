//! Poll reconciler: one cancellable task per (session, backend).
//!
//! A tick fetches from the current cursor and runs each record through the
//! ingestor. The cursor moves only after the whole page went through, so a
//! failed page is fetched again in full. Backend failures back off
//! exponentially; a long enough streak flags the session degraded.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    dashmap::DashMap,
    switchboard_common::{BackendKind, Cursor, NoticeLevel, SessionId},
    switchboard_sessions::SessionRegistry,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    error::{Error, Result},
    ingest::Ingestor,
    normalize::upstream_timestamp,
    poll::PollSource,
};

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    /// Delay after the `failures`-th consecutive failure (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        std::cmp::min(self.base.saturating_mul(factor), self.max)
    }
}

enum Tick {
    Continue,
    /// Session ended or vanished; the task should exit.
    Stop,
}

type TaskKey = (SessionId, BackendKind);

struct TaskEntry {
    generation: u64,
    token: CancellationToken,
}

pub struct Reconciler {
    ingestor: Arc<Ingestor>,
    registry: Arc<SessionRegistry>,
    cursors: DashMap<TaskKey, Cursor>,
    tasks: DashMap<TaskKey, TaskEntry>,
    generation: AtomicU64,
    backoff: BackoffPolicy,
    degraded_after: u32,
}

impl Reconciler {
    pub fn new(
        ingestor: Arc<Ingestor>,
        registry: Arc<SessionRegistry>,
        backoff: BackoffPolicy,
        degraded_after: u32,
    ) -> Self {
        Self {
            ingestor,
            registry,
            cursors: DashMap::new(),
            tasks: DashMap::new(),
            generation: AtomicU64::new(0),
            backoff,
            degraded_after: degraded_after.max(1),
        }
    }

    /// Start polling `source` for `session_id`, replacing any task already
    /// running for the same backend. The task stops when `parent` is
    /// cancelled, when [`Reconciler::stop`] is called, or when the session
    /// ends. The first tick runs immediately.
    pub fn start(
        self: &Arc<Self>,
        session_id: &SessionId,
        source: Arc<dyn PollSource>,
        interval: Duration,
        parent: &CancellationToken,
    ) {
        let backend = source.backend();
        let key = (session_id.clone(), backend);
        let token = parent.child_token();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        if let Some(previous) = self.tasks.insert(key.clone(), TaskEntry {
            generation,
            token: token.clone(),
        }) {
            previous.token.cancel();
        }

        info!(session_id = %session_id, backend = %backend, "poll task started");
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run(&key, source.as_ref(), interval, &token).await;
            this.tasks.remove_if(&key, |_, entry| entry.generation == generation);
            debug!(session_id = %key.0, backend = %key.1, "poll task exited");
        });
    }

    pub fn stop(&self, session_id: &SessionId, backend: BackendKind) {
        if let Some((_, entry)) = self.tasks.remove(&(session_id.clone(), backend)) {
            entry.token.cancel();
            info!(session_id = %session_id, backend = %backend, "poll task stopped");
        }
    }

    pub fn is_running(&self, session_id: &SessionId, backend: BackendKind) -> bool {
        self.tasks
            .get(&(session_id.clone(), backend))
            .is_some_and(|entry| !entry.token.is_cancelled())
    }

    pub fn cursor(&self, session_id: &SessionId, backend: BackendKind) -> Option<Cursor> {
        self.cursors
            .get(&(session_id.clone(), backend))
            .map(|c| c.value().clone())
    }

    /// Drop saved cursors once a session is gone for good.
    pub fn forget(&self, session_id: &SessionId) {
        for backend in [BackendKind::Assistant, BackendKind::Agent] {
            self.stop(session_id, backend);
            self.cursors.remove(&(session_id.clone(), backend));
        }
    }

    async fn run(
        &self,
        key: &TaskKey,
        source: &dyn PollSource,
        interval: Duration,
        token: &CancellationToken,
    ) {
        let (session_id, backend) = (&key.0, key.1);
        let mut failures: u32 = 0;
        let mut delay = Duration::ZERO;

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                () = tokio::time::sleep(delay) => {},
            }

            match self.tick(key, source, token).await {
                Ok(Tick::Continue) => {
                    if failures >= self.degraded_after {
                        self.mark_degraded(session_id, false).await;
                    }
                    failures = 0;
                    delay = interval;
                },
                Ok(Tick::Stop) => break,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    delay = self.backoff.delay(failures);
                    warn!(
                        session_id = %session_id,
                        backend = %backend,
                        failures,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "poll failed, backing off"
                    );
                    if failures == self.degraded_after {
                        self.mark_degraded(session_id, true).await;
                    }
                },
            }
        }
    }

    async fn tick(&self, key: &TaskKey, source: &dyn PollSource, token: &CancellationToken) -> Result<Tick> {
        let (session_id, backend) = (&key.0, key.1);
        let cursor = self.cursors.get(key).map(|c| c.value().clone());
        let page = source
            .fetch(cursor.as_ref())
            .await
            .map_err(|e| Error::backend(backend.as_str(), e))?;

        // The request was allowed to finish; its result is not.
        if token.is_cancelled() {
            return Ok(Tick::Stop);
        }
        match self.registry.state(session_id).await {
            Ok(state) if state.is_terminal() => return Ok(Tick::Stop),
            Ok(_) => {},
            Err(switchboard_sessions::Error::NotFound { .. }) => return Ok(Tick::Stop),
            Err(e) => return Err(e.into()),
        }

        let mut records = page.records;
        // Undated records sort last: their effective time is receipt time.
        records.sort_by_key(|r| {
            let ts = upstream_timestamp(r);
            (ts.is_none(), ts)
        });
        for raw in &records {
            self.ingestor.ingest(backend, raw, Some(session_id)).await?;
        }

        if let Some(next) = page.next_cursor {
            self.cursors.insert(key.clone(), next);
        }
        Ok(Tick::Continue)
    }

    async fn mark_degraded(&self, session_id: &SessionId, degraded: bool) {
        match self.registry.set_degraded(session_id, degraded).await {
            Ok(true) if degraded => {
                self.ingestor
                    .notice(
                        session_id,
                        NoticeLevel::Warning,
                        "Connection problems: new messages may be delayed.",
                    )
                    .await;
            },
            Ok(true) => {
                self.ingestor
                    .notice(session_id, NoticeLevel::Success, "Connection restored.")
                    .await;
            },
            Ok(false) => {},
            Err(e) => debug!(session_id = %session_id, error = %e, "degraded flag not updated"),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{normalize::Normalizer, publisher::Publisher},
        async_trait::async_trait,
        secrecy::Secret,
        serde_json::{Value, json},
        std::{collections::VecDeque, sync::Mutex},
        switchboard_channels::{
            ConversationRef, InMemoryMessageStore, MessageStore, PollPage,
            Result as BackendResult,
        },
        switchboard_common::{CanonicalMessage, ClientIdentity, Origin},
        switchboard_sessions::SessionEvent,
    };

    struct ScriptedSource {
        backend: BackendKind,
        pages: Mutex<VecDeque<BackendResult<PollPage>>>,
        cursors_seen: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedSource {
        fn new(pages: Vec<BackendResult<PollPage>>) -> Arc<Self> {
            Arc::new(Self {
                backend: BackendKind::Agent,
                pages: Mutex::new(pages.into()),
                cursors_seen: Mutex::new(Vec::new()),
            })
        }

        fn cursors_seen(&self) -> Vec<Option<String>> {
            self.cursors_seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PollSource for ScriptedSource {
        fn backend(&self) -> BackendKind {
            self.backend
        }

        async fn fetch(&self, cursor: Option<&Cursor>) -> BackendResult<PollPage> {
            self.cursors_seen
                .lock()
                .unwrap()
                .push(cursor.map(|c| c.as_str().to_string()));
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(PollPage::default()))
        }
    }

    /// Fails the first upsert of any record whose text is "boom".
    struct FlakyStore {
        inner: InMemoryMessageStore,
        failed: Mutex<bool>,
    }

    #[async_trait]
    impl MessageStore for FlakyStore {
        async fn upsert(
            &self,
            session_id: &SessionId,
            message_id: &str,
            record: &CanonicalMessage,
        ) -> BackendResult<bool> {
            {
                let mut failed = self.failed.lock().unwrap();
                if record.text == "boom" && !*failed {
                    *failed = true;
                    return Err(switchboard_channels::Error::unavailable("disk full"));
                }
            }
            self.inner.upsert(session_id, message_id, record).await
        }

        async fn query(&self, session_id: &SessionId) -> BackendResult<Vec<CanonicalMessage>> {
            self.inner.query(session_id).await
        }

        async fn delete_session(&self, session_id: &SessionId) -> BackendResult<u64> {
            self.inner.delete_session(session_id).await
        }
    }

    struct Fixture {
        registry: Arc<SessionRegistry>,
        store: Arc<FlakyStore>,
        reconciler: Arc<Reconciler>,
        session: SessionId,
    }

    async fn fixture(degraded_after: u32) -> Fixture {
        let registry = Arc::new(SessionRegistry::new());
        let publisher = Arc::new(Publisher::new(16));
        let store = Arc::new(FlakyStore {
            inner: InMemoryMessageStore::new(),
            failed: Mutex::new(false),
        });
        let (ingestor, _control) = Ingestor::new(
            Arc::clone(&registry),
            store.clone(),
            Arc::clone(&publisher),
            Normalizer::new("user"),
            8,
            Duration::from_secs(30),
        );
        let reconciler = Arc::new(Reconciler::new(
            Arc::new(ingestor),
            Arc::clone(&registry),
            BackoffPolicy {
                base: Duration::from_millis(100),
                max: Duration::from_secs(1),
            },
            degraded_after,
        ));
        let session = registry.create_session(ClientIdentity::new("u1")).id;
        registry
            .transition(&session, SessionEvent::StartAssistant {
                conversation: ConversationRef::new("conv", Secret::new("t".into())),
            })
            .await
            .unwrap();
        publisher.open(&session);
        Fixture {
            registry,
            store,
            reconciler,
            session,
        }
    }

    fn page(records: Vec<Value>, cursor: &str) -> BackendResult<PollPage> {
        Ok(PollPage {
            records,
            next_cursor: Some(Cursor::new(cursor)),
        })
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_secs(1));
        assert_eq!(policy.delay(4), Duration::from_secs(4));
        assert_eq!(policy.delay(40), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_page_is_refetched_from_same_cursor() {
        let f = fixture(5).await;
        let source = ScriptedSource::new(vec![
            page(
                vec![
                    json!({"sys_id": "m1", "payload": "ok", "send_time": "2025-01-01 10:00:00"}),
                    json!({"sys_id": "m2", "payload": "boom", "send_time": "2025-01-01 10:00:01"}),
                ],
                "c1",
            ),
            page(
                vec![
                    json!({"sys_id": "m1", "payload": "ok", "send_time": "2025-01-01 10:00:00"}),
                    json!({"sys_id": "m2", "payload": "boom", "send_time": "2025-01-01 10:00:01"}),
                ],
                "c1",
            ),
        ]);
        let token = CancellationToken::new();
        f.reconciler
            .start(&f.session, source.clone(), Duration::from_secs(1), &token);

        tokio::time::sleep(Duration::from_millis(1_500)).await;

        let seen = source.cursors_seen();
        assert_eq!(seen[0], None);
        assert_eq!(seen[1], None, "cursor must not move after a failed page");
        assert_eq!(seen[2].as_deref(), Some("c1"));
        let stored = f.store.query(&f.session).await.unwrap();
        assert_eq!(stored.len(), 2);
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn failure_streak_flags_degraded_then_recovers() {
        let f = fixture(2).await;
        let source = ScriptedSource::new(vec![
            Err(switchboard_channels::Error::unavailable("down")),
            Err(switchboard_channels::Error::rejected(503, "busy")),
            page(Vec::new(), "c1"),
        ]);
        let token = CancellationToken::new();
        f.reconciler
            .start(&f.session, source, Duration::from_secs(10), &token);

        // Fetch 1 at 0ms fails, fetch 2 at 100ms fails and flags degraded.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(f.registry.lookup(&f.session).await.unwrap().degraded);

        // Fetch 3 at 300ms succeeds.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!f.registry.lookup(&f.session).await.unwrap().degraded);

        let notices: Vec<_> = f
            .store
            .query(&f.session)
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.origin == Origin::System)
            .map(|m| m.notice)
            .collect();
        assert_eq!(notices, vec![Some(NoticeLevel::Warning), Some(NoticeLevel::Success)]);
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn ended_session_stops_task() {
        let f = fixture(5).await;
        let source = ScriptedSource::new(Vec::new());
        let token = CancellationToken::new();
        f.reconciler
            .start(&f.session, source.clone(), Duration::from_millis(100), &token);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(f.reconciler.is_running(&f.session, BackendKind::Agent));

        f.registry
            .transition(&f.session, SessionEvent::ClientDisconnect)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!f.reconciler.is_running(&f.session, BackendKind::Agent));
        let fetches = source.cursors_seen().len();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(source.cursors_seen().len(), fetches);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_and_parent_cancels_children() {
        let f = fixture(5).await;
        let parent = CancellationToken::new();
        f.reconciler.start(
            &f.session,
            ScriptedSource::new(Vec::new()),
            Duration::from_millis(100),
            &parent,
        );
        assert!(f.reconciler.is_running(&f.session, BackendKind::Agent));
        f.reconciler.stop(&f.session, BackendKind::Agent);
        assert!(!f.reconciler.is_running(&f.session, BackendKind::Agent));

        f.reconciler.start(
            &f.session,
            ScriptedSource::new(Vec::new()),
            Duration::from_millis(100),
            &parent,
        );
        parent.cancel();
        assert!(!f.reconciler.is_running(&f.session, BackendKind::Agent));
    }
}
