//! Per-session fan-out.
//!
//! Each session has one feed: a broadcast sender plus the effective
//! timestamp of the last emitted message. The emit check and the send happen
//! under the same lock, so concurrent publishers cannot reorder a feed.

use std::{
    pin::Pin,
    sync::{Arc, Mutex},
};

use {
    chrono::{DateTime, Utc},
    dashmap::DashMap,
    futures::{Stream, StreamExt},
    switchboard_common::{CanonicalMessage, SessionId},
    tokio::sync::broadcast,
    tokio_stream::wrappers::BroadcastStream,
    tracing::{debug, warn},
};

pub type MessageStream = Pin<Box<dyn Stream<Item = CanonicalMessage> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Emitted,
    /// Older than the last emitted message; kept in the store only.
    Stale,
    /// The session has no open feed (never opened, or closed).
    NoFeed,
}

struct Feed {
    tx: broadcast::Sender<CanonicalMessage>,
    last_emitted: Mutex<Option<DateTime<Utc>>>,
}

pub struct Publisher {
    feeds: DashMap<SessionId, Arc<Feed>>,
    buffer: usize,
}

impl Publisher {
    pub fn new(buffer: usize) -> Self {
        Self {
            feeds: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    fn feed(&self, session_id: &SessionId) -> Option<Arc<Feed>> {
        self.feeds.get(session_id).map(|f| Arc::clone(f.value()))
    }

    pub fn open(&self, session_id: &SessionId) {
        self.feeds.entry(session_id.clone()).or_insert_with(|| {
            Arc::new(Feed {
                tx: broadcast::channel(self.buffer).0,
                last_emitted: Mutex::new(None),
            })
        });
    }

    /// Close the feed; live subscriptions end once they drain.
    pub fn close(&self, session_id: &SessionId) {
        if self.feeds.remove(session_id).is_some() {
            debug!(session_id = %session_id, "feed closed");
        }
    }

    pub fn publish(&self, message: CanonicalMessage) -> PublishOutcome {
        let Some(feed) = self.feed(&message.session_id) else {
            return PublishOutcome::NoFeed;
        };
        let mut last = feed.last_emitted.lock().unwrap_or_else(|e| e.into_inner());
        let ts = message.effective_ts();
        if let Some(prev) = *last
            && ts < prev
        {
            debug!(
                session_id = %message.session_id,
                source_id = %message.source_id,
                "suppressing stale message"
            );
            return PublishOutcome::Stale;
        }
        *last = Some(ts);
        // No receivers is fine: the store still has the record.
        let _ = feed.tx.send(message);
        PublishOutcome::Emitted
    }

    /// Emit a locally generated message. `build` receives a timestamp no
    /// earlier than the last emitted one, so local messages are never stale.
    /// They do not move the stale watermark: local clocks and upstream
    /// clocks disagree, and an upstream reply must not be suppressed just
    /// because a client echo was stamped a little later.
    pub fn publish_local(
        &self,
        session_id: &SessionId,
        build: impl FnOnce(DateTime<Utc>) -> CanonicalMessage,
    ) -> Option<CanonicalMessage> {
        let feed = self.feed(session_id)?;
        let last = feed.last_emitted.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let ts = last.map_or(now, |prev| prev.max(now));
        let message = build(ts);
        let _ = feed.tx.send(message.clone());
        Some(message)
    }

    /// Live messages for `session_id`, or `None` when there is no open feed.
    pub fn subscribe(&self, session_id: &SessionId) -> Option<MessageStream> {
        let rx = self.feed(session_id)?.tx.subscribe();
        let session = session_id.clone();
        let stream = BroadcastStream::new(rx).filter_map(move |item| {
            let session = session.clone();
            async move {
                match item {
                    Ok(message) => Some(message),
                    Err(e) => {
                        warn!(session_id = %session, error = %e, "subscriber lagged, messages skipped");
                        None
                    },
                }
            }
        });
        Some(Box::pin(stream))
    }

    pub fn subscriber_count(&self, session_id: &SessionId) -> usize {
        self.feed(session_id)
            .map(|f| f.tx.receiver_count())
            .unwrap_or(0)
    }

    pub fn is_open(&self, session_id: &SessionId) -> bool {
        self.feeds.contains_key(session_id)
    }
}
