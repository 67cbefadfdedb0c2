use std::collections::HashSet;

use {dashmap::DashMap, switchboard_common::SessionId};

/// Per-session record of upstream source ids already surfaced.
///
/// Partitioned by DashMap shard, so push ingestion and poll reconciliation
/// for different sessions rarely contend.
#[derive(Default)]
pub struct DedupCache {
    seen: DashMap<SessionId, HashSet<String>>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` only the first time `source_id` is seen for `session_id`.
    pub fn mark_seen(&self, session_id: &SessionId, source_id: &str) -> bool {
        self.seen
            .entry(session_id.clone())
            .or_default()
            .insert(source_id.to_string())
    }

    pub fn contains(&self, session_id: &SessionId, source_id: &str) -> bool {
        self.seen
            .get(session_id)
            .is_some_and(|set| set.contains(source_id))
    }

    /// Create an empty record so the session shows up even before traffic.
    pub fn open(&self, session_id: &SessionId) {
        self.seen.entry(session_id.clone()).or_default();
    }

    pub fn clear(&self, session_id: &SessionId) {
        self.seen.remove(session_id);
    }

    pub fn session_count(&self) -> usize {
        self.seen.len()
    }
}
