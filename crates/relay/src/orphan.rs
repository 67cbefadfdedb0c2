//! Holding area for inbound payloads that arrive before their session
//! mapping exists.

use std::{collections::VecDeque, sync::Mutex, time::Duration};

use {
    serde_json::Value,
    switchboard_common::BackendKind,
    tokio::time::Instant,
    tracing::warn,
};

struct Orphan {
    backend: BackendKind,
    reference: String,
    raw: Value,
    arrived: Instant,
}

/// Bounded in count and in age. Overflow evicts the oldest entry.
pub struct OrphanBuffer {
    entries: Mutex<VecDeque<Orphan>>,
    capacity: usize,
    ttl: Duration,
}

impl OrphanBuffer {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity,
            ttl,
        }
    }

    /// Hold `raw` until a session claims `reference`. Returns `false` when
    /// the payload was dropped instead of buffered.
    pub fn hold(&self, backend: BackendKind, reference: String, raw: Value) -> bool {
        if self.capacity == 0 {
            warn!(backend = %backend, reference = %reference, "UnknownSession: orphan buffer disabled, dropping payload");
            return false;
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        while entries.len() >= self.capacity {
            if let Some(evicted) = entries.pop_front() {
                warn!(
                    backend = %evicted.backend,
                    reference = %evicted.reference,
                    "UnknownSession: orphan buffer full, dropping oldest payload"
                );
            }
        }
        entries.push_back(Orphan {
            backend,
            reference,
            raw,
            arrived: Instant::now(),
        });
        true
    }

    /// Remove and return every live payload waiting on `reference`.
    pub fn claim(&self, backend: BackendKind, reference: &str) -> Vec<Value> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut claimed = Vec::new();
        entries.retain(|o| {
            if o.backend == backend && o.reference == reference {
                if now.duration_since(o.arrived) <= self.ttl {
                    claimed.push(o.raw.clone());
                }
                false
            } else {
                true
            }
        });
        claimed
    }

    /// Drop entries older than the TTL. Returns how many were dropped.
    pub fn expire(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|o| {
            let live = now.duration_since(o.arrived) <= self.ttl;
            if !live {
                warn!(
                    backend = %o.backend,
                    reference = %o.reference,
                    "UnknownSession: orphaned payload expired"
                );
            }
            live
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
