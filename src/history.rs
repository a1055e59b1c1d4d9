//! Per-session bounded history of recent samples.
//!
//! A single `tokio::sync::Mutex` guards the whole session map. Appends hand
//! back a snapshot so detectors can run without holding the lock, and the
//! stale-session sweep takes the same lock so it can never drop a buffer that
//! an in-flight append is writing to.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::telemetry::Sample;

/// One recorded sample.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub sample: Arc<Sample>,
    pub recorded_at: DateTime<Utc>,
}

pub struct SessionHistoryStore {
    capacity: usize,
    sessions: Mutex<HashMap<String, VecDeque<HistoryEntry>>>,
}

impl SessionHistoryStore {
    /// `capacity` is clamped to at least one entry.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a sample (evicting the oldest past capacity) and return the
    /// session's history, oldest first, including the new entry.
    pub async fn append(
        &self,
        session_id: &str,
        sample: Arc<Sample>,
        recorded_at: DateTime<Utc>,
    ) -> Vec<HistoryEntry> {
        let mut sessions = self.sessions.lock().await;
        let buffer = sessions.entry(session_id.to_string()).or_insert_with(|| {
            debug!(%session_id, "opening session history");
            VecDeque::with_capacity(self.capacity)
        });
        buffer.push_back(HistoryEntry { sample, recorded_at });
        while buffer.len() > self.capacity {
            buffer.pop_front();
        }
        buffer.iter().cloned().collect()
    }

    /// Current history for a session, oldest first. Empty for unknown sessions.
    pub async fn snapshot(&self, session_id: &str) -> Vec<HistoryEntry> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(session_id)
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn len(&self, session_id: &str) -> usize {
        let sessions = self.sessions.lock().await;
        sessions.get(session_id).map_or(0, VecDeque::len)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Drop every session whose most recent entry is older than `cutoff`.
    /// Returns the number of sessions removed.
    pub async fn evict_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, buffer| {
            buffer
                .back()
                .is_some_and(|newest| newest.recorded_at >= cutoff)
        });
        let removed = before - sessions.len();
        if removed > 0 {
            info!(removed, remaining = sessions.len(), "swept stale session histories");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(v: f64) -> Arc<Sample> {
        Arc::new([("X", v)].into_iter().collect())
    }

    #[tokio::test]
    async fn test_buffer_is_bounded_fifo() {
        let store = SessionHistoryStore::new(5);
        let now = Utc::now();
        for i in 0..12 {
            store.append("s1", sample(i as f64), now).await;
        }
        let history = store.snapshot("s1").await;
        assert_eq!(history.len(), 5);
        let values: Vec<f64> = history.iter().map(|e| e.sample.get("X").unwrap()).collect();
        assert_eq!(values, vec![7.0, 8.0, 9.0, 10.0, 11.0]);
    }

    #[tokio::test]
    async fn test_append_returns_updated_snapshot() {
        let store = SessionHistoryStore::new(3);
        let now = Utc::now();
        let first = store.append("s1", sample(1.0), now).await;
        assert_eq!(first.len(), 1);
        let second = store.append("s1", sample(2.0), now).await;
        assert_eq!(second.last().unwrap().sample.get("X"), Some(2.0));
        // Sessions are independent.
        assert_eq!(store.len("s2").await, 0);
        assert!(store.snapshot("s2").await.is_empty());
    }

    #[tokio::test]
    async fn test_evicts_only_stale_sessions() {
        let store = SessionHistoryStore::new(10);
        let now = Utc::now();
        store.append("old", sample(1.0), now - Duration::hours(30)).await;
        store.append("mixed", sample(1.0), now - Duration::hours(30)).await;
        store.append("mixed", sample(2.0), now - Duration::hours(1)).await;
        store.append("fresh", sample(1.0), now).await;

        let removed = store.evict_older_than(now - Duration::hours(24)).await;
        assert_eq!(removed, 1);
        assert_eq!(store.session_count().await, 2);
        assert_eq!(store.len("old").await, 0);
        assert_eq!(store.len("mixed").await, 2);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let store = SessionHistoryStore::new(0);
        assert_eq!(store.capacity(), 1);
        tokio_test::block_on(async {
            store.append("s", sample(1.0), Utc::now()).await;
            store.append("s", sample(2.0), Utc::now()).await;
            assert_eq!(store.len("s").await, 1);
        });
    }
}
