use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters describing reassembly health.
///
/// The `*_waiting` gauges are derived from the live store, see
/// [`crate::ChunkAggregator::metrics_snapshot`].
#[derive(Debug, Default)]
pub struct ChunkMetrics {
    pub chunks_total: AtomicU64,
    pub messages_completed: AtomicU64,
    pub messages_expired: AtomicU64,
    pub chunks_expired: AtomicU64,
    pub chunks_duplicated: AtomicU64,
    pub chunks_invalid: AtomicU64,
}

impl ChunkMetrics {
    pub(crate) fn chunk_seen(&self) {
        self.chunks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn duplicate(&self) {
        self.chunks_duplicated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn invalid(&self) {
        self.chunks_invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn completed(&self) {
        self.messages_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn expired(&self, chunks: u64) {
        self.messages_expired.fetch_add(1, Ordering::Relaxed);
        self.chunks_expired.fetch_add(chunks, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HashMap<String, u64> {
        let mut stats = HashMap::new();
        stats.insert(
            "chunks_total".to_string(),
            self.chunks_total.load(Ordering::Relaxed),
        );
        stats.insert(
            "messages_completed".to_string(),
            self.messages_completed.load(Ordering::Relaxed),
        );
        stats.insert(
            "messages_expired".to_string(),
            self.messages_expired.load(Ordering::Relaxed),
        );
        stats.insert(
            "chunks_expired".to_string(),
            self.chunks_expired.load(Ordering::Relaxed),
        );
        stats.insert(
            "chunks_duplicated".to_string(),
            self.chunks_duplicated.load(Ordering::Relaxed),
        );
        stats.insert(
            "chunks_invalid".to_string(),
            self.chunks_invalid.load(Ordering::Relaxed),
        );
        stats
    }
}
