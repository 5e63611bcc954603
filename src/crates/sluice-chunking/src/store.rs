//! In-progress reassembly state keyed by message id.
//!
//! Each message id moves through `absent -> partial -> {complete, expired}`.
//! Both terminal transitions go through [`DashMap::remove_if`] guarded by the
//! entry's generation, so exactly one caller ever observes the removal.
//!
//! Eviction uses a min-heap ordered by first-chunk arrival. Heap entries are
//! never removed eagerly: an entry whose generation no longer matches the
//! live map entry (because the message completed or the id was reused) is
//! simply dropped when it reaches the top of the heap.

use crate::metrics::ChunkMetrics;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Hard cap on the number of chunks of a single message.
pub const DEFAULT_MAX_CHUNKS: usize = 128;

/// How long a partial message may wait for its remaining chunks.
pub const DEFAULT_VALIDITY_WINDOW: Duration = Duration::from_millis(5000);

/// How often the eviction task should run.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Opaque 8-byte message id shared by all chunks of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(pub [u8; 8]);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// One fragment of a chunked message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: MessageId,
    pub sequence: usize,
    pub count: usize,
    pub payload: Bytes,
    pub arrival_ms: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkStoreConfig {
    pub validity_window: Duration,
    pub max_chunks: usize,
}

impl Default for ChunkStoreConfig {
    fn default() -> Self {
        Self {
            validity_window: DEFAULT_VALIDITY_WINDOW,
            max_chunks: DEFAULT_MAX_CHUNKS,
        }
    }
}

/// Result of storing a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// Chunk stored, more chunks are needed
    Incomplete,
    /// The slot was already filled; the existing payload was kept
    Duplicate,
    /// All chunks arrived; payloads concatenated in sequence order
    Complete(Bytes),
    /// The chunk could not be stored
    Failed(FailureReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// No partial message with this id exists (it expired or completed)
    UnknownMessage,
    /// Sequence number is not below the expected chunk count
    SequenceOutOfRange,
    /// The message exceeded the chunk cap and was evicted
    TooManyChunks,
}

/// Totals removed by one eviction pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EvictionReport {
    pub messages: u64,
    pub chunks: u64,
}

pub struct PartialMessage {
    generation: u64,
    expected: usize,
    first_arrival_ms: u64,
    slots: Box<[Mutex<Option<Bytes>>]>,
    filled: AtomicUsize,
}

impl PartialMessage {
    fn new(generation: u64, expected: usize, first_arrival_ms: u64) -> Self {
        let slots = (0..expected).map(|_| Mutex::new(None)).collect();
        Self {
            generation,
            expected,
            first_arrival_ms,
            slots,
            filled: AtomicUsize::new(0),
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn first_arrival_ms(&self) -> u64 {
        self.first_arrival_ms
    }

    pub fn filled(&self) -> usize {
        self.filled.load(Ordering::Acquire)
    }

    /// Store a payload unless the slot already holds one.
    fn try_fill(&self, sequence: usize, payload: Bytes) -> bool {
        let mut slot = self.slots[sequence].lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(payload);
        true
    }

    fn assemble(&self, id: MessageId) -> Bytes {
        let mut parts = Vec::with_capacity(self.slots.len());
        for (sequence, slot) in self.slots.iter().enumerate() {
            match slot.lock().as_ref() {
                Some(payload) => parts.push(payload.clone()),
                None => {
                    tracing::warn!(
                        "chunk {}/{} of message {} missing during reassembly, skipping it",
                        sequence,
                        self.expected,
                        id
                    );
                }
            }
        }

        let total = parts.iter().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(total);
        for part in parts {
            out.extend_from_slice(&part);
        }
        out.freeze()
    }
}

type HeapEntry = Reverse<(u64, u64, MessageId)>;

/// Concurrent map from message id to partial message, plus its eviction order.
pub struct ChunkStore {
    config: ChunkStoreConfig,
    entries: DashMap<MessageId, Arc<PartialMessage>>,
    eviction_order: Mutex<BinaryHeap<HeapEntry>>,
    next_generation: AtomicU64,
    metrics: Arc<ChunkMetrics>,
}

impl ChunkStore {
    pub fn new(config: ChunkStoreConfig, metrics: Arc<ChunkMetrics>) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            eviction_order: Mutex::new(BinaryHeap::new()),
            next_generation: AtomicU64::new(0),
            metrics,
        }
    }

    pub fn config(&self) -> &ChunkStoreConfig {
        &self.config
    }

    /// Number of messages still waiting for chunks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of chunks held by messages still waiting for completion.
    pub fn waiting_chunks(&self) -> usize {
        self.entries.iter().map(|entry| entry.value().filled()).sum()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries.contains_key(id)
    }

    /// Create the partial message for `id` unless it already exists.
    ///
    /// The first registration wins: a later call with a different expected
    /// count reuses the existing entry unchanged.
    pub fn register(
        &self,
        id: MessageId,
        expected: usize,
        now_ms: u64,
    ) -> Result<Arc<PartialMessage>, FailureReason> {
        if expected == 0 || expected > self.config.max_chunks {
            return Err(FailureReason::TooManyChunks);
        }

        let mut created = false;
        let entry = {
            let guard = self.entries.entry(id).or_insert_with(|| {
                created = true;
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                Arc::new(PartialMessage::new(generation, expected, now_ms))
            });
            Arc::clone(guard.value())
        };

        if created {
            self.eviction_order
                .lock()
                .push(Reverse((now_ms, entry.generation, id)));
        } else if entry.expected != expected {
            tracing::debug!(
                "message {} registered with {} chunks, ignoring conflicting count {}",
                id,
                entry.expected,
                expected
            );
        }

        Ok(entry)
    }

    /// Store one chunk payload of an already registered message.
    pub fn put_chunk(&self, id: MessageId, sequence: usize, payload: Bytes) -> PutOutcome {
        let Some(entry) = self.entries.get(&id).map(|e| Arc::clone(e.value())) else {
            return PutOutcome::Failed(FailureReason::UnknownMessage);
        };
        self.fill(id, &entry, sequence, payload)
    }

    /// Register the message if needed and store the chunk.
    pub fn add(&self, chunk: Chunk) -> PutOutcome {
        match self.register(chunk.id, chunk.count, chunk.arrival_ms) {
            Ok(entry) => self.fill(chunk.id, &entry, chunk.sequence, chunk.payload),
            Err(reason) => PutOutcome::Failed(reason),
        }
    }

    fn fill(
        &self,
        id: MessageId,
        entry: &Arc<PartialMessage>,
        sequence: usize,
        payload: Bytes,
    ) -> PutOutcome {
        if sequence >= entry.expected {
            self.evict_entry(id, entry);
            return PutOutcome::Failed(FailureReason::SequenceOutOfRange);
        }

        // Slots of a completed message stay filled, so late copies of its
        // chunks land here as duplicates too.
        if !entry.try_fill(sequence, payload) {
            self.metrics.duplicate();
            tracing::debug!(
                "duplicate chunk {}/{} for message {}",
                sequence,
                entry.expected,
                id
            );
            return PutOutcome::Duplicate;
        }

        let filled = entry.filled.fetch_add(1, Ordering::AcqRel) + 1;
        if filled > self.config.max_chunks {
            tracing::warn!(
                "message {} exceeded {} chunks, evicting it",
                id,
                self.config.max_chunks
            );
            self.evict_entry(id, entry);
            return PutOutcome::Failed(FailureReason::TooManyChunks);
        }

        if filled < entry.expected {
            return PutOutcome::Incomplete;
        }

        match self
            .entries
            .remove_if(&id, |_, live| live.generation == entry.generation)
        {
            Some(_) => {
                self.metrics.completed();
                PutOutcome::Complete(entry.assemble(id))
            }
            // Lost the race against eviction; the evictor accounted for it.
            None => PutOutcome::Incomplete,
        }
    }

    /// Remove the partial message for `id`, counting it as expired.
    ///
    /// Returns false when there was nothing to remove.
    pub fn evict(&self, id: &MessageId) -> bool {
        match self.entries.remove(id) {
            Some((_, entry)) => {
                self.metrics.expired(entry.filled() as u64);
                true
            }
            None => false,
        }
    }

    fn evict_entry(&self, id: MessageId, entry: &PartialMessage) -> bool {
        let removed = self
            .entries
            .remove_if(&id, |_, live| live.generation == entry.generation);
        match removed {
            Some((_, entry)) => {
                self.metrics.expired(entry.filled() as u64);
                true
            }
            None => false,
        }
    }

    /// Remove every partial message whose first chunk is older than the
    /// validity window.
    ///
    /// Walks the eviction heap from the oldest entry and stops at the first
    /// one that is still within the window.
    pub fn evict_expired(&self, now_ms: u64) -> EvictionReport {
        let window_ms = self.config.validity_window.as_millis() as u64;
        let mut report = EvictionReport::default();

        loop {
            let candidate = {
                let mut heap = self.eviction_order.lock();
                match heap.peek() {
                    Some(Reverse((arrival, _, _))) if now_ms.saturating_sub(*arrival) > window_ms => {
                        heap.pop()
                    }
                    _ => None,
                }
            };
            let Some(Reverse((_, generation, id))) = candidate else {
                break;
            };

            if let Some((_, entry)) = self
                .entries
                .remove_if(&id, |_, live| live.generation == generation)
            {
                let chunks = entry.filled() as u64;
                self.metrics.expired(chunks);
                report.messages += 1;
                report.chunks += chunks;
                tracing::warn!(
                    "message {} expired with {}/{} chunks",
                    id,
                    chunks,
                    entry.expected
                );
            }
        }

        report
    }

    #[cfg(test)]
    fn clear_slot(&self, id: &MessageId, sequence: usize) {
        if let Some(entry) = self.entries.get(id) {
            entry.slots[sequence].lock().take();
        }
    }
}
