use crate::error::ConsumerError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Enough to re-run the search that produced an event.
///
/// `filters` are `field:value` terms that narrow `query` to the group the
/// event was created for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayInfo {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub query: String,
    pub filters: Vec<String>,
    pub streams: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedEvent {
    pub id: Uuid,
    pub definition_id: String,
    pub timestamp: DateTime<Utc>,
    pub timerange_start: DateTime<Utc>,
    pub timerange_end: DateTime<Utc>,
    pub message: String,
    pub source_streams: Vec<String>,
    /// Message the event was created from, in filter mode
    pub origin_message: Option<Uuid>,
    pub fields: BTreeMap<String, Value>,
    pub replay: ReplayInfo,
}

impl DerivedEvent {
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// Receives events in batches as a run produces them.
#[async_trait]
pub trait EventConsumer: Send + Sync {
    async fn accept(&self, events: Vec<DerivedEvent>) -> Result<(), ConsumerError>;
}

/// Keeps every batch it is handed.
#[derive(Debug, Default)]
pub struct CollectingConsumer {
    batches: Mutex<Vec<Vec<DerivedEvent>>>,
}

impl CollectingConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<Vec<DerivedEvent>> {
        self.batches.lock().clone()
    }

    pub fn events(&self) -> Vec<DerivedEvent> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.batches.lock().iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventConsumer for CollectingConsumer {
    async fn accept(&self, events: Vec<DerivedEvent>) -> Result<(), ConsumerError> {
        self.batches.lock().push(events);
        Ok(())
    }
}
