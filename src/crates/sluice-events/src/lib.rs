//! Derived events from searches over ingested messages.
//!
//! An [`EventDefinition`] either turns every matching message into an event
//! (filter mode) or groups matches and creates one event per group whose
//! series values satisfy a condition (aggregation mode). The
//! [`AggregationEngine`] runs definitions against any [`SearchEngine`];
//! [`MemorySearchEngine`] is a bounded in-memory implementation.

mod condition;
mod definition;
mod engine;
mod error;
mod event;
mod memory;
mod search;
mod timeout;

pub use condition::{ConditionError, Expr};
pub use definition::{
    AggregationFunction, DEFAULT_BATCH_SIZE, EventDefinition, SeriesSpec, TimeRange,
};
pub use engine::{
    AggregationEngine, AggregationKeyResult, AggregationSeriesValue, DEFAULT_SEARCH_TIMEOUT,
    RunSummary, ScanControl,
};
pub use error::{ConsumerError, EventProcessorError, Result, SearchError};
pub use event::{CollectingConsumer, DerivedEvent, EventConsumer, ReplayInfo};
pub use memory::{DEFAULT_CAPACITY, MemorySearchEngine};
pub use search::{
    AggregationQuery, PivotResult, PivotRow, PivotValue, RowSource, ScrollCursor, SearchEngine,
    SearchQuery,
};
pub use timeout::Timeout;
