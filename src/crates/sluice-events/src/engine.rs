use crate::definition::{EventDefinition, SeriesSpec, TimeRange};
use crate::error::{EventProcessorError, Result, SearchError};
use crate::event::{DerivedEvent, EventConsumer, ReplayInfo};
use crate::search::{AggregationQuery, PivotResult, RowSource, SearchEngine, SearchQuery};
use crate::timeout::Timeout;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use sluice_codec::Message;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_SEARCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Whether a filter scan keeps going after the current batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanControl {
    Continue,
    StopAfterThisBatch,
}

/// Counts events against an optional limit, one batch at a time.
#[derive(Debug, Clone, Copy)]
struct FilterScan {
    limit: Option<usize>,
    emitted: usize,
}

impl FilterScan {
    fn new(limit: Option<usize>) -> Self {
        Self { limit, emitted: 0 }
    }

    fn on_batch(&mut self, events: usize) -> ScanControl {
        self.emitted += events;
        match self.limit {
            Some(limit) if self.emitted >= limit => ScanControl::StopAfterThisBatch,
            _ => ScanControl::Continue,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregationSeriesValue {
    pub series: SeriesSpec,
    pub key: Vec<String>,
    pub value: f64,
}

/// One group of an aggregation result.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationKeyResult {
    pub key: Vec<String>,
    /// End of the time bucket the group belongs to, when bucketed
    pub timestamp: Option<DateTime<Utc>>,
    pub series_values: Vec<AggregationSeriesValue>,
}

impl AggregationKeyResult {
    fn values_by_id(&self) -> HashMap<String, f64> {
        self.series_values
            .iter()
            .map(|v| (v.series.id.clone(), v.value))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub events: usize,
    /// Groups whose values did not satisfy the conditions
    pub skipped: usize,
    pub limit_reached: bool,
}

/// Runs event definitions against a search backend.
#[derive(Clone)]
pub struct AggregationEngine {
    search: Arc<dyn SearchEngine>,
    search_timeout: Duration,
}

impl AggregationEngine {
    pub fn new(search: Arc<dyn SearchEngine>) -> Self {
        Self {
            search,
            search_timeout: DEFAULT_SEARCH_TIMEOUT,
        }
    }

    /// Budget for all search calls of one run.
    pub fn with_search_timeout(mut self, timeout: Duration) -> Self {
        self.search_timeout = timeout;
        self
    }

    pub fn search_timeout(&self) -> Duration {
        self.search_timeout
    }

    /// Searches `time_range` for `definition` and hands the resulting events
    /// to `consumer`.
    ///
    /// In filter mode events are delivered batch by batch, so batches
    /// delivered before a failure stand. In aggregation mode events are
    /// delivered once, after every group was converted.
    pub async fn run(
        &self,
        definition: &EventDefinition,
        time_range: TimeRange,
        consumer: &dyn EventConsumer,
    ) -> Result<RunSummary> {
        definition.validate()?;
        let run = Run {
            definition,
            time_range,
            timeout: Timeout::new(self.search_timeout),
        };

        let summary = if definition.is_aggregation() {
            self.run_aggregation(&run, consumer).await?
        } else {
            self.run_filter(&run, consumer).await?
        };
        tracing::debug!(
            "event definition '{}' over {}: {} events, {} groups skipped",
            definition.id,
            time_range,
            summary.events,
            summary.skipped
        );
        Ok(summary)
    }

    async fn run_filter(&self, run: &Run<'_>, consumer: &dyn EventConsumer) -> Result<RunSummary> {
        let definition = run.definition;
        let query = SearchQuery {
            query: definition.query.clone(),
            streams: definition.streams.clone(),
            time_range: run.time_range,
            batch_size: definition.batch_size,
        };

        let mut cursor = run.search(self.search.scroll(&query)).await?;
        let mut scan = FilterScan::new(definition.event_limit);
        let mut summary = RunSummary::default();

        while let Some(batch) = run.search(cursor.next_batch()).await? {
            if batch.is_empty() {
                break;
            }
            let events: Vec<DerivedEvent> = batch.iter().map(|m| run.message_event(m)).collect();
            let control = scan.on_batch(events.len());
            summary.events += events.len();
            run.deliver(consumer, events).await?;

            if control == ScanControl::StopAfterThisBatch {
                tracing::warn!(
                    "event definition '{}' reached its limit of {} events, skipping the remaining matches",
                    definition.id,
                    definition.event_limit.unwrap_or_default()
                );
                summary.limit_reached = true;
                break;
            }
        }
        Ok(summary)
    }

    async fn run_aggregation(
        &self,
        run: &Run<'_>,
        consumer: &dyn EventConsumer,
    ) -> Result<RunSummary> {
        let definition = run.definition;
        // A window longer than `search_within` is a catch-up over several
        // windows; each window becomes its own bucket.
        let bucket =
            (run.time_range.duration() > definition.search_within).then_some(definition.search_within);
        let query = AggregationQuery {
            query: definition.query.clone(),
            streams: definition.streams.clone(),
            time_range: run.time_range,
            group_by: definition.group_by.clone(),
            series: definition.series.clone(),
            bucket,
        };

        let pivot = run.search(self.search.aggregate(&query)).await?;
        let results = run.key_results(&pivot, bucket.is_some())?;

        let mut summary = RunSummary::default();
        let mut events = Vec::with_capacity(results.len());
        for result in &results {
            if !run.satisfies_conditions(result)? {
                tracing::debug!(
                    "event definition '{}': group {:?} does not satisfy the conditions",
                    definition.id,
                    result.key
                );
                summary.skipped += 1;
                continue;
            }
            events.push(run.aggregation_event(result)?);
        }

        summary.events = events.len();
        if !events.is_empty() {
            run.deliver(consumer, events).await?;
        }
        Ok(summary)
    }
}

/// State of one `AggregationEngine::run` call.
struct Run<'a> {
    definition: &'a EventDefinition,
    time_range: TimeRange,
    timeout: Timeout,
}

impl Run<'_> {
    async fn search<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, SearchError>>,
    {
        match self.timeout.bound(call).await {
            Some(Ok(value)) => Ok(value),
            Some(Err(source)) => Err(EventProcessorError::SearchFailed {
                definition_id: self.definition.id.clone(),
                query: self.definition.query.clone(),
                time_range: self.time_range,
                source,
            }),
            None => Err(EventProcessorError::SearchTimeout {
                definition_id: self.definition.id.clone(),
                query: self.definition.query.clone(),
                time_range: self.time_range,
                timeout: self.timeout.budget(),
            }),
        }
    }

    async fn deliver(&self, consumer: &dyn EventConsumer, events: Vec<DerivedEvent>) -> Result<()> {
        consumer
            .accept(events)
            .await
            .map_err(|source| EventProcessorError::Consumer {
                definition_id: self.definition.id.clone(),
                source,
            })
    }

    fn replay(&self, range: TimeRange, filters: Vec<String>) -> ReplayInfo {
        ReplayInfo {
            from: range.from,
            to: range.to,
            query: self.definition.query.clone(),
            filters,
            streams: self.definition.streams.clone(),
        }
    }

    fn message_event(&self, message: &Message) -> DerivedEvent {
        let mut fields = message.fields.clone();
        fields.insert("source".to_string(), Value::from(message.source.clone()));

        DerivedEvent {
            id: Uuid::new_v4(),
            definition_id: self.definition.id.clone(),
            timestamp: message.timestamp,
            timerange_start: self.time_range.from,
            timerange_end: self.time_range.to,
            message: message.message.clone(),
            source_streams: self.definition.streams.clone(),
            origin_message: Some(message.id),
            fields,
            replay: self.replay(self.time_range, Vec::new()),
        }
    }

    /// Leaf rows as key results. Bucketed rows lead with the bucket start.
    fn key_results(&self, pivot: &PivotResult, bucketed: bool) -> Result<Vec<AggregationKeyResult>> {
        let mut results = Vec::new();
        for row in pivot.rows.iter().filter(|row| row.source == RowSource::Leaf) {
            let (timestamp, key) = if bucketed {
                let Some((bucket, key)) = row.key.split_first() else {
                    return Err(self.mismatch(&row.key, self.definition.group_by.len() + 1));
                };
                (Some(self.bucket_end(bucket)?), key.to_vec())
            } else {
                (None, row.key.clone())
            };

            let series_values = row
                .values
                .iter()
                .filter(|value| !value.rollup)
                .filter_map(|value| {
                    let series = self.definition.series(&value.key)?;
                    Some(AggregationSeriesValue {
                        series: series.clone(),
                        key: key.clone(),
                        value: value.value?,
                    })
                })
                .collect();

            results.push(AggregationKeyResult {
                key,
                timestamp,
                series_values,
            });
        }
        Ok(results)
    }

    fn bucket_end(&self, bucket: &str) -> Result<DateTime<Utc>> {
        let start = DateTime::parse_from_rfc3339(bucket)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| EventProcessorError::SearchFailed {
                definition_id: self.definition.id.clone(),
                query: self.definition.query.clone(),
                time_range: self.time_range,
                source: SearchError::Backend(format!("bucket key '{bucket}' is not a timestamp: {e}")),
            })?;
        let width = TimeDelta::from_std(self.definition.search_within).unwrap_or(TimeDelta::MAX);
        let end = start.checked_add_signed(width).unwrap_or(self.time_range.to);
        Ok(end.min(self.time_range.to))
    }

    fn mismatch(&self, key: &[String], expected: usize) -> EventProcessorError {
        EventProcessorError::KeyFieldMismatch {
            definition_id: self.definition.id.clone(),
            expected,
            actual: key.len(),
            key: key.to_vec(),
        }
    }

    fn satisfies_conditions(&self, result: &AggregationKeyResult) -> Result<bool> {
        let Some(conditions) = &self.definition.conditions else {
            return Ok(true);
        };
        conditions
            .evaluate(&result.values_by_id())
            .map_err(|e| EventProcessorError::InvalidCondition {
                definition_id: self.definition.id.clone(),
                reason: e.to_string(),
            })
    }

    fn aggregation_event(&self, result: &AggregationKeyResult) -> Result<DerivedEvent> {
        let definition = self.definition;
        if result.key.len() < definition.group_by.len() {
            return Err(self.mismatch(&result.key, definition.group_by.len()));
        }

        let (timestamp, range) = match result.timestamp {
            Some(ts) => {
                let mut range = TimeRange::ending_at(ts, definition.search_within);
                range.from = range.from.max(self.time_range.from);
                (ts, range)
            }
            None => (self.time_range.to, self.time_range),
        };

        let mut fields = BTreeMap::new();
        let mut filters = Vec::with_capacity(definition.group_by.len());
        for (name, value) in definition.group_by.iter().zip(&result.key) {
            fields.insert(name.clone(), Value::from(value.as_str()));
            filters.push(filter_term(name, value));
        }
        for value in &result.series_values {
            fields.insert(value.series.event_field_name(), number(value.value));
        }

        let message = if result.key.is_empty() {
            definition.title.clone()
        } else {
            format!("{}: {}", definition.title, result.key.join(", "))
        };

        Ok(DerivedEvent {
            id: Uuid::new_v4(),
            definition_id: definition.id.clone(),
            timestamp,
            timerange_start: range.from,
            timerange_end: range.to,
            message,
            source_streams: definition.streams.clone(),
            origin_message: None,
            fields,
            replay: self.replay(range, filters),
        })
    }
}

/// `field:value`, quoting values that contain blanks or quotes.
fn filter_term(field: &str, value: &str) -> String {
    if value.is_empty() || value.contains([' ', '\t', '"']) {
        format!("{field}:\"{}\"", value.replace('"', "\\\""))
    } else {
        format!("{field}:{value}")
    }
}

/// Integral values stay integers so counts read as counts.
fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        Value::from(value as i64)
    } else {
        Value::from(value)
    }
}
