use crate::condition::Expr;
use crate::error::{EventProcessorError, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Half-open time window `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    /// The window of length `span` that ends at `to`.
    pub fn ending_at(to: DateTime<Utc>, span: Duration) -> Self {
        let span = TimeDelta::from_std(span).unwrap_or(TimeDelta::MAX);
        let from = to.checked_sub_signed(span).unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self { from, to }
    }

    pub fn duration(&self) -> Duration {
        (self.to - self.from).to_std().unwrap_or_default()
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.from <= ts && ts < self.to
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.from.to_rfc3339(), self.to.to_rfc3339())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    /// Number of distinct values
    Card,
}

impl AggregationFunction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
            Self::Card => "card",
        }
    }

    /// Every function but `count` needs a field to work on.
    pub fn requires_field(&self) -> bool {
        !matches!(self, Self::Count)
    }
}

impl fmt::Display for AggregationFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One computed value per group, referenced by `id` from conditions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeriesSpec {
    pub id: String,
    pub function: AggregationFunction,
    #[serde(default)]
    pub field: Option<String>,
}

impl SeriesSpec {
    pub fn new(id: impl Into<String>, function: AggregationFunction, field: Option<&str>) -> Self {
        Self {
            id: id.into(),
            function,
            field: field.map(str::to_string),
        }
    }

    /// Name of the event field holding this series' value, e.g.
    /// `aggregation_value_count_source`.
    pub fn event_field_name(&self) -> String {
        match self.field.as_deref().filter(|f| !f.is_empty()) {
            Some(field) => format!("aggregation_value_{}_{}", self.function, field),
            None => format!("aggregation_value_{}", self.function),
        }
    }
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

/// What to search for and how to turn results into events.
///
/// Without `series` every matching message becomes an event (filter mode).
/// With `series` one event is created per distinct `group_by` key whose
/// values satisfy `conditions` (aggregation mode).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventDefinition {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub streams: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub search_within: Duration,
    /// Defaults to `search_within`.
    #[serde(default, with = "humantime_serde")]
    pub execute_every: Option<Duration>,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub series: Vec<SeriesSpec>,
    #[serde(default)]
    pub conditions: Option<Expr>,
    #[serde(default)]
    pub event_limit: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl EventDefinition {
    pub fn new(id: impl Into<String>, title: impl Into<String>, search_within: Duration) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            query: String::new(),
            streams: Vec::new(),
            search_within,
            execute_every: None,
            group_by: Vec::new(),
            series: Vec::new(),
            conditions: None,
            event_limit: None,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn is_aggregation(&self) -> bool {
        !self.series.is_empty()
    }

    pub fn execute_every(&self) -> Duration {
        self.execute_every.unwrap_or(self.search_within)
    }

    pub fn series(&self, id: &str) -> Option<&SeriesSpec> {
        self.series.iter().find(|s| s.id == id)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| {
            Err(EventProcessorError::InvalidDefinition {
                definition_id: self.id.clone(),
                reason,
            })
        };

        if self.id.is_empty() {
            return invalid("id must not be empty".to_string());
        }
        if self.search_within.is_zero() {
            return invalid("search_within must be greater than zero".to_string());
        }
        if self.execute_every.is_some_and(|d| d.is_zero()) {
            return invalid("execute_every must be greater than zero".to_string());
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be greater than zero".to_string());
        }
        if self.event_limit == Some(0) {
            return invalid("event_limit must be greater than zero".to_string());
        }

        let mut ids = HashSet::new();
        for series in &self.series {
            if !ids.insert(series.id.as_str()) {
                return invalid(format!("duplicate series id '{}'", series.id));
            }
            if series.function.requires_field() && series.field.is_none() {
                return invalid(format!(
                    "series '{}' uses {} which needs a field",
                    series.id, series.function
                ));
            }
        }

        if let Some(conditions) = &self.conditions {
            if self.series.is_empty() {
                return invalid("conditions require at least one series".to_string());
            }
            for reference in conditions.references() {
                if !ids.contains(reference) {
                    return invalid(format!("condition references unknown series '{reference}'"));
                }
            }
        }
        Ok(())
    }
}
