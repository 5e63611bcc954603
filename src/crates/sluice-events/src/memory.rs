//! A bounded in-memory message index implementing [`SearchEngine`].
//!
//! Queries are whitespace separated terms that must all match:
//!
//! * `*` or an empty query matches everything,
//! * `field:value` matches a field rendered as text exactly (`field:*` only
//!   needs the field to exist), values may be double-quoted,
//! * any other term must occur in the message text, ignoring case,
//! * a leading `-` or a preceding `NOT` negates a term; `AND` is ignored.

use crate::definition::{AggregationFunction, SeriesSpec, TimeRange};
use crate::error::SearchError;
use crate::search::{
    AggregationQuery, PivotResult, PivotRow, PivotValue, RowSource, ScrollCursor, SearchEngine,
    SearchQuery,
};
use async_trait::async_trait;
use chrono::{SecondsFormat, TimeDelta};
use parking_lot::RwLock;
use serde_json::Value;
use sluice_codec::Message;
use std::collections::{BTreeMap, HashSet, VecDeque};

pub const DEFAULT_CAPACITY: usize = 100_000;

#[derive(Debug, Clone)]
struct IndexedMessage {
    streams: Vec<String>,
    message: Message,
}

#[derive(Debug)]
pub struct MemorySearchEngine {
    capacity: usize,
    messages: RwLock<VecDeque<IndexedMessage>>,
}

impl Default for MemorySearchEngine {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl MemorySearchEngine {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            messages: RwLock::new(VecDeque::new()),
        }
    }

    /// Adds a message to `streams`, dropping the oldest one when full.
    pub fn index(&self, streams: &[String], message: Message) {
        let mut messages = self.messages.write();
        if messages.len() == self.capacity {
            messages.pop_front();
        }
        messages.push_back(IndexedMessage {
            streams: streams.to_vec(),
            message,
        });
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Matching messages ordered by timestamp.
    fn matching(
        &self,
        query: &str,
        streams: &[String],
        time_range: &TimeRange,
    ) -> Result<Vec<Message>, SearchError> {
        let filter = MessageFilter::parse(query)?;
        let mut matched: Vec<Message> = self
            .messages
            .read()
            .iter()
            .filter(|indexed| {
                streams.is_empty() || indexed.streams.iter().any(|s| streams.contains(s))
            })
            .filter(|indexed| time_range.contains(indexed.message.timestamp))
            .filter(|indexed| filter.matches(&indexed.message))
            .map(|indexed| indexed.message.clone())
            .collect();
        matched.sort_by_key(|m| m.timestamp);
        Ok(matched)
    }
}

#[async_trait]
impl SearchEngine for MemorySearchEngine {
    async fn scroll(&self, query: &SearchQuery) -> Result<Box<dyn ScrollCursor>, SearchError> {
        let pending = self.matching(&query.query, &query.streams, &query.time_range)?;
        Ok(Box::new(MemoryCursor {
            pending: pending.into(),
            batch_size: query.batch_size.max(1),
        }))
    }

    async fn aggregate(&self, query: &AggregationQuery) -> Result<PivotResult, SearchError> {
        let matched = self.matching(&query.query, &query.streams, &query.time_range)?;
        let bucket = query
            .bucket
            .and_then(|width| TimeDelta::from_std(width).ok())
            .filter(|width| width.num_milliseconds() > 0);

        let mut groups: BTreeMap<Vec<String>, Vec<&Message>> = BTreeMap::new();
        'messages: for message in &matched {
            let mut key = Vec::with_capacity(query.group_by.len() + 1);
            if let Some(width) = bucket {
                let width_ms = width.num_milliseconds();
                let offset = (message.timestamp - query.time_range.from).num_milliseconds();
                let start =
                    query.time_range.from + TimeDelta::milliseconds(offset / width_ms * width_ms);
                key.push(start.to_rfc3339_opts(SecondsFormat::Millis, true));
            }
            for field in &query.group_by {
                // Messages without a group field belong to no group.
                let Some(value) = message.field_text(field) else {
                    continue 'messages;
                };
                key.push(value);
            }
            groups.entry(key).or_default().push(message);
        }

        let grouped = !query.group_by.is_empty() || bucket.is_some();
        if !grouped && groups.is_empty() {
            groups.insert(Vec::new(), Vec::new());
        }

        let mut rows: Vec<PivotRow> = groups
            .into_iter()
            .map(|(key, messages)| PivotRow {
                key,
                source: RowSource::Leaf,
                values: series_values(&query.series, &messages, false),
            })
            .collect();
        if grouped {
            let all: Vec<&Message> = matched.iter().collect();
            rows.push(PivotRow {
                key: Vec::new(),
                source: RowSource::NonLeaf,
                values: series_values(&query.series, &all, true),
            });
        }

        Ok(PivotResult {
            rows,
            total: matched.len() as u64,
        })
    }
}

struct MemoryCursor {
    pending: VecDeque<Message>,
    batch_size: usize,
}

#[async_trait]
impl ScrollCursor for MemoryCursor {
    async fn next_batch(&mut self) -> Result<Option<Vec<Message>>, SearchError> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        let n = self.batch_size.min(self.pending.len());
        Ok(Some(self.pending.drain(..n).collect()))
    }
}

fn series_values(series: &[SeriesSpec], messages: &[&Message], rollup: bool) -> Vec<PivotValue> {
    series
        .iter()
        .map(|spec| PivotValue {
            key: spec.id.clone(),
            value: compute(spec, messages),
            rollup,
        })
        .collect()
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn compute(spec: &SeriesSpec, messages: &[&Message]) -> Option<f64> {
    let field = spec.field.as_deref().filter(|f| !f.is_empty());
    let numbers = || {
        messages
            .iter()
            .filter_map(move |m| field.and_then(|f| m.field(f)).and_then(numeric))
    };

    match spec.function {
        AggregationFunction::Count => Some(match field {
            Some(f) => messages.iter().filter(|m| m.field_text(f).is_some()).count() as f64,
            None => messages.len() as f64,
        }),
        AggregationFunction::Sum => Some(numbers().sum()),
        AggregationFunction::Avg => {
            let (sum, n) = numbers().fold((0.0, 0_usize), |(sum, n), v| (sum + v, n + 1));
            (n > 0).then(|| sum / n as f64)
        }
        AggregationFunction::Min => numbers().reduce(f64::min),
        AggregationFunction::Max => numbers().reduce(f64::max),
        AggregationFunction::Card => {
            let field = field?;
            let distinct: HashSet<String> =
                messages.iter().filter_map(|m| m.field_text(field)).collect();
            Some(distinct.len() as f64)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Term {
    Text(String),
    Field { name: String, value: Option<String> },
    Not(Box<Term>),
}

impl Term {
    fn matches(&self, message: &Message) -> bool {
        match self {
            Self::Text(text) => message.message.to_lowercase().contains(text),
            Self::Field { name, value: None } => message.field_text(name).is_some(),
            Self::Field {
                name,
                value: Some(value),
            } => message.field_text(name).as_deref() == Some(value),
            Self::Not(term) => !term.matches(message),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct MessageFilter {
    terms: Vec<Term>,
}

impl MessageFilter {
    fn parse(query: &str) -> Result<Self, SearchError> {
        let invalid = |reason: &str| SearchError::InvalidQuery {
            query: query.to_string(),
            reason: reason.to_string(),
        };

        let mut terms = Vec::new();
        let mut negate = false;
        for token in tokenize(query).ok_or_else(|| invalid("unbalanced quotes"))? {
            match token.as_str() {
                "AND" | "*" => continue,
                "NOT" => {
                    negate = true;
                    continue;
                }
                "OR" => return Err(invalid("OR is not supported")),
                _ => {}
            }

            let (negated, token) = match token.strip_prefix('-') {
                Some(rest) if !rest.is_empty() => (true, rest),
                _ => (false, token.as_str()),
            };
            let term = match token.split_once(':') {
                Some((name, value)) if !name.is_empty() && !name.starts_with('"') => {
                    let value = unquote(value);
                    Term::Field {
                        name: name.to_string(),
                        value: (value != "*").then(|| value.to_string()),
                    }
                }
                _ => Term::Text(unquote(token).to_lowercase()),
            };
            terms.push(if negate ^ negated {
                Term::Not(Box::new(term))
            } else {
                term
            });
            negate = false;
        }
        Ok(Self { terms })
    }

    fn matches(&self, message: &Message) -> bool {
        self.terms.iter().all(|term| term.matches(message))
    }
}

/// Splits on whitespace outside double quotes; `None` if a quote is open.
fn tokenize(query: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = query.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '\\' if quoted => {
                current.push(ch);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '"' => {
                quoted = !quoted;
                current.push(ch);
            }
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if quoted {
        return None;
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Some(tokens)
}

fn unquote(value: &str) -> String {
    match value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
    {
        Some(inner) => inner.replace("\\\"", "\"").replace("\\\\", "\\"),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, minute, 0).unwrap()
    }

    fn message(minute: u32, text: &str, app: &str) -> Message {
        let mut message = Message::new("host-a", at(minute), text);
        message.add_field("application_name", app);
        message
    }

    fn streams(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn query_terms() {
        let mut msg = message(0, "Failed password for root", "sshd");
        msg.add_field("user", "jane doe");

        let matches = |q: &str| MessageFilter::parse(q).unwrap().matches(&msg);
        assert!(matches(""));
        assert!(matches("*"));
        assert!(matches("failed"));
        assert!(matches("failed AND application_name:sshd"));
        assert!(matches("user:\"jane doe\""));
        assert!(matches("user:*"));
        assert!(matches("-accepted"));
        assert!(matches("NOT application_name:php"));
        assert!(!matches("application_name:php"));
        assert!(!matches("failed missing:*"));

        assert!(MessageFilter::parse("a OR b").is_err());
        assert!(MessageFilter::parse("user:\"open").is_err());
    }

    #[test]
    fn ring_drops_the_oldest_message() {
        let engine = MemorySearchEngine::new(2);
        for minute in 0..3 {
            engine.index(&[], message(minute, "m", "a"));
        }
        assert_eq!(engine.len(), 2);
        let range = TimeRange::new(at(0), at(59));
        let matched = engine.matching("*", &[], &range).unwrap();
        assert_eq!(matched[0].timestamp, at(1));
    }

    #[tokio::test]
    async fn scroll_respects_streams_range_and_batch_size() {
        let engine = MemorySearchEngine::default();
        for minute in 0..5 {
            engine.index(&streams(&["auth"]), message(minute, "login", "sshd"));
        }
        engine.index(&streams(&["web"]), message(1, "login", "php"));

        let mut cursor = engine
            .scroll(&SearchQuery {
                query: "login".to_string(),
                streams: streams(&["auth"]),
                time_range: TimeRange::new(at(0), at(4)),
                batch_size: 3,
            })
            .await
            .unwrap();

        assert_eq!(cursor.next_batch().await.unwrap().unwrap().len(), 3);
        assert_eq!(cursor.next_batch().await.unwrap().unwrap().len(), 1);
        assert!(cursor.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn aggregate_groups_with_a_total_row() {
        let engine = MemorySearchEngine::default();
        for (minute, app, bytes) in [(0, "sshd", 10), (1, "sshd", 30), (2, "php", 5)] {
            let mut msg = message(minute, "request", app);
            msg.add_field("bytes", bytes);
            engine.index(&[], msg);
        }

        let result = engine
            .aggregate(&AggregationQuery {
                query: String::new(),
                streams: Vec::new(),
                time_range: TimeRange::new(at(0), at(10)),
                group_by: streams(&["application_name"]),
                series: vec![
                    SeriesSpec::new("n", AggregationFunction::Count, None),
                    SeriesSpec::new("avg", AggregationFunction::Avg, Some("bytes")),
                    SeriesSpec::new("hosts", AggregationFunction::Card, Some("source")),
                ],
                bucket: None,
            })
            .await
            .unwrap();

        assert_eq!(result.total, 3);
        assert_eq!(result.rows.len(), 3);
        let sshd = &result.rows[1];
        assert_eq!(sshd.key, ["sshd"]);
        assert_eq!(sshd.source, RowSource::Leaf);
        assert_eq!(sshd.values[0].value, Some(2.0));
        assert_eq!(sshd.values[1].value, Some(20.0));
        assert_eq!(sshd.values[2].value, Some(1.0));

        let total = &result.rows[2];
        assert_eq!(total.source, RowSource::NonLeaf);
        assert!(total.values.iter().all(|v| v.rollup));
        assert_eq!(total.values[0].value, Some(3.0));
    }

    #[tokio::test]
    async fn aggregate_buckets_lead_the_key() {
        let engine = MemorySearchEngine::default();
        for minute in [0, 4, 6] {
            engine.index(&[], message(minute, "x", "sshd"));
        }

        let result = engine
            .aggregate(&AggregationQuery {
                query: String::new(),
                streams: Vec::new(),
                time_range: TimeRange::new(at(0), at(10)),
                group_by: Vec::new(),
                series: vec![SeriesSpec::new("n", AggregationFunction::Count, None)],
                bucket: Some(std::time::Duration::from_secs(300)),
            })
            .await
            .unwrap();

        let leaves: Vec<_> = result
            .rows
            .iter()
            .filter(|r| r.source == RowSource::Leaf)
            .map(|r| (r.key[0].clone(), r.values[0].value))
            .collect();
        assert_eq!(
            leaves,
            [
                ("2024-06-01T12:00:00.000Z".to_string(), Some(2.0)),
                ("2024-06-01T12:05:00.000Z".to_string(), Some(1.0)),
            ]
        );
    }

    #[test]
    fn empty_numeric_series() {
        let spec = SeriesSpec::new("m", AggregationFunction::Max, Some("bytes"));
        assert_eq!(compute(&spec, &[]), None);
        let spec = SeriesSpec::new("s", AggregationFunction::Sum, Some("bytes"));
        assert_eq!(compute(&spec, &[]), Some(0.0));
    }
}
