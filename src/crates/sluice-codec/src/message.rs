use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use uuid::Uuid;

/// Bytes received from a transport, before any decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload {
    pub bytes: Bytes,
    pub remote_addr: Option<SocketAddr>,
    pub received_at: DateTime<Utc>,
}

impl RawPayload {
    pub fn new(bytes: impl Into<Bytes>, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            bytes: bytes.into(),
            remote_addr,
            received_at: Utc::now(),
        }
    }

    pub fn at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }

    /// Same metadata, different bytes.
    pub fn with_bytes(&self, bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            remote_addr: self.remote_addr,
            received_at: self.received_at,
        }
    }

    /// Sender host, used when the payload does not name one.
    pub fn remote_host(&self) -> String {
        self.remote_addr
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// A structured log message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    /// Host that produced the message
    pub source: String,
    pub remote_addr: Option<SocketAddr>,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub fields: BTreeMap<String, Value>,
}

impl Message {
    pub fn new(
        source: impl Into<String>,
        timestamp: DateTime<Utc>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            remote_addr: None,
            timestamp,
            message: message.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_remote_addr(mut self, remote_addr: Option<SocketAddr>) -> Self {
        self.remote_addr = remote_addr;
        self
    }

    pub fn add_field(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Field value rendered as text; strings are returned without quotes.
    pub fn field_text(&self, key: &str) -> Option<String> {
        match key {
            "message" => Some(self.message.clone()),
            "source" => Some(self.source.clone()),
            _ => self.fields.get(key).map(|value| match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
        }
    }
}
