//! Per-format payload decoders.

mod csv;
mod gelf;
mod json;
mod netflow;
mod raw;
mod syslog;

pub use self::csv::CsvCodec;
pub use self::gelf::GelfCodec;
pub use self::json::JsonCodec;
pub use self::netflow::NetflowCodec;
pub use self::raw::RawCodec;
pub use self::syslog::SyslogCodec;

use crate::error::Result;
use crate::message::{Message, RawPayload};
use serde::{Deserialize, Serialize};
use sluice_netflow::FieldTypeRegistry;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Turns one complete payload into zero or more messages.
pub trait Codec: Send + Sync {
    fn name(&self) -> &'static str;

    fn decode(&self, payload: RawPayload) -> Result<Vec<Message>>;

    /// Codec-specific counters.
    fn metrics_snapshot(&self) -> HashMap<String, u64> {
        HashMap::new()
    }

    /// Drops per-sender state that has not been used for a while. Returns
    /// the number of entries removed.
    fn evict_idle(&self) -> usize {
        0
    }
}

fn default_message_key() -> String {
    "message".to_string()
}

fn default_timestamp_key() -> String {
    "timestamp".to_string()
}

fn default_csv_delimiter() -> char {
    ','
}

/// Codec selected for a listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum CodecKind {
    Gelf,
    Json {
        #[serde(default = "default_message_key")]
        message_key: String,
        #[serde(default = "default_timestamp_key")]
        timestamp_key: String,
    },
    Syslog,
    Csv {
        columns: Vec<String>,
        #[serde(default = "default_csv_delimiter")]
        delimiter: char,
    },
    Raw,
    Netflow,
}

impl CodecKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Gelf => "gelf",
            Self::Json { .. } => "json",
            Self::Syslog => "syslog",
            Self::Csv { .. } => "csv",
            Self::Raw => "raw",
            Self::Netflow => "netflow",
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parses a codec name as given on the command line. CSV needs its column
/// list and can only be configured from a file.
impl FromStr for CodecKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gelf" => Ok(Self::Gelf),
            "json" => Ok(Self::Json {
                message_key: default_message_key(),
                timestamp_key: default_timestamp_key(),
            }),
            "syslog" => Ok(Self::Syslog),
            "raw" => Ok(Self::Raw),
            "netflow" => Ok(Self::Netflow),
            "csv" => Err("the csv codec needs columns and must be set in a config file".to_string()),
            other => Err(format!(
                "unknown codec '{other}', expected one of gelf, json, syslog, raw, netflow"
            )),
        }
    }
}

/// Build the codec for `kind`. The registry is only used by NetFlow.
pub fn build_codec(kind: &CodecKind, registry: Arc<FieldTypeRegistry>) -> Arc<dyn Codec> {
    match kind {
        CodecKind::Gelf => Arc::new(GelfCodec::new()),
        CodecKind::Json {
            message_key,
            timestamp_key,
        } => Arc::new(JsonCodec::new(message_key.clone(), timestamp_key.clone())),
        CodecKind::Syslog => Arc::new(SyslogCodec::new()),
        CodecKind::Csv { columns, delimiter } => {
            Arc::new(CsvCodec::new(columns.clone(), *delimiter))
        }
        CodecKind::Raw => Arc::new(RawCodec::new()),
        CodecKind::Netflow => Arc::new(NetflowCodec::new(registry)),
    }
}
