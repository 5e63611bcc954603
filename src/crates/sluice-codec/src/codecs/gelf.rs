use super::Codec;
use crate::error::{CodecError, Result};
use crate::message::{Message, RawPayload};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Marker some senders put in front of uncompressed GELF.
const UNCOMPRESSED_MARKER: [u8; 2] = [0x1f, 0x3c];

/// GELF 1.1 decoder.
///
/// `short_message` is required. `host` becomes the message source and
/// `timestamp` (seconds with optional fraction) the message time; both fall
/// back to the transport metadata. Additional fields drop their leading
/// underscore, except the reserved `_id`.
#[derive(Debug, Default)]
pub struct GelfCodec;

impl GelfCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Codec for GelfCodec {
    fn name(&self) -> &'static str {
        "gelf"
    }

    fn decode(&self, payload: RawPayload) -> Result<Vec<Message>> {
        let mut body = &payload.bytes[..];
        if body.starts_with(&UNCOMPRESSED_MARKER) {
            body = &body[2..];
        }

        let object = match serde_json::from_slice::<Value>(body)? {
            Value::Object(object) => object,
            other => return Err(CodecError::NotAnObject(json_type(&other))),
        };

        Ok(vec![gelf_message(object, &payload)?])
    }
}

fn gelf_message(mut object: Map<String, Value>, payload: &RawPayload) -> Result<Message> {
    let short_message = match object.remove("short_message") {
        Some(Value::String(text)) if !text.trim().is_empty() => text,
        _ => return Err(CodecError::MissingField("short_message")),
    };

    let source = match object.remove("host") {
        Some(Value::String(host)) if !host.is_empty() => host,
        _ => payload.remote_host(),
    };

    let timestamp = object
        .remove("timestamp")
        .and_then(|value| parse_gelf_timestamp(&value))
        .unwrap_or(payload.received_at);

    object.remove("version");

    let mut message =
        Message::new(source, timestamp, short_message).with_remote_addr(payload.remote_addr);
    for (key, value) in object {
        match key.strip_prefix('_') {
            Some("id") => {
                tracing::debug!("ignoring reserved GELF field _id");
            }
            Some(name) if !name.is_empty() => message.add_field(name, value),
            Some(_) => {}
            None => message.add_field(key, value),
        }
    }
    Ok(message)
}

fn parse_gelf_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let seconds = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.parse::<f64>().ok()?,
        _ => return None,
    };
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    let millis = (seconds * 1000.0).round() as i64;
    DateTime::from_timestamp_millis(millis)
}

pub(crate) fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
