use super::Codec;
use super::gelf::json_type;
use crate::error::{CodecError, Result};
use crate::message::{Message, RawPayload};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Numbers above this are taken as epoch milliseconds rather than seconds.
const MILLIS_THRESHOLD: f64 = 100_000_000_000.0;

/// Decodes a JSON object (or an array of objects) into flattened messages.
///
/// Nested objects become dotted keys. The configured message key supplies
/// the message text and the timestamp key its time (RFC 3339 or epoch).
#[derive(Debug)]
pub struct JsonCodec {
    message_key: String,
    timestamp_key: String,
}

impl JsonCodec {
    pub fn new(message_key: String, timestamp_key: String) -> Self {
        Self {
            message_key,
            timestamp_key,
        }
    }

    fn to_message(&self, object: Map<String, Value>, payload: &RawPayload) -> Message {
        let mut flat = Map::new();
        flatten_into(&mut flat, None, object);

        let text = match flat.remove(&self.message_key) {
            Some(Value::String(text)) => text,
            Some(other) => other.to_string(),
            None => String::from_utf8_lossy(&payload.bytes).trim().to_string(),
        };
        let timestamp = flat
            .remove(&self.timestamp_key)
            .and_then(|value| parse_timestamp(&value))
            .unwrap_or(payload.received_at);
        let source = match flat.remove("host") {
            Some(Value::String(host)) => host,
            _ => payload.remote_host(),
        };

        let mut message = Message::new(source, timestamp, text).with_remote_addr(payload.remote_addr);
        for (key, value) in flat {
            message.add_field(key, value);
        }
        message
    }
}

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn decode(&self, payload: RawPayload) -> Result<Vec<Message>> {
        match serde_json::from_slice::<Value>(&payload.bytes)? {
            Value::Object(object) => Ok(vec![self.to_message(object, &payload)]),
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Object(object) => Ok(self.to_message(object, &payload)),
                    other => Err(CodecError::NotAnObject(json_type(&other))),
                })
                .collect(),
            other => Err(CodecError::NotAnObject(json_type(&other))),
        }
    }
}

fn flatten_into(out: &mut Map<String, Value>, prefix: Option<&str>, object: Map<String, Value>) {
    for (key, value) in object {
        let key = match prefix {
            Some(prefix) => format!("{prefix}.{key}"),
            None => key,
        };
        match value {
            Value::Object(nested) => flatten_into(out, Some(&key), nested),
            other => {
                out.insert(key, other);
            }
        }
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => {
            let n = n.as_f64()?;
            if !n.is_finite() || n < 0.0 {
                return None;
            }
            let millis = if n >= MILLIS_THRESHOLD {
                n.round() as i64
            } else {
                (n * 1000.0).round() as i64
            };
            DateTime::from_timestamp_millis(millis)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn codec() -> JsonCodec {
        JsonCodec::new("message".to_string(), "timestamp".to_string())
    }

    #[test]
    fn nested_objects_are_flattened() {
        let payload = RawPayload::new(
            &br#"{"message":"login","timestamp":"2024-05-01T10:00:00Z","user":{"name":"ana","id":7}}"#[..],
            None,
        );
        let messages = codec().decode(payload).unwrap();

        let message = &messages[0];
        assert_eq!(message.message, "login");
        assert_eq!(
            message.timestamp,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(message.field("user.name"), Some(&Value::from("ana")));
        assert_eq!(message.field("user.id"), Some(&Value::from(7)));
        assert!(message.field("message").is_none());
    }

    #[test]
    fn epoch_seconds_and_millis_are_both_accepted() {
        let expected = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(parse_timestamp(&Value::from(1_700_000_000)), Some(expected));
        assert_eq!(
            parse_timestamp(&Value::from(1_700_000_000_000_u64)),
            Some(expected)
        );
        assert_eq!(parse_timestamp(&Value::from("yesterday")), None);
    }

    #[test]
    fn arrays_yield_one_message_per_object() {
        let payload = RawPayload::new(&br#"[{"message":"a"},{"message":"b"}]"#[..], None);
        let messages = codec().decode(payload).unwrap();
        let texts: Vec<_> = messages.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(texts, ["a", "b"]);
    }

    #[test]
    fn custom_keys_and_missing_message() {
        let codec = JsonCodec::new("msg".to_string(), "ts".to_string());
        let messages = codec
            .decode(RawPayload::new(&br#"{"msg":"custom","ts":1}"#[..], None))
            .unwrap();
        assert_eq!(messages[0].message, "custom");
        assert_eq!(messages[0].timestamp, Utc.timestamp_opt(1, 0).unwrap());

        let messages = codec
            .decode(RawPayload::new(&br#"{"level":"info"}"#[..], None))
            .unwrap();
        assert_eq!(messages[0].message, r#"{"level":"info"}"#);
    }

    #[test]
    fn scalars_are_rejected() {
        let err = codec()
            .decode(RawPayload::new(&b"42"[..], None))
            .unwrap_err();
        assert!(matches!(err, CodecError::NotAnObject("a number")));
    }
}
