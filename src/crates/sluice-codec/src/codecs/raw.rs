use super::Codec;
use crate::error::Result;
use crate::message::{Message, RawPayload};

/// Uses the payload text as the message, unchanged apart from trailing
/// line endings.
#[derive(Debug, Default)]
pub struct RawCodec;

impl RawCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Codec for RawCodec {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn decode(&self, payload: RawPayload) -> Result<Vec<Message>> {
        let text = String::from_utf8_lossy(&payload.bytes);
        let text = text.trim_end_matches(['\n', '\r', '\0']);
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let message = Message::new(payload.remote_host(), payload.received_at, text)
            .with_remote_addr(payload.remote_addr);
        Ok(vec![message])
    }
}
