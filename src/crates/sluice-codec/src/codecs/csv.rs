use super::Codec;
use crate::error::{CodecError, Result};
use crate::message::{Message, RawPayload};

/// Decodes delimiter-separated records using a fixed column list.
///
/// Each record becomes one message whose fields are named after the
/// configured columns. A `message` column supplies the message text,
/// otherwise the record is re-joined with the delimiter.
#[derive(Debug)]
pub struct CsvCodec {
    columns: Vec<String>,
    delimiter: u8,
}

impl CsvCodec {
    /// Non-ASCII delimiters are replaced by a comma.
    pub fn new(columns: Vec<String>, delimiter: char) -> Self {
        let delimiter = u8::try_from(delimiter)
            .ok()
            .filter(u8::is_ascii)
            .unwrap_or(b',');
        Self { columns, delimiter }
    }
}

impl Codec for CsvCodec {
    fn name(&self) -> &'static str {
        "csv"
    }

    fn decode(&self, payload: RawPayload) -> Result<Vec<Message>> {
        let mut reader = ::csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(self.delimiter)
            .from_reader(&payload.bytes[..]);

        let source = payload.remote_host();
        let mut messages = Vec::new();
        for record in reader.records() {
            let record = record?;
            if record.len() != self.columns.len() {
                return Err(CodecError::CsvColumns {
                    expected: self.columns.len(),
                    actual: record.len(),
                });
            }

            let text = match self.columns.iter().position(|c| c == "message") {
                Some(index) => record[index].to_string(),
                None => record
                    .iter()
                    .collect::<Vec<_>>()
                    .join(&char::from(self.delimiter).to_string()),
            };

            let mut message = Message::new(source.clone(), payload.received_at, text)
                .with_remote_addr(payload.remote_addr);
            for (column, value) in self.columns.iter().zip(record.iter()) {
                if column != "message" {
                    message.add_field(column.clone(), value);
                }
            }
            messages.push(message);
        }
        Ok(messages)
    }
}
