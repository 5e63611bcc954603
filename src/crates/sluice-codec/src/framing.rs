//! Delimiter framing for stream transports.

use crate::error::CodecError;
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::Decoder;

pub const DEFAULT_MAX_FRAME_LENGTH: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delimiter {
    #[default]
    Newline,
    /// GELF over TCP terminates frames with a NUL byte
    Nul,
}

impl Delimiter {
    fn byte(self) -> u8 {
        match self {
            Self::Newline => b'\n',
            Self::Nul => 0,
        }
    }
}

/// Splits a byte stream into delimiter-terminated frames.
///
/// `tokio_util::codec::AnyDelimiterCodec` fails the whole stream on an
/// oversized frame; this decoder drops that frame up to the next delimiter
/// and keeps the connection. Empty frames are skipped and a trailing `\r`
/// is removed from newline-delimited frames.
#[derive(Debug)]
pub struct FrameDecoder {
    delimiter: Delimiter,
    max_length: usize,
    /// Bytes already scanned for the delimiter
    next_index: usize,
    discarding: bool,
}

impl FrameDecoder {
    pub fn new(delimiter: Delimiter, max_length: usize) -> Self {
        Self {
            delimiter,
            max_length,
            next_index: 0,
            discarding: false,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    fn trim(&self, mut frame: BytesMut) -> Bytes {
        if self.delimiter == Delimiter::Newline && frame.last() == Some(&b'\r') {
            frame.truncate(frame.len() - 1);
        }
        frame.freeze()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(Delimiter::default(), DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl Decoder for FrameDecoder {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        let delimiter = self.delimiter.byte();
        loop {
            let Some(offset) = src[self.next_index..]
                .iter()
                .position(|&b| b == delimiter)
            else {
                if self.discarding {
                    src.clear();
                    self.next_index = 0;
                } else if src.len() > self.max_length {
                    tracing::warn!(
                        "frame exceeds {} bytes, discarding until the next delimiter",
                        self.max_length
                    );
                    src.clear();
                    self.next_index = 0;
                    self.discarding = true;
                } else {
                    self.next_index = src.len();
                }
                return Ok(None);
            };

            let end = self.next_index + offset;
            self.next_index = 0;

            if self.discarding {
                src.advance(end + 1);
                self.discarding = false;
                continue;
            }

            let frame = src.split_to(end);
            src.advance(1);

            if frame.len() > self.max_length {
                tracing::warn!(
                    "dropping {} byte frame, maximum is {}",
                    frame.len(),
                    self.max_length
                );
                continue;
            }
            if frame.is_empty() {
                continue;
            }
            return Ok(Some(self.trim(frame)));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        self.next_index = 0;
        if self.discarding || src.is_empty() {
            src.clear();
            self.discarding = false;
            return Ok(None);
        }
        let frame = src.split_to(src.len());
        Ok(Some(self.trim(frame)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(decoder: &mut FrameDecoder, input: &[u8]) -> Vec<Bytes> {
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(frame) = decoder.decode(&mut buf).unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn splits_on_newlines_and_strips_carriage_returns() {
        let mut decoder = FrameDecoder::default();
        let out = frames(&mut decoder, b"first\r\nsecond\n\nthird");
        assert_eq!(out, vec![Bytes::from("first"), Bytes::from("second")]);
    }

    #[test]
    fn partial_frame_waits_for_more_data() {
        let mut decoder = FrameDecoder::new(Delimiter::Nul, 64);
        let mut buf = BytesMut::from(&b"{\"short_message\""[..]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b":\"hi\"}\0");
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, Bytes::from("{\"short_message\":\"hi\"}"));
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_frames_are_dropped_without_failing_the_stream() {
        let mut decoder = FrameDecoder::new(Delimiter::Newline, 4);
        let mut buf = BytesMut::from(&b"0123456789"[..]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"abc\nok\n");
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, Bytes::from("ok"));
    }

    #[test]
    fn complete_oversized_frame_is_skipped() {
        let mut decoder = FrameDecoder::new(Delimiter::Newline, 4);
        let out = frames(&mut decoder, b"toolong\nfine\n");
        assert_eq!(out, vec![Bytes::from("fine")]);
    }

    #[test]
    fn trailing_frame_is_emitted_at_eof() {
        let mut decoder = FrameDecoder::default();
        let mut buf = BytesMut::from(&b"a\nlast"[..]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(Bytes::from("a")));
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        assert_eq!(
            decoder.decode_eof(&mut buf).unwrap(),
            Some(Bytes::from("last"))
        );
        assert_eq!(decoder.decode_eof(&mut buf).unwrap(), None);
    }
}
