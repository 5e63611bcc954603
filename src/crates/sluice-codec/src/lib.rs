//! Turning received bytes into structured messages.
//!
//! A [`Pipeline`] runs each payload through optional chunk reassembly,
//! zlib/gzip decompression and one [`Codec`]. Stream transports split their
//! input with [`FrameDecoder`] first.

pub mod codecs;
pub mod error;
pub mod framing;
pub mod message;
pub mod pipeline;
pub mod stages;

pub use codecs::{
    Codec, CodecKind, CsvCodec, GelfCodec, JsonCodec, NetflowCodec, RawCodec, SyslogCodec,
    build_codec,
};
pub use error::{CodecError, Result};
pub use framing::{DEFAULT_MAX_FRAME_LENGTH, Delimiter, FrameDecoder};
pub use message::{Message, RawPayload};
pub use pipeline::{Pipeline, PipelineOutput, PipelineStatus};
pub use stages::{ChunkOutcome, ChunkStage, DEFAULT_MAX_DECOMPRESSED_SIZE, DecompressStage};
