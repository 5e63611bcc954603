//! Stage wiring: chunk reassembly, then decompression, then a codec.

use crate::codecs::Codec;
use crate::error::Result;
use crate::message::{Message, RawPayload};
use crate::stages::{ChunkOutcome, ChunkStage, DecompressStage};
use sluice_chunking::ChunkAggregator;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    /// The payload reached the codec
    Decoded,
    /// A chunk was stored and its message is still incomplete
    Pending,
    /// The chunk stage rejected the datagram
    Invalid,
}

#[derive(Debug)]
pub struct PipelineOutput {
    pub messages: Vec<Message>,
    pub status: PipelineStatus,
}

impl PipelineOutput {
    fn empty(status: PipelineStatus) -> Self {
        Self {
            messages: Vec::new(),
            status,
        }
    }
}

/// The processing path of one listener.
///
/// Stream transports frame their input before calling [`Pipeline::process`]
/// and run without the chunk stage.
#[derive(Clone)]
pub struct Pipeline {
    chunking: Option<ChunkStage>,
    decompress: DecompressStage,
    codec: Arc<dyn Codec>,
}

impl Pipeline {
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        Self {
            chunking: None,
            decompress: DecompressStage::default(),
            codec,
        }
    }

    pub fn with_chunking(mut self, aggregator: Arc<ChunkAggregator>) -> Self {
        self.chunking = Some(ChunkStage::new(aggregator));
        self
    }

    pub fn with_decompression(mut self, stage: DecompressStage) -> Self {
        self.decompress = stage;
        self
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    pub fn is_chunked(&self) -> bool {
        self.chunking.is_some()
    }

    pub fn process(&self, payload: RawPayload) -> Result<PipelineOutput> {
        let payload = match &self.chunking {
            Some(stage) => match stage.process(payload) {
                ChunkOutcome::Ready(payload) => payload,
                ChunkOutcome::Pending => return Ok(PipelineOutput::empty(PipelineStatus::Pending)),
                ChunkOutcome::Invalid => return Ok(PipelineOutput::empty(PipelineStatus::Invalid)),
            },
            None => payload,
        };

        let payload = self.decompress.process(payload)?;
        let messages = self.codec.decode(payload)?;
        Ok(PipelineOutput {
            messages,
            status: PipelineStatus::Decoded,
        })
    }
}
