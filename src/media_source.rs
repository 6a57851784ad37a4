//! Endpoints of the audio graph: where PCM comes from and where it goes.

use crate::audio_graph::GraphError;
use crate::types::AudioChunk;
use crossbeam_channel::Receiver;

/// A host-controlled stream of decoded PCM.
pub trait MediaSource {
    /// True once the source can deliver audio ("ready to decode").
    fn is_ready(&self) -> bool;

    fn sample_rate(&self) -> u32;

    /// Start delivery and hand over the chunk stream. Called once, during
    /// graph construction.
    fn open(&mut self) -> Result<Receiver<AudioChunk>, GraphError>;
}

/// Final node of the chain.
pub trait AudioSink: Send {
    fn write(&mut self, samples: &[f32], sample_rate: u32);
}

/// Discards audio. Used when the host plays the stream itself.
pub struct NullSink;

impl AudioSink for NullSink {
    fn write(&mut self, _samples: &[f32], _sample_rate: u32) {}
}

/// PCM pushed by the host over a channel.
pub struct ChannelSource {
    rx: Option<Receiver<AudioChunk>>,
    sample_rate: u32,
}

impl ChannelSource {
    pub fn new(rx: Receiver<AudioChunk>, sample_rate: u32) -> Self {
        Self {
            rx: Some(rx),
            sample_rate,
        }
    }
}

impl MediaSource for ChannelSource {
    fn is_ready(&self) -> bool {
        self.rx.is_some()
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn open(&mut self) -> Result<Receiver<AudioChunk>, GraphError> {
        self.rx.take().ok_or(GraphError::SourceNotReady)
    }
}
