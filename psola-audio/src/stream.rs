//! Block-oriented sample endpoints for the processing loop

use crate::error::AudioError;

/// Producer of mono sample blocks (capture device, decoded file, ...)
pub trait SampleSource: Send {
    /// Fill `block` with the next samples.
    ///
    /// Returns the number of samples written; `0` means end of stream. Fewer
    /// than `block.len()` samples is a short final block.
    fn read_block(&mut self, block: &mut [f32]) -> Result<usize, AudioError>;
}

/// Consumer of mono sample blocks (playback device, file writer, ...)
pub trait SampleSink: Send {
    fn write_block(&mut self, block: &[f32]) -> Result<(), AudioError>;

    /// Flush anything still buffered once the stream has ended
    fn finish(&mut self) -> Result<(), AudioError> {
        Ok(())
    }
}

/// Source over samples already in memory
pub struct BufferSource {
    samples: Vec<f32>,
    pos: usize,
}

impl BufferSource {
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples, pos: 0 }
    }

    /// Samples not yet read
    pub fn remaining(&self) -> usize {
        self.samples.len() - self.pos
    }
}

impl SampleSource for BufferSource {
    fn read_block(&mut self, block: &mut [f32]) -> Result<usize, AudioError> {
        let count = block.len().min(self.remaining());
        block[..count].copy_from_slice(&self.samples[self.pos..self.pos + count]);
        self.pos += count;
        Ok(count)
    }
}

/// Sink that collects every block into memory
#[derive(Default)]
pub struct BufferSink {
    samples: Vec<f32>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }
}

impl SampleSink for BufferSink {
    fn write_block(&mut self, block: &[f32]) -> Result<(), AudioError> {
        self.samples.extend_from_slice(block);
        Ok(())
    }
}
