//! Audio engine for PSOLA - pitch shifter, processing loop, and devices
//!
//! This module provides the real-time pitch-shift pipeline:
//! - Shifter: Pitch-synchronous overlap-add driven by per-sample pitch estimates
//! - Ring: Circular buffers and wrapping indices used by the shifter
//! - Engine: Block loop tying detector and shifter between a source and a sink
//! - Device: cpal capture and playback behind the source/sink traits

mod device;
mod engine;
mod error;
mod pcm;
mod ring;
mod shifter;
mod stream;

pub use device::{open_capture, open_playback, CaptureReader, DeviceStream, PlaybackWriter};
pub use engine::{
    run_pipeline, AudioEngine, AudioEvent, EngineConfig, EngineState, PipelineStats, PitchScale,
    DEFAULT_BLOCK_SIZE, DEFAULT_SAMPLE_RATE,
};
pub use error::AudioError;
pub use pcm::{f32_to_i16, i16_to_f32};
pub use ring::{RingBuffer, RingIndex};
pub use shifter::{
    PitchShifter, ShifterConfig, DEFAULT_RING_SIZE, MAX_SCALE, MINIMUM_PITCH_HZ, MIN_SCALE,
};
pub use stream::{BufferSink, BufferSource, SampleSink, SampleSource};
