//! Errors surfaced by the audio engine and its device collaborators

use psola_analysis::AnalysisError;
use thiserror::Error;

/// Errors that can occur while building or running the pitch-shift pipeline
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Analysis setup failed: {0}")]
    Analysis(#[from] AnalysisError),
    #[error("Sample rate must be positive")]
    InvalidSampleRate,
    #[error("Ring of {ring_size} samples too small, need at least {required}")]
    RingTooSmall { ring_size: usize, required: usize },
    #[error("Block size must be positive")]
    InvalidBlockSize,
    #[error("No audio {0} device found")]
    NoDevice(&'static str),
    #[error("Unsupported device sample format: {0}")]
    UnsupportedFormat(String),
    #[error("Failed to build audio stream: {0}")]
    BuildStream(String),
    #[error("Failed to start audio stream: {0}")]
    PlayStream(String),
    #[error("Audio stream error: {0}")]
    Stream(String),
    #[error("No capture data received for {0} ms")]
    CaptureTimeout(u64),
    #[error("Playback stalled for {0} ms")]
    PlaybackTimeout(u64),
    #[error("Failed to spawn processing thread: {0}")]
    Spawn(String),
    #[error("Processing thread panicked")]
    ThreadPanicked,
}
