//! Pitch analysis for PSOLA
//!
//! Provides the streaming autocorrelation pitch detector that feeds the
//! pitch shifter, along with the FFT autocorrelation it is built on.

mod autocorr;
mod detector;
mod error;

pub use autocorr::{Autocorrelator, SILENCE_FLOOR};
pub use detector::{
    is_voiced, DetectorConfig, PitchDetector, DEFAULT_ANALYSIS_SIZE, MAX_ALLOWABLE_PITCH_HZ,
    MIN_ALLOWABLE_PITCH_HZ, UNVOICED,
};
pub use error::AnalysisError;
