//! Analysis configuration errors

use thiserror::Error;

/// Errors raised while building a pitch detector
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("Sample rate must be positive")]
    InvalidSampleRate,
    #[error("Analysis size {0} is not a power of two")]
    AnalysisSizeNotPowerOfTwo(usize),
    #[error("Analysis size {analysis_size} too short for lags up to {max_lag} samples")]
    WindowTooShort { analysis_size: usize, max_lag: usize },
}
