//! Streaming pitch detection using FFT autocorrelation
//!
//! Samples are collected into a zero-padded analysis buffer. Every time the
//! first half fills, the buffer is autocorrelated and the strongest lag past
//! the first lobe decides the pitch. The estimate is held for every sample
//! until the next analysis completes.

use crate::autocorr::Autocorrelator;
use crate::error::AnalysisError;

/// Pitch reported when a window has no discernible periodicity
pub const UNVOICED: f32 = -1.0;

/// Default analysis window length in samples
pub const DEFAULT_ANALYSIS_SIZE: usize = 2048;

/// Highest pitch the lag search can report
pub const MAX_ALLOWABLE_PITCH_HZ: f32 = 900.0;

/// Lowest pitch the lag search is sized for
pub const MIN_ALLOWABLE_PITCH_HZ: f32 = 60.0;

/// Headroom applied to the longest lag
const MAX_LAG_HEADROOM: f32 = 1.1;

/// Normalized autocorrelation below this ends the first lobe
const FIRST_LOBE_THRESHOLD: f32 = 0.25;

/// Peak must exceed this for the window to count as voiced
const VOICING_THRESHOLD: f32 = 0.3;

/// Returns true if `estimate` carries a pitch rather than the unvoiced sentinel
#[inline]
pub fn is_voiced(estimate: f32) -> bool {
    estimate > 0.0
}

/// Construction parameters for [`PitchDetector`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorConfig {
    /// Expected block length; only used to size scratch space
    pub window_size: usize,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Analysis window length; must be a power of two
    pub analysis_size: usize,
}

impl DetectorConfig {
    pub fn new(window_size: usize, sample_rate: u32) -> Self {
        Self {
            window_size,
            sample_rate,
            analysis_size: DEFAULT_ANALYSIS_SIZE,
        }
    }

    pub fn with_analysis_size(mut self, analysis_size: usize) -> Self {
        self.analysis_size = analysis_size;
        self
    }

    /// Shortest lag searched (highest pitch)
    pub fn min_lag(&self) -> usize {
        (self.sample_rate as f32 / MAX_ALLOWABLE_PITCH_HZ) as usize
    }

    /// Lag search upper bound, exclusive (lowest pitch)
    pub fn max_lag(&self) -> usize {
        (MAX_LAG_HEADROOM * self.sample_rate as f32 / MIN_ALLOWABLE_PITCH_HZ) as usize
    }

    fn validate(&self) -> Result<(), AnalysisError> {
        if self.sample_rate == 0 {
            return Err(AnalysisError::InvalidSampleRate);
        }
        if !self.analysis_size.is_power_of_two() || self.analysis_size < 2 {
            return Err(AnalysisError::AnalysisSizeNotPowerOfTwo(self.analysis_size));
        }
        let max_lag = self.max_lag();
        if max_lag >= self.analysis_size {
            return Err(AnalysisError::WindowTooShort {
                analysis_size: self.analysis_size,
                max_lag,
            });
        }
        Ok(())
    }
}

/// Streaming autocorrelation pitch detector
pub struct PitchDetector {
    sample_rate: u32,
    analysis_size: usize,
    min_lag: usize,
    max_lag: usize,
    /// First half holds recent samples, second half stays zero
    analysis_buffer: Vec<f32>,
    fill_pos: usize,
    current_pitch: f32,
    autocorrelator: Autocorrelator,
    /// Expected block length, used to size [`PitchDetector::detect`] output
    window_size: usize,
}

impl PitchDetector {
    /// Create a detector, validating the configuration
    pub fn new(config: DetectorConfig) -> Result<Self, AnalysisError> {
        config.validate()?;

        let padded = config.analysis_size * 2;
        let detector = Self {
            sample_rate: config.sample_rate,
            analysis_size: config.analysis_size,
            min_lag: config.min_lag(),
            max_lag: config.max_lag(),
            analysis_buffer: vec![0.0; padded],
            fill_pos: 0,
            current_pitch: UNVOICED,
            autocorrelator: Autocorrelator::new(padded),
            window_size: config.window_size,
        };

        tracing::debug!(
            sample_rate = detector.sample_rate,
            analysis_size = detector.analysis_size,
            min_lag = detector.min_lag,
            max_lag = detector.max_lag,
            "pitch detector ready"
        );

        Ok(detector)
    }

    /// Samples between an input sample and the estimate that covers it
    pub fn latency(&self) -> usize {
        self.analysis_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Last computed estimate in Hz, or [`UNVOICED`]
    pub fn current_pitch(&self) -> f32 {
        self.current_pitch
    }

    /// Searched lag range `[min, max)` in samples
    pub fn lag_range(&self) -> (usize, usize) {
        (self.min_lag, self.max_lag)
    }

    /// Estimate pitch for each sample of `input`
    pub fn detect(&mut self, input: &[f32]) -> Vec<f32> {
        let mut estimates = Vec::with_capacity(input.len().max(self.window_size));
        estimates.resize(input.len(), UNVOICED);
        self.detect_into(input, &mut estimates);
        estimates
    }

    /// Estimate pitch for each sample of `input`, writing into `estimates`.
    ///
    /// Only the first `input.len()` entries of `estimates` are written.
    pub fn detect_into(&mut self, input: &[f32], estimates: &mut [f32]) {
        debug_assert!(estimates.len() >= input.len());

        for (&sample, estimate) in input.iter().zip(estimates.iter_mut()) {
            self.analysis_buffer[self.fill_pos] = sample;
            self.fill_pos += 1;

            if self.fill_pos == self.analysis_size {
                self.current_pitch = self.analyze();
                self.fill_pos = 0;
            }

            *estimate = self.current_pitch;
        }
    }

    /// Forget buffered samples and the held estimate
    pub fn reset(&mut self) {
        self.analysis_buffer.fill(0.0);
        self.fill_pos = 0;
        self.current_pitch = UNVOICED;
    }

    fn analyze(&mut self) -> f32 {
        let Some(autocorr) = self.autocorrelator.compute(&self.analysis_buffer) else {
            tracing::trace!("silent analysis window");
            return UNVOICED;
        };
        pick_pitch(autocorr, self.min_lag, self.max_lag, self.sample_rate)
    }
}

/// Choose a pitch from a normalized autocorrelation.
///
/// The search skips the lobe around zero lag: it starts at the first lag at or
/// after `min_lag` whose value drops below the lobe threshold, then takes the
/// highest value before `max_lag`.
fn pick_pitch(autocorr: &[f32], min_lag: usize, max_lag: usize, sample_rate: u32) -> f32 {
    let upper = max_lag.min(autocorr.len());
    let Some(lobe_end) = (min_lag..upper).find(|&lag| autocorr[lag] < FIRST_LOBE_THRESHOLD) else {
        tracing::trace!("no lobe end within lag range");
        return UNVOICED;
    };

    let mut peak_lag = lobe_end;
    let mut peak = autocorr[lobe_end];
    for (lag, &value) in autocorr.iter().enumerate().take(upper).skip(lobe_end + 1) {
        if value > peak {
            peak = value;
            peak_lag = lag;
        }
    }

    if peak <= VOICING_THRESHOLD || peak_lag == 0 {
        tracing::trace!(peak, "weak periodicity");
        return UNVOICED;
    }

    let pitch = sample_rate as f32 / peak_lag as f32;
    tracing::trace!(pitch, peak, peak_lag, "voiced window");
    pitch
}
