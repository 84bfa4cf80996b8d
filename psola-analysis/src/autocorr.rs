//! FFT autocorrelation (Wiener-Khinchin) over a zero-padded window

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

/// Zero-lag energy at or below this is treated as silence
pub const SILENCE_FLOOR: f32 = 1e-9;

/// Computes the normalized autocorrelation of a zero-padded analysis buffer
pub struct Autocorrelator {
    /// Transform length (twice the analysis window)
    size: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    /// Pre-allocated FFT buffer to avoid allocation in compute()
    fft_buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    output: Vec<f32>,
}

impl Autocorrelator {
    /// Create an autocorrelator for buffers of `size` samples (window plus padding)
    pub fn new(size: usize) -> Self {
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(size);
        let inverse = planner.plan_fft_inverse(size);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());

        Self {
            size,
            forward,
            inverse,
            fft_buffer: vec![Complex::new(0.0, 0.0); size],
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
            output: vec![0.0; size],
        }
    }

    /// Transform length this autocorrelator was planned for
    pub fn size(&self) -> usize {
        self.size
    }

    /// Autocorrelate `padded` and normalize by the zero-lag value.
    ///
    /// Returns `None` when the zero-lag energy is at or below [`SILENCE_FLOOR`],
    /// in which case there is nothing to normalize against.
    pub fn compute(&mut self, padded: &[f32]) -> Option<&[f32]> {
        debug_assert_eq!(padded.len(), self.size);

        for (slot, &sample) in self.fft_buffer.iter_mut().zip(padded) {
            *slot = Complex::new(sample, 0.0);
        }
        for slot in self.fft_buffer.iter_mut().skip(padded.len()) {
            *slot = Complex::new(0.0, 0.0);
        }

        self.forward
            .process_with_scratch(&mut self.fft_buffer, &mut self.scratch);

        // Power spectrum
        for bin in self.fft_buffer.iter_mut() {
            *bin = Complex::new(bin.norm_sqr(), 0.0);
        }

        self.inverse
            .process_with_scratch(&mut self.fft_buffer, &mut self.scratch);

        // rustfft leaves the inverse unscaled; dividing by the zero-lag value
        // below cancels that factor as well.
        let zero_lag = self.fft_buffer[0].re / self.size as f32;
        if zero_lag.is_nan() || zero_lag <= SILENCE_FLOOR {
            return None;
        }

        let norm = 1.0 / self.fft_buffer[0].re;
        for (out, bin) in self.output.iter_mut().zip(&self.fft_buffer) {
            *out = bin.re * norm;
        }

        Some(&self.output)
    }
}
