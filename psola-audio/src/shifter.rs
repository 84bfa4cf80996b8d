//! Pitch-synchronous overlap-add pitch shifter.
//!
//! Input is written into a ring ahead of the write position by the detector's
//! latency so that each sample lines up with its pitch estimate. At every
//! input pitch period boundary, Hann-windowed two-period grains are taken
//! from the input ring and added into the output ring at synthesis markers
//! spaced `period / scale` apart. The output ring is read a fixed delay
//! behind the write position and every cell is zeroed once read.
//!
//! Unvoiced segments and out-of-range scale factors fall back to identity
//! synthesis, which with a Hann window at one-period hop reconstructs the
//! input exactly.

use crate::error::AudioError;
use crate::ring::{RingBuffer, RingIndex};
use std::f32::consts::PI;

/// Default ring length in samples
pub const DEFAULT_RING_SIZE: usize = 10_000;

/// Pitch estimates at or below this are treated as unvoiced
pub const MINIMUM_PITCH_HZ: f32 = 20.0;

/// Scale factors must be above this to take effect
pub const MIN_SCALE: f64 = 0.1;

/// Scale factors above this fall back to identity
pub const MAX_SCALE: f64 = 6.0;

/// Output delay in samples at the reference rate
const OUTPUT_DELAY_AT_REFERENCE: f64 = 2000.0;
const REFERENCE_SAMPLE_RATE: f64 = 44100.0;

/// Construction parameters for [`PitchShifter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShifterConfig {
    pub sample_rate: u32,
    /// Latency of the pitch detector feeding this shifter
    pub detector_latency: usize,
    pub ring_size: usize,
}

impl ShifterConfig {
    /// Configuration with the default ring, grown if the rate needs more room
    pub fn new(sample_rate: u32, detector_latency: usize) -> Self {
        let mut config = Self {
            sample_rate,
            detector_latency,
            ring_size: DEFAULT_RING_SIZE,
        };
        config.ring_size = config.ring_size.max(config.required_ring_size());
        config
    }

    pub fn with_ring_size(mut self, ring_size: usize) -> Self {
        self.ring_size = ring_size;
        self
    }

    /// Delay between the write position and the output read position
    pub fn output_delay(&self) -> usize {
        (OUTPUT_DELAY_AT_REFERENCE * self.sample_rate as f64 / REFERENCE_SAMPLE_RATE).round()
            as usize
    }

    /// Period of the lowest pitch, also the grain extraction offset
    pub fn minimum_period(&self) -> usize {
        (self.sample_rate as f64 / MINIMUM_PITCH_HZ as f64).round() as usize
    }

    /// Smallest ring that holds the pre-delayed input plus a full grain at
    /// the lowest pitch, and more than twice the output delay
    pub fn required_ring_size(&self) -> usize {
        let grain_span = self.detector_latency + 2 * self.minimum_period() + 1;
        grain_span.max(2 * self.output_delay() + 1).max(4)
    }

    fn validate(&self) -> Result<(), AudioError> {
        if self.sample_rate == 0 {
            return Err(AudioError::InvalidSampleRate);
        }
        let required = self.required_ring_size();
        if self.ring_size < required {
            return Err(AudioError::RingTooSmall {
                ring_size: self.ring_size,
                required,
            });
        }
        Ok(())
    }
}

/// PSOLA pitch shifter driven by per-sample pitch estimates
pub struct PitchShifter {
    sample_rate: u32,
    detector_latency: usize,
    output_delay: usize,
    minimum_period: usize,
    input_ring: RingBuffer,
    output_ring: RingBuffer,
    write_pos: RingIndex,
    read_pos: RingIndex,
    /// Center of the next grain in the output ring
    marker_pos: RingIndex,
    period_len: usize,
    samples_left: usize,
    unvoiced: bool,
    /// Hann window spanning `-period_len..=period_len`
    window: Vec<f32>,
    window_period: usize,
}

impl PitchShifter {
    pub fn new(config: ShifterConfig) -> Result<Self, AudioError> {
        config.validate()?;

        let minimum_period = config.minimum_period();
        let mut shifter = Self {
            sample_rate: config.sample_rate,
            detector_latency: config.detector_latency,
            output_delay: config.output_delay(),
            minimum_period,
            input_ring: RingBuffer::new(config.ring_size),
            output_ring: RingBuffer::new(config.ring_size),
            write_pos: RingIndex::new(0, config.ring_size),
            read_pos: RingIndex::new(-(config.output_delay() as i64), config.ring_size),
            marker_pos: RingIndex::new(0, config.ring_size),
            period_len: minimum_period,
            samples_left: 0,
            unvoiced: true,
            window: Vec::with_capacity(2 * minimum_period + 1),
            window_period: 0,
        };
        shifter.rebuild_window();

        tracing::debug!(
            sample_rate = shifter.sample_rate,
            detector_latency = shifter.detector_latency,
            output_delay = shifter.output_delay,
            minimum_period = shifter.minimum_period,
            ring_size = config.ring_size,
            "pitch shifter ready"
        );

        Ok(shifter)
    }

    /// Samples between an input sample and its shifted output
    pub fn latency(&self) -> usize {
        self.detector_latency + self.output_delay + self.minimum_period
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn ring_size(&self) -> usize {
        self.input_ring.len()
    }

    /// Whether the current input period is being treated as unvoiced
    pub fn is_unvoiced(&self) -> bool {
        self.unvoiced
    }

    /// Shift `input` using the parallel `pitches` block
    pub fn shift(&mut self, input: &[f32], pitches: &[f32], scale: f64) -> Vec<f32> {
        let mut output = vec![0.0; input.len()];
        self.shift_into(input, pitches, scale, &mut output);
        output
    }

    /// Shift `input` using the parallel `pitches` block, writing into `output`.
    ///
    /// All three slices are expected to have the same length; processing stops
    /// at the shortest.
    pub fn shift_into(&mut self, input: &[f32], pitches: &[f32], scale: f64, output: &mut [f32]) {
        debug_assert_eq!(input.len(), pitches.len());
        debug_assert!(output.len() >= input.len());

        for ((&sample, &pitch), out) in input.iter().zip(pitches).zip(output.iter_mut()) {
            let delayed = self.write_pos.offset(self.detector_latency as i64);
            self.input_ring[delayed] = sample;

            if self.samples_left == 0 {
                while !self.marker_pos.is_ahead_within_half(self.write_pos) {
                    let hop = self.synthesis_hop(scale);
                    self.marker_pos.advance(hop);
                    self.overlap_add();
                }
                self.start_period(pitch);
            }
            self.samples_left -= 1;

            *out = self.output_ring.take(self.read_pos);
            self.write_pos.advance(1);
            self.read_pos.advance(1);
        }
    }

    /// Clear both rings and restart synthesis
    pub fn reset(&mut self) {
        let ring_size = self.input_ring.len();
        self.input_ring.clear();
        self.output_ring.clear();
        self.write_pos = RingIndex::new(0, ring_size);
        self.read_pos = RingIndex::new(-(self.output_delay as i64), ring_size);
        self.marker_pos = RingIndex::new(0, ring_size);
        self.period_len = self.minimum_period;
        self.samples_left = 0;
        self.unvoiced = true;
        self.rebuild_window();
    }

    /// Scale actually applied to the current period
    fn effective_scale(&self, requested: f64) -> f64 {
        let in_range = requested > MIN_SCALE && requested <= MAX_SCALE;
        if self.unvoiced || !in_range {
            1.0
        } else {
            requested
        }
    }

    /// Distance to the next synthesis marker, kept inside the half ring so
    /// the marker always catches up with the write position
    fn synthesis_hop(&self, requested: f64) -> usize {
        let period_ratio = 1.0 / self.effective_scale(requested);
        let hop = (self.period_len as f64 * period_ratio).round() as usize;
        hop.clamp(1, self.input_ring.len() / 2 - 1)
    }

    /// Add one windowed grain around the extraction point into the output ring
    fn overlap_add(&mut self) {
        let period = self.period_len as i64;
        let source = self.write_pos.offset(-(self.minimum_period as i64));

        for (ola_index, &weight) in (-period..=period).zip(&self.window) {
            let sample = self.input_ring[source.offset(ola_index)];
            self.output_ring
                .accumulate(self.marker_pos.offset(ola_index), weight * sample);
        }
    }

    fn start_period(&mut self, pitch: f32) {
        let pitch_hz = if pitch.is_nan() || pitch <= MINIMUM_PITCH_HZ {
            self.unvoiced = true;
            MINIMUM_PITCH_HZ
        } else {
            self.unvoiced = false;
            pitch
        };

        self.period_len = ((self.sample_rate as f32 / pitch_hz).round() as usize).max(1);
        self.samples_left = self.period_len;

        if self.period_len != self.window_period {
            self.rebuild_window();
        }
    }

    fn rebuild_window(&mut self) {
        let period = self.period_len as i64;
        self.window.clear();
        self.window.extend(
            (-period..=period)
                .map(|i| 0.5 * (1.0 + (PI * i as f32 / period as f32).cos())),
        );
        self.window_period = self.period_len;
    }
}
