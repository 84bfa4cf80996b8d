//! End-to-end behaviour of detector and shifter running together

use approx::assert_relative_eq;
use psola_analysis::{is_voiced, DetectorConfig, PitchDetector};
use psola_audio::{
    run_pipeline, BufferSink, BufferSource, EngineConfig, EngineState, PitchScale, PitchShifter,
    ShifterConfig, DEFAULT_RING_SIZE,
};
use std::f32::consts::PI;
use std::sync::atomic::AtomicBool;

const SAMPLE_RATE: u32 = 44100;
const BLOCK: usize = 256;

fn sine(freq: f32, len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| 0.5 * (2.0 * PI * freq * i as f32 / SAMPLE_RATE as f32).sin())
        .collect()
}

/// Narrow positive pulses, one per period
fn pulse_train(freq: f32, len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| {
            let c = (2.0 * PI * freq * i as f32 / SAMPLE_RATE as f32).cos();
            0.5 * c.max(0.0).powi(8)
        })
        .collect()
}

fn process(input: &[f32], scale: f64) -> (Vec<f32>, usize) {
    let mut state = EngineState::new(&EngineConfig::new(SAMPLE_RATE, BLOCK)).unwrap();
    let latency = state.latency();
    let mut source = BufferSource::new(input.to_vec());
    let mut sink = BufferSink::with_capacity(input.len());

    run_pipeline(
        &mut source,
        &mut sink,
        &mut state,
        &PitchScale::new(scale),
        &AtomicBool::new(false),
        BLOCK,
        |_| {},
    )
    .unwrap();

    (sink.into_samples(), latency)
}

/// Median of the voiced estimates a fresh detector reports for `samples`
fn measured_pitch(samples: &[f32]) -> f32 {
    let mut detector = PitchDetector::new(DetectorConfig::new(BLOCK, SAMPLE_RATE)).unwrap();
    let latency = detector.latency();
    let mut estimates = Vec::with_capacity(samples.len());
    for block in samples.chunks(BLOCK) {
        estimates.extend(detector.detect(block));
    }

    let mut voiced: Vec<f32> = estimates[latency..]
        .iter()
        .copied()
        .filter(|&p| is_voiced(p))
        .collect();
    assert!(!voiced.is_empty(), "no voiced estimates");
    voiced.sort_by(|a, b| a.total_cmp(b));
    voiced[voiced.len() / 2]
}

fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |m, s| m.max(s.abs()))
}

#[test]
fn silence_in_silence_out() {
    let (output, _) = process(&vec![0.0; 20_000], 2.0);
    assert_eq!(output.len(), 20_000);
    assert!(output.iter().all(|&s| s == 0.0));
}

#[test]
fn identity_keeps_pitch() {
    let input = sine(220.0, SAMPLE_RATE as usize * 2);
    let (output, latency) = process(&input, 1.0);

    let pitch = measured_pitch(&output[latency..]);
    assert_relative_eq!(pitch, 220.0, max_relative = 0.02);
}

#[test]
fn out_of_range_scales_match_identity() {
    let input = sine(220.0, 30_000);
    let (reference, _) = process(&input, 1.0);

    for scale in [0.05, 10.0] {
        let (output, _) = process(&input, scale);
        assert_eq!(output, reference, "scale {}", scale);
    }
}

#[test]
fn octave_up_doubles_pitch() {
    let input = pulse_train(220.0, SAMPLE_RATE as usize * 2);
    let (output, latency) = process(&input, 2.0);

    let pitch = measured_pitch(&output[latency + 4096..]);
    assert_relative_eq!(pitch, 441.0, max_relative = 0.05);
}

#[test]
fn output_stays_bounded_past_ring_wrap() {
    let len = DEFAULT_RING_SIZE * 4;
    let input = sine(220.0, len);
    let input_peak = peak(&input);

    for scale in [1.0, 1.5] {
        let mut shifter = PitchShifter::new(ShifterConfig::new(SAMPLE_RATE, 2048)).unwrap();
        let mut output = Vec::with_capacity(len);
        for block in input.chunks(BLOCK) {
            let pitches = vec![220.0f32; block.len()];
            output.extend(shifter.shift(block, &pitches, scale));
        }

        assert_eq!(output.len(), len);
        assert!(output.iter().all(|s| s.is_finite()));
        assert!(
            peak(&output) <= 2.0 * input_peak,
            "scale {} peak {}",
            scale,
            peak(&output)
        );
        // Still producing signal after several ring wraps
        assert!(peak(&output[len - 5000..]) > 0.1);
    }
}

#[test]
fn block_size_does_not_change_output() {
    let input = sine(330.0, 12_000);
    let (reference, _) = process(&input, 1.25);

    let mut state = EngineState::new(&EngineConfig::new(SAMPLE_RATE, 100)).unwrap();
    let mut source = BufferSource::new(input.clone());
    let mut sink = BufferSink::new();
    run_pipeline(
        &mut source,
        &mut sink,
        &mut state,
        &PitchScale::new(1.25),
        &AtomicBool::new(false),
        100,
        |_| {},
    )
    .unwrap();

    assert_eq!(sink.samples(), reference.as_slice());
}
