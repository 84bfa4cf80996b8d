//! Audio engine - runs detector and shifter over blocks from a source to a sink

use crate::error::AudioError;
use crate::shifter::{PitchShifter, ShifterConfig};
use crate::stream::{SampleSink, SampleSource};
use crossbeam_channel::{bounded, Receiver, Sender};
use psola_analysis::{is_voiced, DetectorConfig, PitchDetector, DEFAULT_ANALYSIS_SIZE};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub const DEFAULT_SAMPLE_RATE: u32 = 44100;
pub const DEFAULT_BLOCK_SIZE: usize = 256;

/// Blocks between progress events
const PROGRESS_INTERVAL_BLOCKS: u64 = 64;

/// Pitch scale shared between a control thread and the processing thread.
///
/// One writer, one reader; the processing thread samples it once per block,
/// so a new value may take effect one block late.
#[derive(Debug)]
pub struct PitchScale {
    bits: AtomicU64,
}

impl PitchScale {
    pub fn new(scale: f64) -> Self {
        Self {
            bits: AtomicU64::new(scale.to_bits()),
        }
    }

    pub fn set(&self, scale: f64) {
        self.bits.store(scale.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

impl Default for PitchScale {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// Settings shared by the detector and shifter of one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub sample_rate: u32,
    pub block_size: usize,
    pub analysis_size: usize,
    /// Shifter ring length; `None` picks the default for the sample rate
    pub ring_size: Option<usize>,
}

impl EngineConfig {
    pub fn new(sample_rate: u32, block_size: usize) -> Self {
        Self {
            sample_rate,
            block_size,
            analysis_size: DEFAULT_ANALYSIS_SIZE,
            ring_size: None,
        }
    }

    pub fn with_analysis_size(mut self, analysis_size: usize) -> Self {
        self.analysis_size = analysis_size;
        self
    }

    pub fn with_ring_size(mut self, ring_size: usize) -> Self {
        self.ring_size = Some(ring_size);
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_RATE, DEFAULT_BLOCK_SIZE)
    }
}

/// Counters reported while and after processing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub blocks: u64,
    pub samples: u64,
    pub voiced_samples: u64,
}

impl PipelineStats {
    /// Share of processed samples that carried a pitch estimate
    pub fn voiced_fraction(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.voiced_samples as f64 / self.samples as f64
        }
    }
}

/// Per-stream processing state (held in the processing thread)
pub struct EngineState {
    detector: PitchDetector,
    shifter: PitchShifter,
    /// Pre-allocated pitch estimates (avoids allocation per block)
    pitches: Vec<f32>,
}

impl EngineState {
    pub fn new(config: &EngineConfig) -> Result<Self, AudioError> {
        if config.block_size == 0 {
            return Err(AudioError::InvalidBlockSize);
        }

        let detector = PitchDetector::new(
            DetectorConfig::new(config.block_size, config.sample_rate)
                .with_analysis_size(config.analysis_size),
        )?;

        // The shifter's input delay must match the detector it is paired with
        let mut shifter_config = ShifterConfig::new(config.sample_rate, detector.latency());
        if let Some(ring_size) = config.ring_size {
            shifter_config = shifter_config.with_ring_size(ring_size);
        }
        let shifter = PitchShifter::new(shifter_config)?;

        Ok(Self {
            detector,
            shifter,
            pitches: vec![0.0; config.block_size],
        })
    }

    pub fn detector(&self) -> &PitchDetector {
        &self.detector
    }

    pub fn shifter(&self) -> &PitchShifter {
        &self.shifter
    }

    /// Input-to-output delay in samples
    pub fn latency(&self) -> usize {
        self.shifter.latency()
    }

    /// Detect then shift one block. Returns the number of voiced samples.
    pub fn process(&mut self, input: &[f32], scale: f64, output: &mut [f32]) -> usize {
        let len = input.len();

        // Should rarely happen: blocks are sized at construction
        if len > self.pitches.len() {
            self.pitches.resize(len, 0.0);
        }

        let pitches = &mut self.pitches[..len];
        self.detector.detect_into(input, pitches);
        self.shifter.shift_into(input, pitches, scale, &mut output[..len]);

        pitches.iter().filter(|&&p| is_voiced(p)).count()
    }

    pub fn reset(&mut self) {
        self.detector.reset();
        self.shifter.reset();
    }
}

/// Pull blocks from `source`, process them, push them to `sink`.
///
/// The stop flag and the scale are checked once per block. A block is either
/// fully processed and written or, if the source or sink fails, abandoned and
/// the error returned. `progress` is called every few blocks.
pub fn run_pipeline<S, K>(
    source: &mut S,
    sink: &mut K,
    state: &mut EngineState,
    scale: &PitchScale,
    stop: &AtomicBool,
    block_size: usize,
    mut progress: impl FnMut(&PipelineStats),
) -> Result<PipelineStats, AudioError>
where
    S: SampleSource + ?Sized,
    K: SampleSink + ?Sized,
{
    let mut input = vec![0.0f32; block_size];
    let mut output = vec![0.0f32; block_size];
    let mut stats = PipelineStats::default();

    while !stop.load(Ordering::Relaxed) {
        let count = source.read_block(&mut input)?;
        if count == 0 {
            break;
        }

        let factor = scale.get();
        let voiced = state.process(&input[..count], factor, &mut output[..count]);
        sink.write_block(&output[..count])?;

        stats.blocks += 1;
        stats.samples += count as u64;
        stats.voiced_samples += voiced as u64;

        if stats.blocks % PROGRESS_INTERVAL_BLOCKS == 0 {
            progress(&stats);
        }
    }

    sink.finish()?;
    Ok(stats)
}

/// Events sent from the processing thread
#[derive(Debug, Clone)]
pub enum AudioEvent {
    Started {
        sample_rate: u32,
        block_size: usize,
        latency: usize,
    },
    Progress(PipelineStats),
    Stopped(PipelineStats),
    /// Processing ended on a source or sink failure
    Error(String),
}

/// Handle to a running processing thread
pub struct AudioEngine {
    /// Receive events from the processing thread
    pub event_rx: Receiver<AudioEvent>,
    scale: Arc<PitchScale>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<PipelineStats, AudioError>>>,
}

impl AudioEngine {
    /// Create the event channel.
    /// Buffer size of 1024 leaves headroom when the receiver falls behind
    fn create_channel() -> (Sender<AudioEvent>, Receiver<AudioEvent>) {
        bounded(1024)
    }

    /// Build the processing state and start the processing thread.
    ///
    /// Configuration errors are returned here, before any thread starts.
    pub fn spawn<S, K>(
        config: EngineConfig,
        source: S,
        sink: K,
        initial_scale: f64,
    ) -> Result<Self, AudioError>
    where
        S: SampleSource + 'static,
        K: SampleSink + 'static,
    {
        let mut state = EngineState::new(&config)?;
        let (evt_tx, evt_rx) = Self::create_channel();
        let scale = Arc::new(PitchScale::new(initial_scale));
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_scale = scale.clone();
        let thread_shutdown = shutdown.clone();
        let handle = thread::Builder::new()
            .name("psola-processing".into())
            .spawn(move || {
                let mut source = source;
                let mut sink = sink;
                let latency = state.latency();

                tracing::info!(
                    sample_rate = config.sample_rate,
                    block_size = config.block_size,
                    latency,
                    "processing started"
                );
                let _ = evt_tx.try_send(AudioEvent::Started {
                    sample_rate: config.sample_rate,
                    block_size: config.block_size,
                    latency,
                });

                let result = run_pipeline(
                    &mut source,
                    &mut sink,
                    &mut state,
                    &thread_scale,
                    &thread_shutdown,
                    config.block_size,
                    |stats| {
                        let _ = evt_tx.try_send(AudioEvent::Progress(*stats));
                    },
                );

                match &result {
                    Ok(stats) => {
                        tracing::info!(
                            blocks = stats.blocks,
                            samples = stats.samples,
                            voiced = stats.voiced_fraction(),
                            "processing stopped"
                        );
                        let _ = evt_tx.try_send(AudioEvent::Stopped(*stats));
                    }
                    Err(e) => {
                        // Reported by whoever joins the thread
                        let _ = evt_tx.try_send(AudioEvent::Error(e.to_string()));
                    }
                }
                result
            })
            .map_err(|e| AudioError::Spawn(e.to_string()))?;

        Ok(Self {
            event_rx: evt_rx,
            scale,
            shutdown,
            handle: Some(handle),
        })
    }

    /// Set the pitch scale; takes effect from the next block
    pub fn set_pitch_scale(&self, scale: f64) {
        self.scale.set(scale);
    }

    pub fn pitch_scale(&self) -> f64 {
        self.scale.get()
    }

    /// Shared scale handle for a control thread
    pub fn scale_handle(&self) -> Arc<PitchScale> {
        self.scale.clone()
    }

    /// Check if shutdown was requested
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Whether the processing thread is still running
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Request shutdown; the current block is finished first
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Wait for the processing thread and return its outcome
    pub fn join(mut self) -> Result<PipelineStats, AudioError> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| AudioError::ThreadPanicked)?,
            None => Ok(PipelineStats::default()),
        }
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.stop();
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{BufferSink, BufferSource};
    use std::f32::consts::PI;
    use std::time::Duration;

    fn sine(freq: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| 0.5 * (2.0 * PI * freq * i as f32 / 44100.0).sin())
            .collect()
    }

    struct FailingSource {
        blocks_before_failure: usize,
    }

    impl SampleSource for FailingSource {
        fn read_block(&mut self, block: &mut [f32]) -> Result<usize, AudioError> {
            if self.blocks_before_failure == 0 {
                return Err(AudioError::Stream("device unplugged".into()));
            }
            self.blocks_before_failure -= 1;
            block.fill(0.1);
            Ok(block.len())
        }
    }

    /// Accepts a number of blocks, then fails every write
    struct FailingSink {
        blocks_before_failure: usize,
        samples: Vec<f32>,
        finished: bool,
    }

    impl FailingSink {
        fn new(blocks_before_failure: usize) -> Self {
            Self {
                blocks_before_failure,
                samples: Vec::new(),
                finished: false,
            }
        }
    }

    impl SampleSink for FailingSink {
        fn write_block(&mut self, block: &[f32]) -> Result<(), AudioError> {
            if self.blocks_before_failure == 0 {
                return Err(AudioError::PlaybackTimeout(2000));
            }
            self.blocks_before_failure -= 1;
            self.samples.extend_from_slice(block);
            Ok(())
        }

        fn finish(&mut self) -> Result<(), AudioError> {
            self.finished = true;
            Ok(())
        }
    }

    /// Never ends; used to exercise stop requests
    struct EndlessSource;

    impl SampleSource for EndlessSource {
        fn read_block(&mut self, block: &mut [f32]) -> Result<usize, AudioError> {
            block.fill(0.0);
            thread::sleep(Duration::from_millis(1));
            Ok(block.len())
        }
    }

    #[test]
    fn test_pitch_scale_round_trip() {
        let scale = PitchScale::default();
        assert_eq!(scale.get(), 1.0);
        scale.set(1.7);
        assert_eq!(scale.get(), 1.7);
    }

    #[test]
    fn test_engine_state_rejects_zero_block() {
        assert!(matches!(
            EngineState::new(&EngineConfig::new(44100, 0)),
            Err(AudioError::InvalidBlockSize)
        ));
    }

    #[test]
    fn test_engine_state_couples_latency() {
        let state = EngineState::new(&EngineConfig::default().with_analysis_size(4096)).unwrap();
        assert_eq!(state.detector().latency(), 4096);
        assert_eq!(state.latency(), 4096 + 2000 + 2205);
    }

    #[test]
    fn test_pipeline_preserves_length() {
        let input = sine(220.0, 10_000);
        let mut source = BufferSource::new(input.clone());
        let mut sink = BufferSink::new();
        let mut state = EngineState::new(&EngineConfig::default()).unwrap();
        let stop = AtomicBool::new(false);
        let mut progress_calls = 0;

        let stats = run_pipeline(
            &mut source,
            &mut sink,
            &mut state,
            &PitchScale::default(),
            &stop,
            256,
            |_| progress_calls += 1,
        )
        .unwrap();

        assert_eq!(sink.samples().len(), input.len());
        assert_eq!(stats.samples, input.len() as u64);
        // 39 full blocks and one short block
        assert_eq!(stats.blocks, 40);
        assert_eq!(progress_calls, 0);
        assert!(stats.voiced_samples > 0);
    }

    #[test]
    fn test_pipeline_stops_before_reading() {
        let mut source = BufferSource::new(vec![0.5; 1000]);
        let mut sink = BufferSink::new();
        let mut state = EngineState::new(&EngineConfig::default()).unwrap();
        let stop = AtomicBool::new(true);

        let stats = run_pipeline(
            &mut source,
            &mut sink,
            &mut state,
            &PitchScale::default(),
            &stop,
            256,
            |_| {},
        )
        .unwrap();

        assert_eq!(stats.blocks, 0);
        assert_eq!(source.remaining(), 1000);
    }

    #[test]
    fn test_pipeline_source_error_is_fatal() {
        let mut source = FailingSource {
            blocks_before_failure: 3,
        };
        let mut sink = BufferSink::new();
        let mut state = EngineState::new(&EngineConfig::default()).unwrap();
        let stop = AtomicBool::new(false);

        let result = run_pipeline(
            &mut source,
            &mut sink,
            &mut state,
            &PitchScale::default(),
            &stop,
            256,
            |_| {},
        );

        assert!(matches!(result, Err(AudioError::Stream(_))));
        // Only whole blocks reached the sink
        assert_eq!(sink.samples().len(), 3 * 256);
    }

    #[test]
    fn test_pipeline_sink_error_is_fatal() {
        let mut source = BufferSource::new(sine(220.0, 256 * 10));
        let mut sink = FailingSink::new(4);
        let mut state = EngineState::new(&EngineConfig::default()).unwrap();
        let stop = AtomicBool::new(false);

        let result = run_pipeline(
            &mut source,
            &mut sink,
            &mut state,
            &PitchScale::default(),
            &stop,
            256,
            |_| {},
        );

        assert!(matches!(result, Err(AudioError::PlaybackTimeout(_))));
        assert_eq!(sink.samples.len(), 4 * 256);
        // No retry: the failed block was consumed from the source once
        assert_eq!(source.remaining(), 256 * 5);
        assert!(!sink.finished);
    }

    #[test]
    fn test_engine_runs_to_end_of_stream() {
        let input = sine(220.0, 50_000);
        let engine = AudioEngine::spawn(
            EngineConfig::default(),
            BufferSource::new(input),
            BufferSink::new(),
            1.0,
        )
        .unwrap();

        let stats = engine.join().unwrap();
        assert_eq!(stats.samples, 50_000);
    }

    #[test]
    fn test_engine_reports_events() {
        let engine = AudioEngine::spawn(
            EngineConfig::default(),
            BufferSource::new(sine(220.0, 256 * 70)),
            BufferSink::new(),
            1.0,
        )
        .unwrap();
        let events = engine.event_rx.clone();
        engine.join().unwrap();

        let received: Vec<AudioEvent> = events.try_iter().collect();
        assert!(matches!(
            received.first(),
            Some(AudioEvent::Started { latency: 6253, .. })
        ));
        assert!(received.iter().any(|e| matches!(e, AudioEvent::Progress(_))));
        assert!(matches!(
            received.last(),
            Some(AudioEvent::Stopped(PipelineStats { blocks: 70, .. }))
        ));
    }

    #[test]
    fn test_engine_stop() {
        let engine = AudioEngine::spawn(
            EngineConfig::default(),
            EndlessSource,
            BufferSink::new(),
            1.0,
        )
        .unwrap();
        engine.set_pitch_scale(2.0);
        assert_eq!(engine.pitch_scale(), 2.0);

        thread::sleep(Duration::from_millis(20));
        engine.stop();
        assert!(engine.is_shutdown());
        let stats = engine.join().unwrap();
        assert!(stats.blocks > 0);
    }

    #[test]
    fn test_engine_surfaces_source_error() {
        let engine = AudioEngine::spawn(
            EngineConfig::default(),
            FailingSource {
                blocks_before_failure: 2,
            },
            BufferSink::new(),
            1.0,
        )
        .unwrap();
        let events = engine.event_rx.clone();

        assert!(matches!(engine.join(), Err(AudioError::Stream(_))));
        assert!(events
            .try_iter()
            .any(|e| matches!(e, AudioEvent::Error(_))));
    }

    #[test]
    fn test_engine_surfaces_sink_error() {
        let engine = AudioEngine::spawn(
            EngineConfig::default(),
            BufferSource::new(sine(220.0, 256 * 10)),
            FailingSink::new(3),
            1.0,
        )
        .unwrap();
        let events = engine.event_rx.clone();

        assert!(matches!(engine.join(), Err(AudioError::PlaybackTimeout(_))));
        let received: Vec<AudioEvent> = events.try_iter().collect();
        assert!(matches!(received.last(), Some(AudioEvent::Error(_))));
        assert!(!received
            .iter()
            .any(|e| matches!(e, AudioEvent::Stopped(_))));
    }
}
