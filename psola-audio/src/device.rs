//! cpal capture and playback endpoints.
//!
//! The cpal callbacks only move samples through lock-free SPSC rings; the
//! processing thread blocks on the other end. A `cpal::Stream` is not `Send`,
//! so opening a device returns a [`DeviceStream`] guard that stays on the
//! opening thread and a reader/writer half that moves to the processing thread.

use crate::error::AudioError;
use crate::pcm::{f32_to_i16, i16_to_f32};
use crate::stream::{SampleSink, SampleSource};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SizedSample, Stream, StreamConfig};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Give up on a stalled device after this long
const DEVICE_TIMEOUT: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Blocks of silence queued before playback starts
const PLAYBACK_PRIME_BLOCKS: usize = 2;

/// Last error reported by a stream callback
type ErrorSlot = Arc<Mutex<Option<String>>>;

/// Keeps a device stream running until dropped
pub struct DeviceStream {
    _stream: Stream,
    pub sample_rate: u32,
    pub channels: u16,
}

fn ring_capacity(sample_rate: u32, block_size: usize) -> usize {
    // Half a second, and never fewer than eight blocks
    (sample_rate as usize / 2).max(block_size * 8)
}

fn stream_config(channels: u16, sample_rate: u32) -> StreamConfig {
    StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

/// Record the error for the processing thread, which reports it
fn error_callback(slot: ErrorSlot, kind: &'static str) -> impl FnMut(cpal::StreamError) + Send {
    move |err| {
        *slot.lock() = Some(format!("{}: {}", kind, err));
    }
}

fn take_error(slot: &ErrorSlot) -> Result<(), AudioError> {
    match slot.lock().take() {
        Some(err) => Err(AudioError::Stream(err)),
        None => Ok(()),
    }
}

/// Mono samples from the default input device
pub struct CaptureReader {
    consumer: HeapCons<f32>,
    error: ErrorSlot,
    dropped: Arc<AtomicUsize>,
    reported_dropped: usize,
    /// Longest wait for a full block
    timeout: Duration,
}

impl CaptureReader {
    fn new(
        consumer: HeapCons<f32>,
        error: ErrorSlot,
        dropped: Arc<AtomicUsize>,
        timeout: Duration,
    ) -> Self {
        Self {
            consumer,
            error,
            dropped,
            reported_dropped: 0,
            timeout,
        }
    }
}

/// Open the default input device at `sample_rate`, downmixing to mono
pub fn open_capture(
    sample_rate: u32,
    block_size: usize,
) -> Result<(DeviceStream, CaptureReader), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(AudioError::NoDevice("input"))?;
    let default_config = device
        .default_input_config()
        .map_err(|e| AudioError::BuildStream(e.to_string()))?;

    let channels = default_config.channels();
    let config = stream_config(channels, sample_rate);
    let (producer, consumer) = HeapRb::<f32>::new(ring_capacity(sample_rate, block_size)).split();
    let error: ErrorSlot = Arc::new(Mutex::new(None));
    let dropped = Arc::new(AtomicUsize::new(0));

    let stream = match default_config.sample_format() {
        SampleFormat::F32 => build_capture::<f32>(
            &device,
            &config,
            producer,
            error.clone(),
            dropped.clone(),
            |s| s,
        )?,
        SampleFormat::I16 => build_capture::<i16>(
            &device,
            &config,
            producer,
            error.clone(),
            dropped.clone(),
            i16_to_f32,
        )?,
        other => return Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
    };
    stream
        .play()
        .map_err(|e| AudioError::PlayStream(e.to_string()))?;

    tracing::info!(
        device = %device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "capture started"
    );

    Ok((
        DeviceStream {
            _stream: stream,
            sample_rate,
            channels,
        },
        CaptureReader::new(consumer, error, dropped, DEVICE_TIMEOUT),
    ))
}

fn build_capture<T: SizedSample + 'static>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: HeapProd<f32>,
    error: ErrorSlot,
    dropped: Arc<AtomicUsize>,
    convert: fn(T) -> f32,
) -> Result<Stream, AudioError> {
    let channels = config.channels.max(1) as usize;
    let gain = 1.0 / channels as f32;

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                for frame in data.chunks(channels) {
                    let mono = frame.iter().map(|&s| convert(s)).sum::<f32>() * gain;
                    if producer.try_push(mono).is_err() {
                        dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            },
            error_callback(error, "capture"),
            None,
        )
        .map_err(|e| AudioError::BuildStream(e.to_string()))
}

impl SampleSource for CaptureReader {
    /// Block until a full block has been captured
    fn read_block(&mut self, block: &mut [f32]) -> Result<usize, AudioError> {
        let started = Instant::now();
        while self.consumer.occupied_len() < block.len() {
            take_error(&self.error)?;
            if started.elapsed() >= self.timeout {
                return Err(AudioError::CaptureTimeout(self.timeout.as_millis() as u64));
            }
            thread::sleep(POLL_INTERVAL);
        }

        let dropped = self.dropped.load(Ordering::Relaxed);
        if dropped != self.reported_dropped {
            tracing::warn!(
                dropped = dropped - self.reported_dropped,
                "capture overrun, samples dropped"
            );
            self.reported_dropped = dropped;
        }

        Ok(self.consumer.pop_slice(block))
    }
}

/// Mono samples to the default output device
pub struct PlaybackWriter {
    producer: HeapProd<f32>,
    error: ErrorSlot,
    /// Longest wait for room in the ring
    timeout: Duration,
}

impl PlaybackWriter {
    fn new(producer: HeapProd<f32>, error: ErrorSlot, timeout: Duration) -> Self {
        Self {
            producer,
            error,
            timeout,
        }
    }
}

/// Open the default output device at `sample_rate`; mono is copied to every channel
pub fn open_playback(
    sample_rate: u32,
    block_size: usize,
) -> Result<(DeviceStream, PlaybackWriter), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(AudioError::NoDevice("output"))?;
    let default_config = device
        .default_output_config()
        .map_err(|e| AudioError::BuildStream(e.to_string()))?;

    let channels = default_config.channels();
    let config = stream_config(channels, sample_rate);
    let (mut producer, consumer) =
        HeapRb::<f32>::new(ring_capacity(sample_rate, block_size)).split();
    let error: ErrorSlot = Arc::new(Mutex::new(None));

    // Prime with silence so the first callbacks don't underrun
    let silence = vec![0.0f32; block_size * PLAYBACK_PRIME_BLOCKS];
    producer.push_slice(&silence);

    let stream = match default_config.sample_format() {
        SampleFormat::F32 => {
            build_playback::<f32>(&device, &config, consumer, error.clone(), |s| s)?
        }
        SampleFormat::I16 => {
            build_playback::<i16>(&device, &config, consumer, error.clone(), f32_to_i16)?
        }
        other => return Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
    };
    stream
        .play()
        .map_err(|e| AudioError::PlayStream(e.to_string()))?;

    tracing::info!(
        device = %device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "playback started"
    );

    Ok((
        DeviceStream {
            _stream: stream,
            sample_rate,
            channels,
        },
        PlaybackWriter::new(producer, error, DEVICE_TIMEOUT),
    ))
}

fn build_playback<T: SizedSample + 'static>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut consumer: HeapCons<f32>,
    error: ErrorSlot,
    convert: fn(f32) -> T,
) -> Result<Stream, AudioError> {
    let channels = config.channels.max(1) as usize;

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    // Underrun plays silence
                    let sample = consumer.try_pop().unwrap_or(0.0);
                    frame.fill(convert(sample));
                }
            },
            error_callback(error, "playback"),
            None,
        )
        .map_err(|e| AudioError::BuildStream(e.to_string()))
}

impl SampleSink for PlaybackWriter {
    /// Queue a block, waiting while the device drains a full ring
    fn write_block(&mut self, block: &[f32]) -> Result<(), AudioError> {
        let started = Instant::now();
        let mut written = 0;
        loop {
            take_error(&self.error)?;
            written += self.producer.push_slice(&block[written..]);
            if written == block.len() {
                return Ok(());
            }
            if started.elapsed() >= self.timeout {
                return Err(AudioError::PlaybackTimeout(self.timeout.as_millis() as u64));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Wait for queued samples to play out
    fn finish(&mut self) -> Result<(), AudioError> {
        let started = Instant::now();
        while self.producer.occupied_len() > 0 && started.elapsed() < self.timeout {
            take_error(&self.error)?;
            thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT_TIMEOUT: Duration = Duration::from_millis(20);

    #[test]
    fn test_ring_capacity() {
        assert_eq!(ring_capacity(44100, 256), 22050);
        assert_eq!(ring_capacity(8000, 4096), 32768);
    }

    #[test]
    fn test_take_error_clears_slot() {
        let slot: ErrorSlot = Arc::new(Mutex::new(Some("gone".into())));
        assert!(matches!(take_error(&slot), Err(AudioError::Stream(ref e)) if e == "gone"));
        assert!(take_error(&slot).is_ok());
    }

    #[test]
    fn test_capture_reader_drains_ring() {
        let (mut producer, consumer) = HeapRb::<f32>::new(16).split();
        let mut reader = CaptureReader::new(
            consumer,
            Arc::new(Mutex::new(None)),
            Arc::new(AtomicUsize::new(3)),
            SHORT_TIMEOUT,
        );
        producer.push_slice(&[0.1, 0.2, 0.3, 0.4]);

        let mut block = [0.0f32; 4];
        assert_eq!(reader.read_block(&mut block).unwrap(), 4);
        assert_eq!(block, [0.1, 0.2, 0.3, 0.4]);
        assert_eq!(reader.reported_dropped, 3);
    }

    #[test]
    fn test_capture_reader_reports_stream_error() {
        let (_producer, consumer) = HeapRb::<f32>::new(16).split();
        let mut reader = CaptureReader::new(
            consumer,
            Arc::new(Mutex::new(Some("device lost".into()))),
            Arc::new(AtomicUsize::new(0)),
            SHORT_TIMEOUT,
        );

        let mut block = [0.0f32; 4];
        assert!(matches!(
            reader.read_block(&mut block),
            Err(AudioError::Stream(_))
        ));
    }

    #[test]
    fn test_playback_writer_queues_block() {
        let (producer, mut consumer) = HeapRb::<f32>::new(16).split();
        let mut writer = PlaybackWriter::new(producer, Arc::new(Mutex::new(None)), SHORT_TIMEOUT);

        writer.write_block(&[0.5, -0.5, 0.25]).unwrap();
        let mut out = [0.0f32; 3];
        assert_eq!(consumer.pop_slice(&mut out), 3);
        assert_eq!(out, [0.5, -0.5, 0.25]);
    }

    #[test]
    fn test_capture_reader_times_out_without_data() {
        let (mut producer, consumer) = HeapRb::<f32>::new(16).split();
        let mut reader = CaptureReader::new(
            consumer,
            Arc::new(Mutex::new(None)),
            Arc::new(AtomicUsize::new(0)),
            SHORT_TIMEOUT,
        );
        // Less than a block ever arrives
        producer.push_slice(&[0.1, 0.2]);

        let started = Instant::now();
        let mut block = [0.0f32; 4];
        assert!(matches!(
            reader.read_block(&mut block),
            Err(AudioError::CaptureTimeout(20))
        ));
        assert!(started.elapsed() >= SHORT_TIMEOUT);
    }

    #[test]
    fn test_playback_writer_times_out_on_full_ring() {
        let (producer, _consumer) = HeapRb::<f32>::new(4).split();
        let mut writer = PlaybackWriter::new(producer, Arc::new(Mutex::new(None)), SHORT_TIMEOUT);

        // Nothing drains the ring, so the second half never fits
        assert!(matches!(
            writer.write_block(&[0.0; 8]),
            Err(AudioError::PlaybackTimeout(20))
        ));
    }

    #[test]
    fn test_playback_writer_reports_stream_error() {
        let (producer, _consumer) = HeapRb::<f32>::new(16).split();
        let mut writer = PlaybackWriter::new(
            producer,
            Arc::new(Mutex::new(Some("device lost".into()))),
            SHORT_TIMEOUT,
        );

        assert!(matches!(
            writer.write_block(&[0.5]),
            Err(AudioError::Stream(_))
        ));
    }
}
