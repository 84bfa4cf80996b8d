//! Audio file loading and decoding

use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;

/// Frames per resampler chunk
const RESAMPLE_CHUNK: usize = 1024;

/// Errors that can occur while loading an audio file
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("No audio track found in file")]
    NoAudioTrack,
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Resample error: {0}")]
    Resample(String),
}

/// A decoded file, downmixed to mono
#[derive(Debug, Clone)]
pub struct LoadedAudio {
    /// Mono samples (f32, normalized to -1.0 to 1.0)
    pub samples: Vec<f32>,
    /// Sample rate of `samples` in Hz
    pub sample_rate: u32,
    /// Sample rate stored in the file
    pub source_sample_rate: u32,
    /// Channel count stored in the file
    pub source_channels: u16,
}

impl LoadedAudio {
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Audio file loader using Symphonia
pub struct AudioFileLoader {
    target_sample_rate: u32,
}

impl Default for AudioFileLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioFileLoader {
    /// Create a loader with the default 44.1kHz sample rate
    pub fn new() -> Self {
        Self::with_sample_rate(44100)
    }

    /// Create a loader that resamples to `target_sample_rate`
    pub fn with_sample_rate(target_sample_rate: u32) -> Self {
        Self { target_sample_rate }
    }

    pub fn target_sample_rate(&self) -> u32 {
        self.target_sample_rate
    }

    /// Load, decode, downmix and resample an audio file
    pub fn load(&self, path: &Path) -> Result<LoadedAudio, LoadError> {
        let file = std::fs::File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        // Create hint from file extension
        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| LoadError::Decode(e.to_string()))?;

        let mut format = probed.format;

        // Find first audio track
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(LoadError::NoAudioTrack)?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();
        let source_sample_rate = codec_params.sample_rate.unwrap_or(44100);
        let mut channels = codec_params
            .channels
            .map(|c| c.count() as u16)
            .unwrap_or(1);

        let mut decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| LoadError::Decode(e.to_string()))?;

        let mut mono: Vec<f32> = Vec::new();
        let mut skipped_packets = 0usize;

        loop {
            let packet = match format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(SymphoniaError::ResetRequired) => break,
                Err(e) => return Err(LoadError::Decode(e.to_string())),
            };

            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(_)) => {
                    skipped_packets += 1;
                    continue;
                }
                Err(e) => return Err(LoadError::Decode(e.to_string())),
            };

            let spec = *decoded.spec();
            channels = spec.channels.count().max(1) as u16;

            let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
            sample_buf.copy_interleaved_ref(decoded);
            downmix_into(sample_buf.samples(), channels as usize, &mut mono);
        }

        if skipped_packets > 0 {
            tracing::warn!(path = %path.display(), skipped_packets, "skipped corrupt packets");
        }

        let samples = if source_sample_rate != self.target_sample_rate {
            resample_mono(&mono, source_sample_rate, self.target_sample_rate)?
        } else {
            mono
        };

        tracing::debug!(
            path = %path.display(),
            source_sample_rate,
            channels,
            samples = samples.len(),
            "loaded audio file"
        );

        Ok(LoadedAudio {
            samples,
            sample_rate: self.target_sample_rate,
            source_sample_rate,
            source_channels: channels,
        })
    }
}

/// Average interleaved frames into mono samples appended to `out`
fn downmix_into(interleaved: &[f32], channels: usize, out: &mut Vec<f32>) {
    if channels <= 1 {
        out.extend_from_slice(interleaved);
        return;
    }
    let gain = 1.0 / channels as f32;
    out.extend(
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() * gain),
    );
}

/// Resample mono audio from `source_rate` to `target_rate`
fn resample_mono(
    samples: &[f32],
    source_rate: u32,
    target_rate: u32,
) -> Result<Vec<f32>, LoadError> {
    use rubato::{FftFixedInOut, Resampler};

    if samples.is_empty() {
        return Ok(Vec::new());
    }

    let mut resampler =
        FftFixedInOut::<f32>::new(source_rate as usize, target_rate as usize, RESAMPLE_CHUNK, 1)
            .map_err(|e| LoadError::Resample(e.to_string()))?;

    let expected_len =
        (samples.len() as u64 * target_rate as u64 / source_rate as u64) as usize;
    let chunk_size = resampler.input_frames_next();
    let mut output = Vec::with_capacity(expected_len + chunk_size);

    let mut chunks = samples.chunks(chunk_size);
    for chunk in chunks.by_ref() {
        // Pad the trailing partial chunk with zeros
        let resampled = if chunk.len() == chunk_size {
            resampler.process(&[chunk], None)
        } else {
            let mut padded = chunk.to_vec();
            padded.resize(chunk_size, 0.0);
            resampler.process(&[padded.as_slice()], None)
        }
        .map_err(|e| LoadError::Resample(e.to_string()))?;

        if let Some(channel) = resampled.into_iter().next() {
            output.extend(channel);
        }
    }

    output.truncate(expected_len);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downmix_stereo() {
        let mut out = Vec::new();
        downmix_into(&[1.0, 0.0, 0.5, 0.5, -1.0, 1.0], 2, &mut out);
        assert_eq!(out, vec![0.5, 0.5, 0.0]);
    }

    #[test]
    fn test_downmix_mono_passthrough() {
        let mut out = vec![0.25];
        downmix_into(&[0.1, 0.2], 1, &mut out);
        assert_eq!(out, vec![0.25, 0.1, 0.2]);
    }

    #[test]
    fn test_resample_length() {
        let input = vec![0.0f32; 48000];
        let output = resample_mono(&input, 48000, 44100).unwrap();
        assert_eq!(output.len(), 44100);
    }

    #[test]
    fn test_resample_empty() {
        assert!(resample_mono(&[], 48000, 44100).unwrap().is_empty());
    }

    #[test]
    fn test_missing_file() {
        let loader = AudioFileLoader::new();
        let result = loader.load(Path::new("/definitely/not/here.wav"));
        assert!(matches!(result, Err(LoadError::Io(_))));
    }
}
