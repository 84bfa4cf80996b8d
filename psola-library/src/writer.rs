//! WAV output

use std::path::Path;

use psola_audio::f32_to_i16;
use thiserror::Error;

/// Errors that can occur while writing an audio file
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WAV encoding error: {0}")]
    Encode(#[from] hound::Error),
    #[error("Sample rate must be positive")]
    InvalidSampleRate,
}

/// Write mono samples as a 16-bit PCM WAV file.
///
/// Samples outside `[-1, 1]` are hard-clipped.
pub fn write_wav_mono(path: &Path, samples: &[f32], sample_rate: u32) -> Result<(), WriteError> {
    if sample_rate == 0 {
        return Err(WriteError::InvalidSampleRate);
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(path, spec)?;
    let mut clipped = 0usize;
    for &sample in samples {
        if sample.abs() > 1.0 {
            clipped += 1;
        }
        writer.write_sample(f32_to_i16(sample))?;
    }
    writer.finalize()?;

    if clipped > 0 {
        tracing::warn!(path = %path.display(), clipped, "samples clipped on write");
    }
    tracing::debug!(path = %path.display(), samples = samples.len(), sample_rate, "wrote wav");

    Ok(())
}
