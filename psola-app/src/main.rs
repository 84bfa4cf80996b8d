//! PSOLA - real-time pitch shifter
//!
//! Shifts the pitch of a live input stream or an audio file while keeping
//! its timing, and prints pitch estimates of audio files.

use std::io::{self, BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use tracing_subscriber::EnvFilter;

use psola_analysis::{is_voiced, DetectorConfig, PitchDetector};
use psola_audio::{
    open_capture, open_playback, run_pipeline, AudioEngine, AudioEvent, BufferSink, BufferSource,
    EngineConfig, EngineState, PitchScale, MAX_SCALE, MIN_SCALE,
};
use psola_library::{write_wav_mono, AudioFileLoader, Config};

/// How often the live loop wakes to drain engine events
const CONTROL_POLL: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(name = "psola", version, about = "Real-time PSOLA pitch shifter")]
struct Cli {
    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct StreamArgs {
    /// Processing sample rate in Hz
    #[arg(long)]
    sample_rate: Option<u32>,
    /// Samples per processing block
    #[arg(long)]
    block_size: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Shift the default input device to the default output device
    Live {
        #[command(flatten)]
        stream: StreamArgs,
        /// Initial pitch scale (2.0 is an octave up)
        #[arg(long)]
        scale: Option<f64>,
    },
    /// Shift an audio file into a 16-bit mono WAV file
    File {
        input: PathBuf,
        output: PathBuf,
        /// Pitch scale (2.0 is an octave up)
        #[arg(long)]
        scale: Option<f64>,
        #[command(flatten)]
        stream: StreamArgs,
    },
    /// Print one pitch estimate per analysis window of an audio file
    Detect {
        input: PathBuf,
        /// Analysis sample rate in Hz
        #[arg(long)]
        sample_rate: Option<u32>,
    },
}

/// Commands read from stdin while running live
#[derive(Debug, Clone, Copy, PartialEq)]
enum ControlCommand {
    SetScale(f64),
    Quit,
}

fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => Config::load(),
    };
    let config_path = cli.config.clone().unwrap_or_else(Config::config_path);

    match cli.command {
        Commands::Live { stream, scale } => {
            let engine = engine_config(&config, &stream);
            let initial = scale.unwrap_or(config.pitch_scale);
            let last_scale = run_live(engine, initial)?;

            // Best effort, don't fail on config save error
            if let Err(e) = save_last_scale(&config, &config_path, last_scale) {
                tracing::warn!(path = %config_path.display(), error = %e, "could not save config");
            }
            Ok(())
        }
        Commands::File {
            input,
            output,
            scale,
            stream,
        } => run_file(
            &input,
            &output,
            engine_config(&config, &stream),
            scale.unwrap_or(config.pitch_scale),
        ),
        Commands::Detect { input, sample_rate } => {
            let stream = StreamArgs {
                sample_rate,
                block_size: None,
            };
            run_detect(&input, engine_config(&config, &stream))
        }
    }
}

/// Logs go to stderr so `detect` output stays machine-readable
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// Command-line values override the config file
fn engine_config(config: &Config, stream: &StreamArgs) -> EngineConfig {
    let mut engine = EngineConfig::new(
        stream.sample_rate.unwrap_or(config.sample_rate),
        stream.block_size.unwrap_or(config.block_size),
    )
    .with_analysis_size(config.analysis_size);
    if let Some(ring_size) = config.ring_size {
        engine = engine.with_ring_size(ring_size);
    }
    engine
}

fn warn_if_inactive(scale: f64) {
    if !(scale > MIN_SCALE && scale <= MAX_SCALE) {
        tracing::warn!(
            scale,
            min = MIN_SCALE,
            max = MAX_SCALE,
            "scale outside the usable range, audio passes through unshifted"
        );
    }
}

/// Returns the scale in effect when the session ended
fn run_live(config: EngineConfig, scale: f64) -> Result<f64> {
    warn_if_inactive(scale);

    // Device streams stay on this thread; only their ring ends move
    let (_capture, reader) = open_capture(config.sample_rate, config.block_size)
        .context("opening input device")?;
    let (_playback, writer) = open_playback(config.sample_rate, config.block_size)
        .context("opening output device")?;

    let engine = AudioEngine::spawn(config, reader, writer, scale)
        .context("starting processing thread")?;
    let commands = spawn_control_thread();

    eprintln!("Type a pitch scale and press Enter (2.0 = octave up). q quits.");

    'running: loop {
        for event in engine.event_rx.try_iter() {
            match event {
                AudioEvent::Started { latency, .. } => {
                    tracing::info!(
                        latency_ms = latency as f64 * 1000.0 / config.sample_rate as f64,
                        "live shifting"
                    );
                }
                AudioEvent::Progress(stats) => {
                    tracing::debug!(
                        samples = stats.samples,
                        voiced = stats.voiced_fraction(),
                        "progress"
                    );
                }
                AudioEvent::Stopped(_) | AudioEvent::Error(_) => break 'running,
            }
        }

        match commands.recv_timeout(CONTROL_POLL) {
            Ok(ControlCommand::SetScale(scale)) => {
                warn_if_inactive(scale);
                engine.set_pitch_scale(scale);
                tracing::info!(scale, "pitch scale set");
            }
            Ok(ControlCommand::Quit) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        if !engine.is_running() {
            break;
        }
    }

    let last_scale = engine.pitch_scale();
    engine.stop();
    let stats = engine.join().context("live processing failed")?;
    tracing::info!(seconds = stats.samples as f64 / config.sample_rate as f64, "done");
    Ok(last_scale)
}

/// Remember the last live scale for the next session
fn save_last_scale(config: &Config, path: &Path, scale: f64) -> io::Result<()> {
    if scale == config.pitch_scale {
        return Ok(());
    }
    let updated = Config {
        pitch_scale: scale,
        ..config.clone()
    };
    updated.save_to(path)
}

/// Read control lines from stdin. The channel closes on EOF or `q`.
fn spawn_control_thread() -> Receiver<ControlCommand> {
    let (tx, rx) = bounded(16);
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            match parse_control(&line) {
                Some(ControlCommand::Quit) => {
                    let _ = tx.send(ControlCommand::Quit);
                    break;
                }
                Some(command) => {
                    if tx.send(command).is_err() {
                        break;
                    }
                }
                None if line.trim().is_empty() => {}
                None => tracing::warn!(input = line.trim(), "expected a number or q"),
            }
        }
    });
    rx
}

fn parse_control(line: &str) -> Option<ControlCommand> {
    let line = line.trim();
    if line.eq_ignore_ascii_case("q") || line.eq_ignore_ascii_case("quit") {
        return Some(ControlCommand::Quit);
    }
    line.parse::<f64>()
        .ok()
        .filter(|s| s.is_finite())
        .map(ControlCommand::SetScale)
}

fn run_file(input: &Path, output: &Path, config: EngineConfig, scale: f64) -> Result<()> {
    warn_if_inactive(scale);

    let loaded = AudioFileLoader::with_sample_rate(config.sample_rate)
        .load(input)
        .with_context(|| format!("loading {}", input.display()))?;

    let mut state = EngineState::new(&config)?;
    let latency = state.latency();

    // Flush the tail through the shifter delay
    let len = loaded.samples.len();
    let mut samples = loaded.samples;
    samples.resize(len + latency, 0.0);

    let mut source = BufferSource::new(samples);
    let mut sink = BufferSink::with_capacity(len + latency);
    let stats = run_pipeline(
        &mut source,
        &mut sink,
        &mut state,
        &PitchScale::new(scale),
        &AtomicBool::new(false),
        config.block_size,
        |stats| tracing::debug!(samples = stats.samples, "progress"),
    )?;

    let shifted = sink.into_samples();
    let aligned = &shifted[latency.min(shifted.len())..];
    write_wav_mono(output, aligned, config.sample_rate)
        .with_context(|| format!("writing {}", output.display()))?;

    tracing::info!(
        input = %input.display(),
        output = %output.display(),
        scale,
        seconds = len as f64 / config.sample_rate as f64,
        voiced = stats.voiced_fraction(),
        "file shifted"
    );
    Ok(())
}

fn run_detect(input: &Path, config: EngineConfig) -> Result<()> {
    let loaded = AudioFileLoader::with_sample_rate(config.sample_rate)
        .load(input)
        .with_context(|| format!("loading {}", input.display()))?;

    let mut detector = PitchDetector::new(
        DetectorConfig::new(config.block_size, config.sample_rate)
            .with_analysis_size(config.analysis_size),
    )?;
    let window = detector.latency();
    let mut estimates = vec![0.0f32; window];

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for (i, chunk) in loaded.samples.chunks_exact(window).enumerate() {
        detector.detect_into(chunk, &mut estimates);
        let time_secs = (i * window) as f64 / config.sample_rate as f64;
        let pitch = detector.current_pitch();
        if is_voiced(pitch) {
            writeln!(out, "{:.3}\t{:.2}", time_secs, pitch)?;
        } else {
            writeln!(out, "{:.3}\t-1", time_secs)?;
        }
    }
    out.flush()?;
    Ok(())
}
