//! File I/O for PSOLA - decoding, WAV output, and settings

mod config;
mod loader;
mod writer;

pub use config::Config;
pub use loader::{AudioFileLoader, LoadError, LoadedAudio};
pub use writer::{write_wav_mono, WriteError};
