//! Simple configuration persistence for PSOLA
//!
//! Stores stream settings and the pitch scale the last live session ended with.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub sample_rate: u32,
    /// Samples per processing block
    pub block_size: usize,
    pub pitch_scale: f64,
    /// Pitch detector analysis window
    pub analysis_size: usize,
    /// Shifter ring length; `None` picks the default for the sample rate
    pub ring_size: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            block_size: 256,
            pitch_scale: 1.0,
            analysis_size: 2048,
            ring_size: None,
        }
    }
}

impl Config {
    /// Load config from the default location
    ///
    /// Returns default config if file doesn't exist or can't be parsed.
    pub fn load() -> Self {
        let path = Self::config_path();
        Self::load_from(&path).unwrap_or_default()
    }

    /// Load config from a specific path
    pub fn load_from(path: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    /// Save config to a specific path
    pub fn save_to(&self, path: &Path) -> io::Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = self.serialize();
        fs::write(path, content)
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("psola")
            .join("config.txt")
    }

    /// Parse config from simple key=value format
    fn parse(content: &str) -> Self {
        let mut config = Self::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            // Malformed values keep the default
            let parsed = match key {
                "sample_rate" => value
                    .parse::<u32>()
                    .ok()
                    .filter(|&v| v > 0)
                    .map(|v| config.sample_rate = v),
                "block_size" => value
                    .parse::<usize>()
                    .ok()
                    .filter(|&v| v > 0)
                    .map(|v| config.block_size = v),
                "pitch_scale" => value
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .map(|v| config.pitch_scale = v),
                "analysis_size" => value.parse::<usize>().ok().map(|v| config.analysis_size = v),
                "ring_size" => value.parse::<usize>().ok().map(|v| config.ring_size = Some(v)),
                _ => Some(()), // Ignore unknown keys
            };

            if parsed.is_none() {
                tracing::warn!(key, value, "ignoring malformed config value");
            }
        }

        config
    }

    /// Serialize config to simple key=value format
    fn serialize(&self) -> String {
        let mut lines = vec![
            "# PSOLA Configuration".to_string(),
            format!("sample_rate={}", self.sample_rate),
            format!("block_size={}", self.block_size),
            format!("pitch_scale={}", self.pitch_scale),
            format!("analysis_size={}", self.analysis_size),
        ];

        if let Some(ring_size) = self.ring_size {
            lines.push(format!("ring_size={}", ring_size));
        }

        lines.join("\n")
    }
}
