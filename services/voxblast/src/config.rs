//! Application Configuration Module
//!
//! Centralizes the configuration for the voxblast service. Settings come
//! from environment variables (and a `.env` file when present) and end up
//! in one struct that main hands to the components it builds.

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;
use voxblast_core::SessionConfig;
use voxblast_core::collaborators::VoiceParams;
use voxblast_core::matcher::MatchThresholds;

// --- Application Constants ---

/// The size of each audio chunk for the audio output stream.
pub const OUTPUT_CHUNK_SIZE: usize = 1024;
pub const DEFAULT_TTS_MODEL: &str = "gpt-4o-mini-tts";
pub const DEFAULT_TTS_VOICE: &str = "alloy";

/// Holds all configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub openai_api_key: String,
    pub tts_model: String,
    pub tts_voice: String,
    pub round_seconds: Option<u64>,
    pub max_attempts: Option<u32>,
    pub match_threshold: Option<f64>,
    /// Raw PCM16 mono at 24 kHz, played as the beam fires.
    pub cue_sound_path: Option<PathBuf>,
    pub output_device: Option<String>,
    pub log_level: Level,
}

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
    #[error("Invalid log level provided for RUST_LOG: {0}")]
    InvalidLogLevel(String),
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// *   `OPENAI_API_KEY`: Secret key for the OpenAI speech endpoint. Required.
    /// *   `TTS_MODEL`: (Optional) Speech model. Defaults to "gpt-4o-mini-tts".
    /// *   `TTS_VOICE`: (Optional) Voice name. Defaults to "alloy".
    /// *   `ROUND_SECONDS`, `MAX_ATTEMPTS`, `MATCH_THRESHOLD`: (Optional) session tuning.
    /// *   `CUE_SOUND_PATH`: (Optional) raw PCM16 file for the hit cue.
    /// *   `OUTPUT_DEVICE`: (Optional) output device name. Defaults to the host default.
    /// *   `RUST_LOG`: (Optional) The logging level. Defaults to "INFO".
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file. This is useful for local development and is ignored if not present.
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let openai_api_key = lookup("OPENAI_API_KEY")
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))?;

        let tts_model = lookup("TTS_MODEL").unwrap_or_else(|| DEFAULT_TTS_MODEL.to_string());
        let tts_voice = lookup("TTS_VOICE").unwrap_or_else(|| DEFAULT_TTS_VOICE.to_string());

        let round_seconds = parse_optional::<u64>(&lookup, "ROUND_SECONDS")?;
        if round_seconds == Some(0) {
            return Err(ConfigError::InvalidValue(
                "ROUND_SECONDS".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let max_attempts = parse_optional::<u32>(&lookup, "MAX_ATTEMPTS")?;
        let match_threshold = parse_optional::<f64>(&lookup, "MATCH_THRESHOLD")?;
        if let Some(threshold) = match_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(ConfigError::InvalidValue(
                    "MATCH_THRESHOLD".to_string(),
                    format!("{} is outside 0.0..=1.0", threshold),
                ));
            }
        }

        let cue_sound_path = lookup("CUE_SOUND_PATH").map(PathBuf::from);
        let output_device = lookup("OUTPUT_DEVICE");

        // Configure logging level from RUST_LOG, with a sensible default.
        let log_level_str = lookup("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str
            .parse::<Level>()
            .map_err(|_| ConfigError::InvalidLogLevel(log_level_str))?;

        Ok(Self {
            openai_api_key,
            tts_model,
            tts_voice,
            round_seconds,
            max_attempts,
            match_threshold,
            cue_sound_path,
            output_device,
            log_level,
        })
    }

    /// Session tuning with any environment overrides applied.
    pub fn session_config(&self) -> SessionConfig {
        let mut builder = SessionConfig::builder().with_voice(VoiceParams {
            voice: self.tts_voice.clone(),
            ..VoiceParams::default()
        });
        if let Some(seconds) = self.round_seconds {
            builder = builder.with_round_duration(Duration::from_secs(seconds));
        }
        if let Some(max_attempts) = self.max_attempts {
            builder = builder.with_max_attempts(max_attempts);
        }
        if let Some(threshold) = self.match_threshold {
            builder = builder.with_thresholds(MatchThresholds {
                similarity: threshold,
                jaccard: threshold,
            });
        }
        builder.build()
    }
}

fn parse_optional<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string()))
        })
        .transpose()
}
