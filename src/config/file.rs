//! TOML configuration file loading
//!
//! Supports `~/.config/duet/config.toml` as a persistent config source. All
//! fields are optional; the file is a partial overlay on top of defaults.
//! Secrets are never read from the file.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DuetConfigFile {
    /// Handshake records
    #[serde(default)]
    pub signals: SignalsFileConfig,

    /// Utterance segmentation
    #[serde(default)]
    pub segmenter: SegmenterFileConfig,

    /// Reply generation
    #[serde(default)]
    pub responder: ResponderFileConfig,

    /// STT and TTS providers
    #[serde(default)]
    pub speech: SpeechFileConfig,

    /// Conversation history persistence
    #[serde(default)]
    pub history: HistoryFileConfig,

    /// Discord front-end (token comes from `DISCORD_TOKEN`)
    #[serde(default)]
    pub discord: DiscordFileConfig,

    /// Twitch chat relay (token comes from `TWITCH_TOKEN`)
    #[serde(default)]
    pub twitch: TwitchFileConfig,
}

/// `[signals]`
#[derive(Debug, Default, Deserialize)]
pub struct SignalsFileConfig {
    /// Directory holding the handshake records
    pub dir: Option<PathBuf>,
    /// How often waiters re-check a record
    pub poll_interval_ms: Option<u64>,
    /// How long the orchestrator waits for each handshake record
    pub handshake_timeout_secs: Option<u64>,
}

/// `[segmenter]`
#[derive(Debug, Default, Deserialize)]
pub struct SegmenterFileConfig {
    /// Local microphone sample rate
    pub sample_rate: Option<u32>,
    /// VAD frame duration
    pub frame_ms: Option<u32>,
    /// VAD strictness, 0-3
    pub aggressiveness: Option<u8>,
    /// Silence that ends an utterance
    pub silence_timeout_secs: Option<f64>,
    /// Interval between buffer scans
    pub scan_interval_ms: Option<u64>,
}

/// `[responder]`
#[derive(Debug, Default, Deserialize)]
pub struct ResponderFileConfig {
    /// Chat-completions endpoint
    pub api_url: Option<String>,
    /// Model id
    pub model: Option<String>,
    /// Name the companion answers to
    pub persona_name: Option<String>,
    /// One-line character description
    pub persona_description: Option<String>,
    /// History lines given to the responder
    pub memory_limit: Option<usize>,
}

/// `[speech]`
#[derive(Debug, Default, Deserialize)]
pub struct SpeechFileConfig {
    /// "whisper" or "deepgram"
    pub stt_provider: Option<String>,
    /// STT model id
    pub stt_model: Option<String>,
    /// "openai", "elevenlabs" or "azure"
    pub tts_provider: Option<String>,
    /// TTS model id
    pub tts_model: Option<String>,
    /// TTS voice for `OpenAI` and `ElevenLabs`
    pub tts_voice: Option<String>,
    /// TTS speed multiplier
    pub tts_speed: Option<f32>,
    /// Azure region, e.g. "eastus"
    pub azure_region: Option<String>,
    /// Azure neural voice name
    pub azure_voice: Option<String>,
    /// Azure prosody pitch
    pub azure_pitch: Option<String>,
}

/// `[history]`
#[derive(Debug, Default, Deserialize)]
pub struct HistoryFileConfig {
    /// JSON file conversation history is persisted to
    pub path: Option<PathBuf>,
}

/// `[discord]`
#[derive(Debug, Default, Deserialize)]
pub struct DiscordFileConfig {
    /// Interval between platform buffer scans
    pub scan_interval_ms: Option<u64>,
}

/// `[twitch]`
#[derive(Debug, Default, Deserialize)]
pub struct TwitchFileConfig {
    /// Bot account name
    pub nick: Option<String>,
    /// Channel to join
    pub channel: Option<String>,
    /// File every chat message is appended to
    pub chat_log: Option<PathBuf>,
}

/// Parse a config file's contents
///
/// # Errors
///
/// Returns error if the TOML is malformed or has unknown sections
pub fn parse_config(content: &str) -> Result<DuetConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Load an explicitly requested config file
///
/// # Errors
///
/// Returns error if the file cannot be read or parsed
pub fn load_config_from(path: &Path) -> Result<DuetConfigFile> {
    let content = std::fs::read_to_string(path)?;
    let config = parse_config(&content)?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Load the TOML config file from the standard path
///
/// Returns `DuetConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> DuetConfigFile {
    let Some(path) = config_file_path() else {
        return DuetConfigFile::default();
    };

    if !path.exists() {
        return DuetConfigFile::default();
    }

    match load_config_from(&path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            DuetConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/duet/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("duet").join("config.toml"))
}
