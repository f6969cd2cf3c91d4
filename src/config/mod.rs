//! Configuration management for duet
//!
//! Layers, lowest to highest: built-in defaults, the TOML file, environment
//! variables, then CLI flags (applied by the binary before [`Config::validate`]).

pub mod file;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::frontend::twitch::TwitchSettings;
use crate::history::ConversationHistory;
use crate::responder::{ChatCompletionResponder, Persona, ResponderService};
use crate::signal::SignalChannel;
use crate::turn::TurnPipeline;
use crate::voice::{
    AudioSegmenter, HttpSpeechToText, HttpSynthesizer, SpeechSynthesizer, SpeechToText,
    SttProvider, SynthesizerSettings, TtsProvider, VadConfig, WebRtcClassifier,
};
use crate::{Error, Result};

use self::file::DuetConfigFile;

/// Default responder endpoint (DeepSeek, `OpenAI`-compatible)
pub const DEFAULT_RESPONDER_URL: &str = "https://api.deepseek.com/v1/chat/completions";

/// Default responder model
pub const DEFAULT_RESPONDER_MODEL: &str = "deepseek-chat";

/// Default `OpenAI` TTS voice
pub const DEFAULT_OPENAI_VOICE: &str = "nova";

/// Default `ElevenLabs` voice id ("Rachel")
pub const DEFAULT_ELEVENLABS_VOICE: &str = "21m00Tcm4TlvDq8ikWAM";

/// Default Twitch chat log
pub const DEFAULT_CHAT_LOG: &str = "chat_log.txt";

/// History lines given to the responder by default
pub const DEFAULT_MEMORY_LIMIT: usize = 5;

/// duet configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Handshake records
    pub signals: SignalsConfig,

    /// Utterance segmentation
    pub segmenter: SegmenterConfig,

    /// Reply generation
    pub responder: ResponderConfig,

    /// STT and TTS providers
    pub speech: SpeechConfig,

    /// History file, if history is persisted
    pub history_path: Option<PathBuf>,

    /// Interval between platform buffer scans in the front-end
    pub platform_scan_interval: Duration,

    /// Twitch chat relay
    pub twitch: TwitchConfig,

    /// API keys (environment only)
    pub api_keys: ApiKeys,
}

/// Handshake record settings
#[derive(Debug, Clone)]
pub struct SignalsConfig {
    /// Directory shared by orchestrator and front-end
    pub dir: PathBuf,
    /// How often waiters re-check a record
    pub poll_interval: Duration,
    /// How long the orchestrator waits for each handshake record
    pub handshake_timeout: Duration,
}

/// Segmentation settings
#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    /// Frame geometry and VAD strictness for the local microphone
    pub vad: VadConfig,
    /// Silence that ends an utterance
    pub silence_timeout: Duration,
    /// Interval between buffer scans
    pub scan_interval: Duration,
}

/// Responder settings
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    /// Chat-completions endpoint
    pub api_url: String,
    /// Model id
    pub model: String,
    /// Who the companion is
    pub persona: Persona,
    /// History lines given to the responder
    pub memory_limit: usize,
}

/// Speech provider settings
#[derive(Debug, Clone)]
pub struct SpeechConfig {
    /// STT backend
    pub stt_provider: SttProvider,
    /// STT model id
    pub stt_model: String,
    /// TTS backend
    pub tts_provider: TtsProvider,
    /// TTS model id
    pub tts_model: String,
    /// TTS voice for `OpenAI` and `ElevenLabs`
    pub tts_voice: String,
    /// TTS speed multiplier
    pub tts_speed: f32,
    /// Azure region
    pub azure_region: String,
    /// Azure neural voice
    pub azure_voice: String,
    /// Azure prosody pitch
    pub azure_pitch: String,
}

/// Twitch chat relay settings
#[derive(Debug, Clone)]
pub struct TwitchConfig {
    /// Bot account name
    pub nick: String,
    /// Channel to join
    pub channel: String,
    /// File every chat message is appended to
    pub chat_log: PathBuf,
}

/// API keys for external services
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// `OpenAI` API key (Whisper and TTS)
    pub openai: Option<String>,
    /// Responder API key (`RESPONDER_API_KEY`, else `DEEPSEEK_API_KEY`)
    pub responder: Option<String>,
    /// `Deepgram` API key
    pub deepgram: Option<String>,
    /// `ElevenLabs` API key
    pub elevenlabs: Option<String>,
    /// Azure speech key
    pub azure_tts: Option<String>,
    /// Discord bot token
    pub discord: Option<String>,
    /// Twitch chat OAuth token
    pub twitch: Option<String>,
}

/// Default signal directory: `~/.local/share/duet/signals` on Linux
fn default_signal_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".duet/signals"),
        |d| d.data_local_dir().join("duet").join("signals"),
    )
}

fn parse_provider<T: std::str::FromStr<Err = Error>>(raw: Option<String>, default: T) -> Result<T> {
    raw.map_or(Ok(default), |s| s.parse())
}

fn secs_f64(secs: f64, what: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| Error::Config(format!("{what} must be a non-negative number of seconds")))
}

impl Config {
    /// Load from the standard config file (or `path`) and the process environment
    ///
    /// # Errors
    ///
    /// Returns error if an explicitly given file cannot be loaded or a value
    /// is invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = match path {
            Some(path) => file::load_config_from(path)?,
            None => file::load_config_file(),
        };
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Merge a parsed file with environment lookups
    ///
    /// # Errors
    ///
    /// Returns error if a provider name or duration is invalid
    pub fn from_sources(fc: DuetConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env_parse = |key: &str| env(key).and_then(|v| v.parse::<u64>().ok());

        // Signals (env > toml > default)
        let signals = SignalsConfig {
            dir: env("DUET_SIGNAL_DIR")
                .map(PathBuf::from)
                .or(fc.signals.dir)
                .unwrap_or_else(default_signal_dir),
            poll_interval: Duration::from_millis(fc.signals.poll_interval_ms.unwrap_or(500)),
            handshake_timeout: Duration::from_secs(
                env_parse("DUET_HANDSHAKE_TIMEOUT_SECS")
                    .or(fc.signals.handshake_timeout_secs)
                    .unwrap_or(60),
            ),
        };

        let defaults = VadConfig::default();
        let segmenter = SegmenterConfig {
            vad: VadConfig {
                sample_rate: fc.segmenter.sample_rate.unwrap_or(defaults.sample_rate),
                frame_ms: fc.segmenter.frame_ms.unwrap_or(defaults.frame_ms),
                aggressiveness: fc.segmenter.aggressiveness.unwrap_or(defaults.aggressiveness),
            },
            silence_timeout: secs_f64(
                fc.segmenter.silence_timeout_secs.unwrap_or(5.0),
                "silence_timeout_secs",
            )?,
            scan_interval: Duration::from_millis(fc.segmenter.scan_interval_ms.unwrap_or(1000)),
        };

        // Responder (env > toml > default)
        let persona_defaults = Persona::default();
        let responder = ResponderConfig {
            api_url: env("DUET_RESPONDER_URL")
                .or(fc.responder.api_url)
                .unwrap_or_else(|| DEFAULT_RESPONDER_URL.to_string()),
            model: env("DUET_RESPONDER_MODEL")
                .or(fc.responder.model)
                .unwrap_or_else(|| DEFAULT_RESPONDER_MODEL.to_string()),
            persona: Persona {
                name: env("DUET_PERSONA")
                    .or(fc.responder.persona_name)
                    .unwrap_or(persona_defaults.name),
                description: fc
                    .responder
                    .persona_description
                    .unwrap_or(persona_defaults.description),
            },
            memory_limit: fc.responder.memory_limit.unwrap_or(DEFAULT_MEMORY_LIMIT),
        };

        // Speech (env > toml > default)
        let stt_provider = parse_provider(
            env("DUET_STT_PROVIDER").or(fc.speech.stt_provider),
            SttProvider::Whisper,
        )?;
        let tts_provider = parse_provider(
            env("DUET_TTS_PROVIDER").or(fc.speech.tts_provider),
            TtsProvider::OpenAI,
        )?;
        let speech = SpeechConfig {
            stt_provider,
            stt_model: fc.speech.stt_model.unwrap_or_else(|| {
                match stt_provider {
                    SttProvider::Whisper => "whisper-1",
                    SttProvider::Deepgram => "nova-2",
                }
                .to_string()
            }),
            tts_provider,
            tts_model: fc.speech.tts_model.unwrap_or_else(|| {
                match tts_provider {
                    TtsProvider::ElevenLabs => "eleven_monolingual_v1",
                    TtsProvider::OpenAI | TtsProvider::Azure => "tts-1",
                }
                .to_string()
            }),
            tts_voice: env("DUET_TTS_VOICE")
                .or(fc.speech.tts_voice)
                .unwrap_or_else(|| {
                    match tts_provider {
                        TtsProvider::ElevenLabs => DEFAULT_ELEVENLABS_VOICE,
                        TtsProvider::OpenAI | TtsProvider::Azure => DEFAULT_OPENAI_VOICE,
                    }
                    .to_string()
                }),
            tts_speed: fc.speech.tts_speed.unwrap_or(1.0),
            azure_region: env("AZURE_TTS_REGION")
                .or(fc.speech.azure_region)
                .unwrap_or_default(),
            azure_voice: fc
                .speech
                .azure_voice
                .unwrap_or_else(|| "en-US-AnaNeural".to_string()),
            azure_pitch: fc.speech.azure_pitch.unwrap_or_else(|| "+9.5%".to_string()),
        };

        let twitch = TwitchConfig {
            nick: env("TWITCH_NICK")
                .or(fc.twitch.nick)
                .unwrap_or_else(|| responder.persona.name.to_lowercase()),
            channel: env("TWITCH_CHANNEL").or(fc.twitch.channel).unwrap_or_default(),
            chat_log: fc
                .twitch
                .chat_log
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CHAT_LOG)),
        };

        let history_path = env("DUET_HISTORY_PATH")
            .map(PathBuf::from)
            .or(fc.history.path);

        // Secrets: environment only
        let api_keys = ApiKeys {
            openai: env("OPENAI_API_KEY"),
            responder: env("RESPONDER_API_KEY").or_else(|| env("DEEPSEEK_API_KEY")),
            deepgram: env("DEEPGRAM_API_KEY"),
            elevenlabs: env("ELEVENLABS_API_KEY"),
            azure_tts: env("AZURE_TTS_KEY"),
            discord: env("DISCORD_TOKEN"),
            twitch: env("TWITCH_TOKEN"),
        };

        let config = Self {
            signals,
            segmenter,
            responder,
            speech,
            history_path,
            platform_scan_interval: Duration::from_millis(
                fc.discord.scan_interval_ms.unwrap_or(1000),
            ),
            twitch,
            api_keys,
        };

        tracing::debug!(
            signal_dir = %config.signals.dir.display(),
            stt = ?config.speech.stt_provider,
            tts = ?config.speech.tts_provider,
            model = %config.responder.model,
            "configuration loaded"
        );

        Ok(config)
    }

    /// Check values that would otherwise fail deep inside a session
    ///
    /// # Errors
    ///
    /// Returns error describing the first invalid value
    pub fn validate(&self) -> Result<()> {
        self.segmenter.vad.validate()?;

        let durations = [
            ("signals.poll_interval_ms", self.signals.poll_interval),
            ("signals.handshake_timeout_secs", self.signals.handshake_timeout),
            ("segmenter.silence_timeout_secs", self.segmenter.silence_timeout),
            ("segmenter.scan_interval_ms", self.segmenter.scan_interval),
            ("discord.scan_interval_ms", self.platform_scan_interval),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::Config(format!("{name} must be greater than zero")));
        }

        if self.responder.memory_limit == 0 {
            return Err(Error::Config(
                "responder.memory_limit must be greater than zero".to_string(),
            ));
        }

        if !(0.25..=4.0).contains(&self.speech.tts_speed) {
            return Err(Error::Config(format!(
                "speech.tts_speed must be between 0.25 and 4.0, got {}",
                self.speech.tts_speed
            )));
        }

        Ok(())
    }

    /// Open the handshake record directory
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created
    pub fn signal_channel(&self) -> Result<SignalChannel> {
        SignalChannel::open(self.signals.dir.clone(), self.signals.poll_interval)
    }

    /// Build a WebRTC-backed segmenter at `sample_rate`
    ///
    /// The front-end passes the platform's rate; the local loop passes the
    /// configured microphone rate.
    ///
    /// # Errors
    ///
    /// Returns error if the VAD rejects the frame geometry
    pub fn segmenter(&self, sample_rate: u32) -> Result<AudioSegmenter> {
        let vad = VadConfig {
            sample_rate,
            ..self.segmenter.vad
        };
        let classifier = WebRtcClassifier::new(vad)?;
        Ok(AudioSegmenter::new(
            Box::new(classifier),
            sample_rate,
            self.segmenter.silence_timeout,
        ))
    }

    /// Build the configured STT backend
    ///
    /// # Errors
    ///
    /// Returns error if the provider's API key is missing
    pub fn speech_to_text(&self) -> Result<Arc<dyn SpeechToText>> {
        let key = match self.speech.stt_provider {
            SttProvider::Whisper => self.api_keys.openai.clone(),
            SttProvider::Deepgram => self.api_keys.deepgram.clone(),
        };
        let stt = HttpSpeechToText::new(
            self.speech.stt_provider,
            key.unwrap_or_default(),
            self.speech.stt_model.clone(),
        )?;
        Ok(Arc::new(stt))
    }

    /// Build the configured TTS backend
    ///
    /// # Errors
    ///
    /// Returns error if the provider's API key (or Azure region) is missing
    pub fn synthesizer(&self) -> Result<Arc<dyn SpeechSynthesizer>> {
        let (api_key, voice) = match self.speech.tts_provider {
            TtsProvider::OpenAI => (self.api_keys.openai.clone(), &self.speech.tts_voice),
            TtsProvider::ElevenLabs => (self.api_keys.elevenlabs.clone(), &self.speech.tts_voice),
            TtsProvider::Azure => (self.api_keys.azure_tts.clone(), &self.speech.azure_voice),
        };
        let synth = HttpSynthesizer::new(SynthesizerSettings {
            provider: self.speech.tts_provider,
            api_key: api_key.unwrap_or_default(),
            voice: voice.clone(),
            model: self.speech.tts_model.clone(),
            speed: self.speech.tts_speed,
            region: self.speech.azure_region.clone(),
            pitch: self.speech.azure_pitch.clone(),
        })?;
        Ok(Arc::new(synth))
    }

    /// Build the chat-completions responder
    ///
    /// # Errors
    ///
    /// Returns error if the responder API key is missing
    pub fn responder(&self) -> Result<Arc<dyn ResponderService>> {
        let responder = ChatCompletionResponder::new(
            self.responder.api_url.clone(),
            self.api_keys.responder.clone().unwrap_or_default(),
            self.responder.model.clone(),
            self.responder.persona.clone(),
        )?;
        Ok(Arc::new(responder))
    }

    /// Login details for the Twitch relay
    #[must_use]
    pub fn twitch_settings(&self) -> TwitchSettings {
        TwitchSettings {
            nick: self.twitch.nick.clone(),
            token: self.api_keys.twitch.clone().unwrap_or_default(),
            channel: self.twitch.channel.clone(),
        }
    }

    /// Load persisted history, or start empty
    ///
    /// # Errors
    ///
    /// Returns error if the history file exists but is unreadable
    pub fn history(&self) -> Result<ConversationHistory> {
        match &self.history_path {
            Some(path) => ConversationHistory::load(path, self.responder.memory_limit),
            None => Ok(ConversationHistory::new(self.responder.memory_limit)),
        }
    }

    /// Assemble the turn pipeline from the configured collaborators
    ///
    /// # Errors
    ///
    /// Returns error if any collaborator cannot be built
    pub fn pipeline(&self) -> Result<TurnPipeline> {
        let pipeline = TurnPipeline::new(self.speech_to_text()?, self.responder()?, self.history()?);
        Ok(match &self.history_path {
            Some(path) => pipeline.with_history_path(path.clone()),
            None => pipeline,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_with(toml: &str, env: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = env
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_sources(file::parse_config(toml)?, |key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_are_valid() {
        let config = config_with("", &[]).unwrap();
        config.validate().unwrap();

        assert_eq!(config.signals.handshake_timeout, Duration::from_secs(60));
        assert_eq!(config.segmenter.silence_timeout, Duration::from_secs(5));
        assert_eq!(config.responder.memory_limit, DEFAULT_MEMORY_LIMIT);
        assert_eq!(config.responder.model, DEFAULT_RESPONDER_MODEL);
        assert_eq!(config.speech.stt_model, "whisper-1");
        assert!(config.history_path.is_none());
    }

    #[test]
    fn env_overrides_file() {
        let config = config_with(
            "[signals]\ndir = \"/from/file\"\n[responder]\nmodel = \"file-model\"",
            &[("DUET_SIGNAL_DIR", "/from/env"), ("DEEPSEEK_API_KEY", "ds")],
        )
        .unwrap();

        assert_eq!(config.signals.dir, PathBuf::from("/from/env"));
        assert_eq!(config.responder.model, "file-model");
        assert_eq!(config.api_keys.responder.as_deref(), Some("ds"));
    }

    #[test]
    fn responder_key_prefers_explicit_variable() {
        let config = config_with(
            "",
            &[("DEEPSEEK_API_KEY", "ds"), ("RESPONDER_API_KEY", "explicit")],
        )
        .unwrap();
        assert_eq!(config.api_keys.responder.as_deref(), Some("explicit"));
    }

    #[test]
    fn provider_defaults_follow_provider() {
        let config = config_with("[speech]\nstt_provider = \"deepgram\"\ntts_provider = \"elevenlabs\"", &[]).unwrap();
        assert_eq!(config.speech.stt_model, "nova-2");
        assert_eq!(config.speech.tts_model, "eleven_monolingual_v1");
        assert_eq!(config.speech.tts_voice, DEFAULT_ELEVENLABS_VOICE);

        let openai = config_with("", &[]).unwrap();
        assert_eq!(openai.speech.tts_voice, DEFAULT_OPENAI_VOICE);

        let chosen = config_with("[speech]\ntts_provider = \"elevenlabs\"\ntts_voice = \"custom\"", &[]).unwrap();
        assert_eq!(chosen.speech.tts_voice, "custom");
    }

    #[test]
    fn unknown_provider_is_rejected() {
        assert!(config_with("[speech]\ntts_provider = \"espeak\"", &[]).is_err());
    }

    #[test]
    fn validation_rejects_bad_values() {
        for toml in [
            "[segmenter]\naggressiveness = 4",
            "[segmenter]\nsample_rate = 44100",
            "[segmenter]\nframe_ms = 25",
            "[segmenter]\nsilence_timeout_secs = 0.0",
            "[signals]\nhandshake_timeout_secs = 0",
            "[responder]\nmemory_limit = 0",
        ] {
            let config = config_with(toml, &[]).unwrap();
            assert!(config.validate().is_err(), "{toml} should be rejected");
        }
    }

    #[test]
    fn negative_silence_timeout_fails_to_load() {
        assert!(config_with("[segmenter]\nsilence_timeout_secs = -1.0", &[]).is_err());
    }

    #[test]
    fn missing_keys_fail_builders() {
        let config = config_with("", &[]).unwrap();
        assert!(config.speech_to_text().is_err());
        assert!(config.synthesizer().is_err());
        assert!(config.responder().is_err());
    }

    #[test]
    fn twitch_settings_layer_env_over_file() {
        let config = config_with(
            "[twitch]\nnick = \"filebot\"\nchannel = \"stream\"",
            &[("TWITCH_TOKEN", "oauth:abc"), ("TWITCH_CHANNEL", "other")],
        )
        .unwrap();

        let settings = config.twitch_settings();
        assert_eq!(settings.nick, "filebot");
        assert_eq!(settings.channel, "other");
        assert_eq!(settings.token, "oauth:abc");
        assert_eq!(config.twitch.chat_log, PathBuf::from(DEFAULT_CHAT_LOG));
    }

    #[test]
    fn segmenter_uses_requested_rate() {
        let config = config_with("", &[]).unwrap();
        let segmenter = config.segmenter(48000).unwrap();
        assert_eq!(segmenter.sample_rate(), 48000);
    }
}
