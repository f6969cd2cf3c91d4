//! Text-to-speech (TTS)
//!
//! Synthesis failures end at this boundary: [`SpeechSynthesizer::speak`]
//! logs them and reports a [`SpeechOutcome`] instead of an error.

use std::path::PathBuf;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use super::playback::AudioPlayback;
use crate::{Error, Result};

/// Shortest text sent to a synthesizer before padding
const MIN_TTS_CHARS: usize = 10;

/// Characters a synthesizer is allowed to see
static DISALLOWED_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^\w\s,.!?'\-]").expect("valid regex")
});

/// Digit runs, so numbers are read as numbers rather than merged with words
static DIGIT_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)").expect("valid regex"));

/// Where synthesized speech goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechDestination {
    /// Play on this machine's default output device
    LocalPlayback,
    /// Write the encoded clip to a file for someone else to play
    FileSink(PathBuf),
}

/// What happened to one `speak` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechOutcome {
    /// Played locally or written to the sink
    Delivered,
    /// Nothing left to say after text preparation
    Empty,
    /// Synthesis, playback or the write failed
    Failed(String),
}

impl SpeechOutcome {
    /// Whether audio reached its destination
    #[must_use]
    pub const fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Speaks text aloud
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize `text` and deliver it; never fails outward
    async fn speak(&self, text: &str, destination: &SpeechDestination) -> SpeechOutcome;
}

/// TTS provider backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TtsProvider {
    /// `OpenAI` speech endpoint
    OpenAI,
    /// `ElevenLabs`
    ElevenLabs,
    /// Azure Cognitive Services (SSML)
    Azure,
}

impl std::str::FromStr for TtsProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "elevenlabs" => Ok(Self::ElevenLabs),
            "azure" => Ok(Self::Azure),
            other => Err(Error::Config(format!("unknown TTS provider: {other}"))),
        }
    }
}

/// Provider settings for [`HttpSynthesizer`]
#[derive(Debug, Clone)]
pub struct SynthesizerSettings {
    /// Backend
    pub provider: TtsProvider,
    /// API key for the backend
    pub api_key: String,
    /// Voice name or id
    pub voice: String,
    /// Model id (unused by Azure)
    pub model: String,
    /// Speaking rate (`OpenAI` only)
    pub speed: f32,
    /// Azure region, e.g. `eastus`
    pub region: String,
    /// Azure prosody pitch, e.g. `+9.5%`
    pub pitch: String,
}

/// HTTP-backed synthesizer producing MP3
pub struct HttpSynthesizer {
    client: reqwest::Client,
    settings: SynthesizerSettings,
}

impl HttpSynthesizer {
    /// Create a synthesizer
    ///
    /// # Errors
    ///
    /// Returns error if the API key (or the Azure region) is missing
    pub fn new(settings: SynthesizerSettings) -> Result<Self> {
        if settings.api_key.is_empty() {
            return Err(Error::Config(format!(
                "API key required for {:?} TTS",
                settings.provider
            )));
        }
        if settings.provider == TtsProvider::Azure && settings.region.is_empty() {
            return Err(Error::Config("Azure TTS requires a region".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            settings,
        })
    }

    /// Synthesize already-prepared text to MP3 bytes
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the service rejects it
    pub async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let request = match self.settings.provider {
            TtsProvider::OpenAI => self.openai_request(text),
            TtsProvider::ElevenLabs => self.elevenlabs_request(text),
            TtsProvider::Azure => self.azure_request(text),
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!(
                "{:?} TTS error {status}: {body}",
                self.settings.provider
            )));
        }

        Ok(response.bytes().await?.to_vec())
    }

    fn openai_request(&self, text: &str) -> reqwest::RequestBuilder {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
        }

        self.client
            .post("https://api.openai.com/v1/audio/speech")
            .bearer_auth(&self.settings.api_key)
            .json(&TtsRequest {
                model: &self.settings.model,
                input: text,
                voice: &self.settings.voice,
                speed: self.settings.speed,
            })
    }

    fn elevenlabs_request(&self, text: &str) -> reqwest::RequestBuilder {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        self.client
            .post(format!(
                "https://api.elevenlabs.io/v1/text-to-speech/{}",
                self.settings.voice
            ))
            .header("xi-api-key", &self.settings.api_key)
            .json(&ElevenLabsRequest {
                text,
                model_id: &self.settings.model,
            })
    }

    fn azure_request(&self, text: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!(
                "https://{}.tts.speech.microsoft.com/cognitiveservices/v1",
                self.settings.region
            ))
            .header("Ocp-Apim-Subscription-Key", &self.settings.api_key)
            .header("Content-Type", "application/ssml+xml")
            .header("X-Microsoft-OutputFormat", "audio-24khz-96kbitrate-mono-mp3")
            .body(azure_ssml(&self.settings.voice, &self.settings.pitch, text))
    }

    async fn deliver(&self, text: &str, destination: &SpeechDestination) -> Result<()> {
        let mp3 = self.synthesize(text).await?;

        match destination {
            SpeechDestination::FileSink(path) => {
                tokio::fs::write(path, &mp3).await?;
                tracing::debug!(path = %path.display(), bytes = mp3.len(), "speech written");
            }
            SpeechDestination::LocalPlayback => {
                tokio::task::spawn_blocking(move || AudioPlayback::new()?.play_mp3(&mp3))
                    .await
                    .map_err(|e| Error::Audio(e.to_string()))??;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSynthesizer {
    async fn speak(&self, text: &str, destination: &SpeechDestination) -> SpeechOutcome {
        if DISALLOWED_CHARS.replace_all(text, "").trim().is_empty() {
            tracing::debug!("nothing to speak after cleanup");
            return SpeechOutcome::Empty;
        }
        let text = prepare_text(text);

        match self.deliver(&text, destination).await {
            Ok(()) => SpeechOutcome::Delivered,
            Err(e) => {
                tracing::warn!(provider = ?self.settings.provider, error = %e, "speech failed");
                SpeechOutcome::Failed(e.to_string())
            }
        }
    }
}

/// Normalize text for a synthesizer
///
/// Drops symbols the engines read aloud or choke on, collapses whitespace,
/// pads very short text so the engine produces audible output, and puts a
/// space after every digit run.
#[must_use]
pub fn prepare_text(text: &str) -> String {
    let cleaned = DISALLOWED_CHARS.replace_all(text, "");
    let mut text = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.chars().count() < MIN_TTS_CHARS {
        text.push_str(" ...");
    }
    DIGIT_RUN.replace_all(&text, "$1 ").into_owned()
}

/// SSML body for Azure
#[must_use]
pub fn azure_ssml(voice: &str, pitch: &str, text: &str) -> String {
    format!(
        "<speak version='1.0' xml:lang='en-US'><voice name='{voice}'>\
         <prosody pitch=\"{pitch}\" rate=\"1\">{}</prosody></voice></speak>",
        escape_xml(text)
    )
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
