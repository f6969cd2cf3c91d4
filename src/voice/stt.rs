//! Speech-to-text (STT)

use async_trait::async_trait;

use super::capture::pcm16_to_wav;
use crate::{Error, Result};

/// Outcome of one transcription attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transcript {
    /// Recognized text (never empty)
    Text(String),
    /// Audio held nothing recognizable
    NoMatch,
    /// The service could not be reached or refused the request
    Unavailable(String),
}

impl Transcript {
    /// Classify raw service output; blank text is a no-match
    #[must_use]
    pub fn from_text(text: &str) -> Self {
        let text = text.trim();
        if text.is_empty() {
            Self::NoMatch
        } else {
            Self::Text(text.to_string())
        }
    }

    /// The recognized text, if any
    #[must_use]
    pub fn into_text(self) -> Option<String> {
        match self {
            Self::Text(text) => Some(text),
            Self::NoMatch | Self::Unavailable(_) => None,
        }
    }
}

/// Turns captured PCM into text
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe 16-bit mono PCM sampled at `sample_rate`
    async fn transcribe(&self, pcm: &[u8], sample_rate: u32) -> Transcript;
}

/// STT provider backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SttProvider {
    /// `OpenAI` Whisper
    Whisper,
    /// Deepgram
    Deepgram,
}

impl std::str::FromStr for SttProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "whisper" | "openai" => Ok(Self::Whisper),
            "deepgram" => Ok(Self::Deepgram),
            other => Err(Error::Config(format!("unknown STT provider: {other}"))),
        }
    }
}

#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

#[derive(serde::Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(serde::Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

/// HTTP-backed transcription
pub struct HttpSpeechToText {
    client: reqwest::Client,
    api_key: String,
    model: String,
    provider: SttProvider,
}

impl HttpSpeechToText {
    /// Create a client for `provider`
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(provider: SttProvider, api_key: String, model: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(format!("API key required for {provider:?} STT")));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            provider,
        })
    }

    async fn request(&self, wav: Vec<u8>) -> Result<String> {
        match self.provider {
            SttProvider::Whisper => self.transcribe_whisper(wav).await,
            SttProvider::Deepgram => self.transcribe_deepgram(wav).await,
        }
    }

    async fn transcribe_whisper(&self, wav: Vec<u8>) -> Result<String> {
        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(wav)
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone());

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/transcriptions")
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Stt(format!("Whisper API error {status}: {body}")));
        }

        let result: WhisperResponse = response.json().await?;
        Ok(result.text)
    }

    async fn transcribe_deepgram(&self, wav: Vec<u8>) -> Result<String> {
        let url = format!(
            "https://api.deepgram.com/v1/listen?model={}&punctuate=true",
            self.model
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Token {}", self.api_key))
            .header("Content-Type", "audio/wav")
            .body(wav)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Stt(format!("Deepgram API error {status}: {body}")));
        }

        let result: DeepgramResponse = response.json().await?;
        Ok(result
            .results
            .channels
            .into_iter()
            .next()
            .and_then(|c| c.alternatives.into_iter().next())
            .map(|a| a.transcript)
            .unwrap_or_default())
    }
}

#[async_trait]
impl SpeechToText for HttpSpeechToText {
    async fn transcribe(&self, pcm: &[u8], sample_rate: u32) -> Transcript {
        let wav = match pcm16_to_wav(pcm, sample_rate) {
            Ok(wav) => wav,
            Err(e) => return Transcript::Unavailable(e.to_string()),
        };

        tracing::debug!(
            provider = ?self.provider,
            audio_bytes = wav.len(),
            "starting transcription"
        );

        match self.request(wav).await {
            Ok(text) => {
                let transcript = Transcript::from_text(&text);
                tracing::info!(transcript = ?transcript, "transcription complete");
                transcript
            }
            Err(e) => {
                tracing::warn!(provider = ?self.provider, error = %e, "transcription failed");
                Transcript::Unavailable(e.to_string())
            }
        }
    }
}
