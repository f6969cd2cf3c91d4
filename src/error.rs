//! Error types for duet

use std::time::Duration;

use thiserror::Error;

/// Result type alias for duet operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in duet
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device or encoding error
    #[error("audio error: {0}")]
    Audio(String),

    /// Voice activity detection error
    #[error("vad error: {0}")]
    Vad(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Language model responder error
    #[error("responder error: {0}")]
    Responder(String),

    /// Chat platform error
    #[error("channel error: {0}")]
    Channel(String),

    /// Signal record could not be written or read
    #[error("signal error: {0}")]
    Signal(String),

    /// The front-end never wrote a lifecycle record in time
    #[error("timed out after {waited:?} waiting for signal '{record}'")]
    HandshakeTimeout {
        /// Record that was awaited
        record: &'static str,
        /// How long the orchestrator waited
        waited: Duration,
    },

    /// The front-end process exited while the orchestrator depended on it
    #[error("front-end process exited unexpectedly (code {})", code.map_or_else(|| "none".to_string(), |c| c.to_string()))]
    FrontEndExited {
        /// Exit code, if the process exited normally
        code: Option<i32>,
    },

    /// The user interrupted the session (Ctrl-C)
    #[error("interrupted")]
    Interrupted,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Process exit code for a fatal error
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::HandshakeTimeout { .. } => 2,
            Self::FrontEndExited { .. } => 3,
            Self::Interrupted => 130,
            _ => 1,
        }
    }
}
