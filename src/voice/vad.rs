//! Frame-level voice activity classification
//!
//! Frames are 16-bit little-endian mono PCM of a fixed duration. The WebRTC
//! classifier only accepts 10, 20 or 30 ms frames at 8, 16, 32 or 48 kHz.

use webrtc_vad::{SampleRate, Vad, VadMode};

use crate::{Error, Result};

/// Sample rates accepted by the WebRTC classifier
pub const SUPPORTED_SAMPLE_RATES: [u32; 4] = [8000, 16000, 32000, 48000];

/// Frame durations accepted by the WebRTC classifier
pub const SUPPORTED_FRAME_MS: [u32; 3] = [10, 20, 30];

/// Minimum RMS (normalized to [0, 1]) the energy classifier treats as speech
pub const ENERGY_THRESHOLD: f32 = 0.03;

/// Frame geometry and classifier strictness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VadConfig {
    /// Samples per second
    pub sample_rate: u32,
    /// Frame duration in milliseconds
    pub frame_ms: u32,
    /// 0 = permissive ... 3 = strict
    pub aggressiveness: u8,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_ms: 30,
            aggressiveness: 2,
        }
    }
}

impl VadConfig {
    /// Reject geometry the classifier cannot handle
    ///
    /// # Errors
    ///
    /// Returns error on unsupported sample rate, frame duration or aggressiveness
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(Error::Config(format!(
                "VAD sample rate must be one of {SUPPORTED_SAMPLE_RATES:?}, got {}",
                self.sample_rate
            )));
        }
        if !SUPPORTED_FRAME_MS.contains(&self.frame_ms) {
            return Err(Error::Config(format!(
                "VAD frame duration must be one of {SUPPORTED_FRAME_MS:?} ms, got {}",
                self.frame_ms
            )));
        }
        if self.aggressiveness > 3 {
            return Err(Error::Config(format!(
                "VAD aggressiveness must be 0-3, got {}",
                self.aggressiveness
            )));
        }
        Ok(())
    }

    /// Samples in one frame
    #[must_use]
    pub const fn frame_samples(&self) -> usize {
        (self.sample_rate * self.frame_ms / 1000) as usize
    }

    /// Bytes in one frame of 16-bit PCM
    #[must_use]
    pub const fn frame_bytes(&self) -> usize {
        self.frame_samples() * 2
    }
}

/// Classifies one full PCM frame as speech or not
pub trait VoiceActivityClassifier: Send {
    /// Bytes per frame this classifier expects
    fn frame_bytes(&self) -> usize;

    /// Whether the frame contains speech
    ///
    /// # Errors
    ///
    /// Returns error if the frame cannot be classified
    fn is_speech(&mut self, frame: &[u8]) -> Result<bool>;
}

/// WebRTC VAD
///
/// `webrtc_vad::Vad` wraps a raw handle and is not `Send`, so a detector is
/// built per frame. Its adaptive noise model therefore starts fresh on every
/// frame, which the silence-timeout segmentation tolerates.
#[derive(Debug, Clone)]
pub struct WebRtcClassifier {
    config: VadConfig,
}

impl WebRtcClassifier {
    /// Create a classifier for the given geometry
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is unsupported
    pub fn new(config: VadConfig) -> Result<Self> {
        config.validate()?;
        tracing::debug!(
            sample_rate = config.sample_rate,
            frame_ms = config.frame_ms,
            aggressiveness = config.aggressiveness,
            "webrtc vad initialized"
        );
        Ok(Self { config })
    }

    fn detector(&self) -> Vad {
        let mut vad = Vad::new();
        vad.set_mode(match self.config.aggressiveness {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            _ => VadMode::VeryAggressive,
        });
        vad.set_sample_rate(match self.config.sample_rate {
            8000 => SampleRate::Rate8kHz,
            32000 => SampleRate::Rate32kHz,
            48000 => SampleRate::Rate48kHz,
            _ => SampleRate::Rate16kHz,
        });
        vad
    }
}

impl VoiceActivityClassifier for WebRtcClassifier {
    fn frame_bytes(&self) -> usize {
        self.config.frame_bytes()
    }

    fn is_speech(&mut self, frame: &[u8]) -> Result<bool> {
        if frame.len() != self.frame_bytes() {
            return Err(Error::Vad(format!(
                "expected {} bytes, got {}",
                self.frame_bytes(),
                frame.len()
            )));
        }

        let samples = pcm16_samples(frame);
        self.detector()
            .is_voice_segment(&samples)
            .map_err(|()| Error::Vad("webrtc vad rejected frame".to_string()))
    }
}

/// RMS energy threshold
///
/// Cheap and deterministic; useful for sample rates the WebRTC detector does
/// not accept and for quiet rooms.
#[derive(Debug, Clone)]
pub struct EnergyClassifier {
    frame_bytes: usize,
    threshold: f32,
}

impl EnergyClassifier {
    /// Create an energy classifier for frames of `frame_bytes` bytes
    #[must_use]
    pub const fn new(frame_bytes: usize, threshold: f32) -> Self {
        Self {
            frame_bytes,
            threshold,
        }
    }
}

impl VoiceActivityClassifier for EnergyClassifier {
    fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    fn is_speech(&mut self, frame: &[u8]) -> Result<bool> {
        Ok(rms(&pcm16_samples(frame)) > self.threshold)
    }
}

/// Decode little-endian 16-bit PCM
#[must_use]
pub fn pcm16_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// RMS energy normalized to [0, 1]
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples
        .iter()
        .map(|&s| {
            let v = f32::from(s) / 32768.0;
            v * v
        })
        .sum();
    (sum_squares / samples.len() as f32).sqrt()
}
