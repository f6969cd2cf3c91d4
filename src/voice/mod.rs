//! Voice processing
//!
//! Audio flows capture → segmenter (VAD + per-speaker buffers) → STT, and
//! replies flow back through TTS to local playback or a file sink.

mod buffer;
mod capture;
mod playback;
mod segmenter;
mod stt;
mod tts;
mod vad;

pub use buffer::{SpeakerBuffer, SpeakerBufferStore, SpeakerId};
pub use capture::{AudioCapture, SAMPLE_RATE, f32_to_pcm16, pcm16_to_wav, stereo_to_mono_pcm16};
pub use playback::{AudioPlayback, DecodedAudio, decode_mp3};
pub use segmenter::{AudioSegmenter, DEFAULT_SILENCE_TIMEOUT, Utterance};
pub use stt::{HttpSpeechToText, SpeechToText, SttProvider, Transcript};
pub use tts::{
    HttpSynthesizer, SpeechDestination, SpeechOutcome, SpeechSynthesizer, SynthesizerSettings,
    TtsProvider, azure_ssml, prepare_text,
};
pub use vad::{
    ENERGY_THRESHOLD, EnergyClassifier, SUPPORTED_FRAME_MS, SUPPORTED_SAMPLE_RATES, VadConfig,
    VoiceActivityClassifier, WebRtcClassifier, pcm16_samples, rms,
};
