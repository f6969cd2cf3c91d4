//! Silence-timeout utterance segmentation
//!
//! Every incoming chunk is appended to its speaker's buffer whatever its
//! classification, so the edges of an utterance are kept. Frames are cut from
//! each speaker's continuous stream, independent of chunk boundaries. A periodic tick
//! finalizes buffers that have been idle for the silence timeout: buffers with
//! at least one speech frame become utterances, the rest are dropped as noise.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use super::buffer::{SpeakerBufferStore, SpeakerId};
use super::vad::VoiceActivityClassifier;

/// Default inactivity before a buffer is finalized
pub const DEFAULT_SILENCE_TIMEOUT: Duration = Duration::from_secs(5);

/// A finalized span of one speaker's audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    /// Who spoke
    pub speaker: SpeakerId,
    /// 16-bit little-endian mono PCM
    pub pcm: Vec<u8>,
    /// Samples per second of `pcm`
    pub sample_rate: u32,
    /// When the utterance was finalized
    pub captured_at: DateTime<Utc>,
}

impl Utterance {
    /// Duration of the captured audio
    #[must_use]
    pub fn duration(&self) -> Duration {
        let samples = self.pcm.len() as u64 / 2;
        Duration::from_millis(samples * 1000 / u64::from(self.sample_rate.max(1)))
    }
}

/// Splits per-speaker audio streams into utterances
pub struct AudioSegmenter {
    classifier: Mutex<Box<dyn VoiceActivityClassifier>>,
    frame_bytes: usize,
    sample_rate: u32,
    silence_timeout: Duration,
    store: SpeakerBufferStore,
}

impl AudioSegmenter {
    /// Create a segmenter
    #[must_use]
    pub fn new(
        classifier: Box<dyn VoiceActivityClassifier>,
        sample_rate: u32,
        silence_timeout: Duration,
    ) -> Self {
        let frame_bytes = classifier.frame_bytes();
        Self {
            classifier: Mutex::new(classifier),
            frame_bytes,
            sample_rate,
            silence_timeout,
            store: SpeakerBufferStore::new(),
        }
    }

    /// Configured silence timeout
    #[must_use]
    pub const fn silence_timeout(&self) -> Duration {
        self.silence_timeout
    }

    /// Samples per second expected by [`Self::feed`]
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Bytes per classified frame
    #[must_use]
    pub const fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Buffers awaiting a decision
    #[must_use]
    pub const fn buffers(&self) -> &SpeakerBufferStore {
        &self.store
    }

    /// Feed audio for a speaker; returns the number of speech frames in it
    pub fn feed(&self, speaker: &SpeakerId, pcm: &[u8]) -> usize {
        self.feed_at(speaker, pcm, Instant::now())
    }

    /// [`Self::feed`] with an explicit clock
    ///
    /// Frames are cut from the speaker's stream rather than from each chunk,
    /// so chunks shorter than a frame still get classified once enough of
    /// them have arrived.
    pub fn feed_at(&self, speaker: &SpeakerId, pcm: &[u8], now: Instant) -> usize {
        let mut classifier = self
            .classifier
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        self.store
            .append_framed(speaker, pcm, self.frame_bytes, now, |frame| {
                match classifier.is_speech(frame) {
                    Ok(speech) => speech,
                    Err(e) => {
                        tracing::debug!(speaker = %speaker, error = %e, "frame not classified");
                        false
                    }
                }
            })
    }

    /// Finalize every buffer idle for at least the silence timeout
    pub fn tick(&self) -> Vec<Utterance> {
        self.tick_at(Instant::now())
    }

    /// [`Self::tick`] with an explicit clock
    pub fn tick_at(&self, now: Instant) -> Vec<Utterance> {
        self.store
            .take_idle(now, self.silence_timeout)
            .into_iter()
            .filter_map(|(speaker, buffer)| {
                if buffer.has_speech() {
                    tracing::info!(
                        speaker = %speaker,
                        bytes = buffer.pcm.len(),
                        speech_frames = buffer.speech_frames,
                        "utterance finalized"
                    );
                    Some(Utterance {
                        speaker,
                        pcm: buffer.pcm,
                        sample_rate: self.sample_rate,
                        captured_at: Utc::now(),
                    })
                } else {
                    tracing::debug!(
                        speaker = %speaker,
                        bytes = buffer.pcm.len(),
                        "discarding buffer without speech"
                    );
                    None
                }
            })
            .collect()
    }

    /// Drop a speaker's pending audio
    pub fn discard(&self, speaker: &SpeakerId) {
        self.store.clear(speaker);
    }
}
