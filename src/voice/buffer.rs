//! Per-speaker raw audio buffers
//!
//! A buffer exists only while its speaker has unflushed audio. Removing a
//! buffer hands back everything appended up to that instant, so an append
//! racing a finalize lands either in the finalized utterance or in a fresh
//! buffer, never in both and never nowhere.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Opaque, stable speaker identity (platform user id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpeakerId(String);

impl SpeakerId {
    /// Wrap a platform identifier
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpeakerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SpeakerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SpeakerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Audio accumulated for one speaker since the last flush
#[derive(Debug, Clone)]
pub struct SpeakerBuffer {
    /// Raw 16-bit PCM, in arrival order
    pub pcm: Vec<u8>,
    /// Time of the most recent append
    pub last_activity: Instant,
    /// Wall-clock time of the first append
    pub started_at: DateTime<Utc>,
    /// Full frames classified as speech
    pub speech_frames: usize,
    /// Leading bytes of `pcm` already cut into frames
    pub framed_bytes: usize,
}

impl SpeakerBuffer {
    fn new(now: Instant) -> Self {
        Self {
            pcm: Vec::new(),
            last_activity: now,
            started_at: Utc::now(),
            speech_frames: 0,
            framed_bytes: 0,
        }
    }

    /// Whether any full frame was classified as speech
    #[must_use]
    pub const fn has_speech(&self) -> bool {
        self.speech_frames > 0
    }
}

/// Buffers for every speaker with unflushed audio
#[derive(Debug, Default)]
pub struct SpeakerBufferStore {
    buffers: Mutex<HashMap<SpeakerId, SpeakerBuffer>>,
}

impl SpeakerBufferStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SpeakerId, SpeakerBuffer>> {
        // A panic mid-append leaves a consistent map; keep serving it
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append bytes for a speaker and classify every frame they complete
    ///
    /// The buffer is created on first audio. Frames are cut from the speaker's continuous stream, so a frame may
    /// span several appends. Returns the speech frames completed by this call.
    pub fn append_framed<F>(
        &self,
        speaker: &SpeakerId,
        bytes: &[u8],
        frame_bytes: usize,
        now: Instant,
        mut is_speech: F,
    ) -> usize
    where
        F: FnMut(&[u8]) -> bool,
    {
        if bytes.is_empty() {
            return 0;
        }

        let mut buffers = self.lock();
        let buffer = buffers
            .entry(speaker.clone())
            .or_insert_with(|| SpeakerBuffer::new(now));
        buffer.pcm.extend_from_slice(bytes);
        buffer.last_activity = now;

        if frame_bytes == 0 {
            return 0;
        }

        let mut speech = 0;
        while buffer.framed_bytes + frame_bytes <= buffer.pcm.len() {
            let start = buffer.framed_bytes;
            if is_speech(&buffer.pcm[start..start + frame_bytes]) {
                speech += 1;
            }
            buffer.framed_bytes += frame_bytes;
        }
        buffer.speech_frames += speech;
        speech
    }

    /// Copy of a speaker's buffered bytes (empty if none)
    #[must_use]
    pub fn snapshot(&self, speaker: &SpeakerId) -> Vec<u8> {
        self.lock()
            .get(speaker)
            .map(|b| b.pcm.clone())
            .unwrap_or_default()
    }

    /// Remove a speaker's buffer, returning what it held
    pub fn clear(&self, speaker: &SpeakerId) -> Option<SpeakerBuffer> {
        self.lock().remove(speaker)
    }

    /// Time of a speaker's last append
    #[must_use]
    pub fn last_activity(&self, speaker: &SpeakerId) -> Option<Instant> {
        self.lock().get(speaker).map(|b| b.last_activity)
    }

    /// Speakers with unflushed audio
    #[must_use]
    pub fn speakers(&self) -> Vec<SpeakerId> {
        let mut speakers: Vec<_> = self.lock().keys().cloned().collect();
        speakers.sort();
        speakers
    }

    /// Remove and return every buffer idle for at least `timeout`
    ///
    /// Snapshot and clear happen under one lock acquisition.
    pub fn take_idle(&self, now: Instant, timeout: Duration) -> Vec<(SpeakerId, SpeakerBuffer)> {
        let mut buffers = self.lock();
        let idle: Vec<SpeakerId> = buffers
            .iter()
            .filter(|(_, b)| now.saturating_duration_since(b.last_activity) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();

        let mut taken: Vec<_> = idle
            .into_iter()
            .filter_map(|id| buffers.remove(&id).map(|b| (id, b)))
            .collect();
        taken.sort_by(|a, b| a.0.cmp(&b.0));
        taken
    }

    /// Number of speakers with unflushed audio
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no speaker has unflushed audio
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
