//! Front-end session state
//!
//! Everything the chat-platform side needs to remember between events lives
//! here and is passed by reference to whoever handles an event.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::voice::SpeakerId;

/// A channel on the chat platform
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelRef {
    /// Platform channel id
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Server the channel belongs to, when the platform has servers
    pub guild_id: Option<String>,
}

impl ChannelRef {
    /// Create a channel reference
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            guild_id: None,
        }
    }

    /// Attach the owning server
    #[must_use]
    pub fn in_guild(mut self, guild_id: impl Into<String>) -> Self {
        self.guild_id = Some(guild_id.into());
        self
    }
}

#[derive(Debug, Default)]
struct Membership {
    voice_channel: Option<ChannelRef>,
    text_channel: Option<ChannelRef>,
    awaiting_input_mode: bool,
    speaker_names: HashMap<SpeakerId, String>,
}

/// Mutable state of one front-end run
#[derive(Debug, Default)]
pub struct SessionState {
    voice_mode_active: Arc<AtomicBool>,
    membership: Mutex<Membership>,
}

impl SessionState {
    /// Create an idle session
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn membership(&self) -> MutexGuard<'_, Membership> {
        self.membership.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mirror of the `voice-mode-active` record
    #[must_use]
    pub fn voice_mode_active(&self) -> bool {
        self.voice_mode_active.load(Ordering::Acquire)
    }

    /// Update the mirror; returns whether it changed
    pub fn set_voice_mode_active(&self, active: bool) -> bool {
        self.voice_mode_active.swap(active, Ordering::AcqRel) != active
    }

    /// Shared handle to the voice-mode flag for components that only read it
    #[must_use]
    pub fn voice_mode_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.voice_mode_active)
    }

    /// Record a voice-channel join and start waiting for the mode choice
    pub fn joined(&self, voice: ChannelRef, text: ChannelRef) {
        let mut m = self.membership();
        m.voice_channel = Some(voice);
        m.text_channel = Some(text);
        m.awaiting_input_mode = true;
    }

    /// Forget the voice channel and any pending mode choice
    pub fn left(&self) {
        let mut m = self.membership();
        m.voice_channel = None;
        m.awaiting_input_mode = false;
    }

    /// Voice channel the bot is in
    #[must_use]
    pub fn voice_channel(&self) -> Option<ChannelRef> {
        self.membership().voice_channel.clone()
    }

    /// Text channel replies go to
    #[must_use]
    pub fn text_channel(&self) -> Option<ChannelRef> {
        self.membership().text_channel.clone()
    }

    /// Whether the next chat message is read as a mode choice
    #[must_use]
    pub fn awaiting_input_mode(&self) -> bool {
        self.membership().awaiting_input_mode
    }

    /// Stop treating messages as a mode choice
    pub fn input_mode_chosen(&self) {
        self.membership().awaiting_input_mode = false;
    }

    /// Remember how to address a speaker
    pub fn remember_speaker(&self, speaker: &SpeakerId, name: &str) {
        let mut m = self.membership();
        if m.speaker_names.get(speaker).is_none_or(|known| known != name) {
            m.speaker_names.insert(speaker.clone(), name.to_string());
        }
    }

    /// Display name of a speaker, falling back to the raw id
    #[must_use]
    pub fn speaker_name(&self, speaker: &SpeakerId) -> String {
        self.membership()
            .speaker_names
            .get(speaker)
            .cloned()
            .unwrap_or_else(|| speaker.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_then_leave() {
        let session = SessionState::new();
        session.joined(ChannelRef::new("1", "General"), ChannelRef::new("2", "chat"));
        assert!(session.awaiting_input_mode());
        assert_eq!(session.voice_channel().unwrap().name, "General");

        session.input_mode_chosen();
        assert!(!session.awaiting_input_mode());

        session.left();
        assert!(session.voice_channel().is_none());
        assert_eq!(session.text_channel().unwrap().id, "2");
    }

    #[test]
    fn speaker_names_fall_back_to_id() {
        let session = SessionState::new();
        let speaker = SpeakerId::from("42");
        assert_eq!(session.speaker_name(&speaker), "42");

        session.remember_speaker(&speaker, "alice");
        assert_eq!(session.speaker_name(&speaker), "alice");
    }

    #[test]
    fn voice_mode_flag_reports_changes() {
        let session = SessionState::new();
        let flag = session.voice_mode_flag();

        assert!(session.set_voice_mode_active(true));
        assert!(!session.set_voice_mode_active(true));
        assert!(flag.load(Ordering::Acquire));
        assert!(session.set_voice_mode_active(false));
    }
}
