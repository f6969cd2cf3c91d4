//! Chat-platform front-end
//!
//! The front-end owns the platform connection. It turns platform events into
//! session changes, feeds received voice into the segmenter, hands finished
//! utterances to the turn coordinator, and writes the `joined-channel` and
//! `input-mode` records the orchestrator is waiting on.

pub mod discord;
pub mod twitch;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::session::{ChannelRef, SessionState};
use crate::signal::{InputMode, SignalChannel, SignalName};
use crate::turn::{ReplyDispatcher, TurnCoordinator, TurnPipeline};
use crate::voice::{AudioSegmenter, SpeakerId, SpeechDestination, SpeechSynthesizer};
use crate::Result;

/// Default interval between segmentation scans
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Something that happened on the chat platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// A chat message that is not a command
    Message {
        /// Platform user id of the author
        author_id: String,
        /// Display name of the author
        author_name: String,
        /// Channel the message was posted in
        channel: ChannelRef,
        /// Message text
        content: String,
    },
    /// `!join`; `voice_channel` is where the author currently is
    Join {
        /// Channel the command was posted in
        text_channel: ChannelRef,
        /// Author's voice channel, if any
        voice_channel: Option<ChannelRef>,
    },
    /// `!leave`
    Leave {
        /// Channel the command was posted in
        text_channel: ChannelRef,
    },
    /// A user's voice channel changed
    VoiceMembership {
        /// Platform user id
        user_id: String,
        /// Whether the user is this bot
        is_self: bool,
        /// New voice channel; `None` when the user left voice
        channel: Option<ChannelRef>,
    },
    /// Decoded voice from one speaker: 16-bit mono PCM
    Audio {
        /// Who is speaking
        speaker: SpeakerId,
        /// How to address them
        display_name: String,
        /// Audio at the gateway's sample rate
        pcm: Vec<u8>,
    },
}

/// Outbound side of a chat platform
#[async_trait]
pub trait ChatPlatformGateway: Send + Sync {
    /// Sample rate of PCM in [`GatewayEvent::Audio`]
    fn sample_rate(&self) -> u32;

    /// Post a text message
    ///
    /// # Errors
    ///
    /// Returns error if the message cannot be sent
    async fn send_text(&self, channel: &ChannelRef, text: &str) -> Result<()>;

    /// Connect to a voice channel
    ///
    /// # Errors
    ///
    /// Returns error if the channel cannot be joined
    async fn join_voice(&self, channel: &ChannelRef) -> Result<()>;

    /// Disconnect from voice
    ///
    /// # Errors
    ///
    /// Returns error if the disconnect fails
    async fn leave_voice(&self, channel: &ChannelRef) -> Result<()>;

    /// Play an encoded audio file in the connected voice channel, returning
    /// once playback has finished
    ///
    /// # Errors
    ///
    /// Returns error if nothing is connected or playback fails
    async fn play_audio(&self, channel: &ChannelRef, path: &Path) -> Result<()>;
}

/// Front-end tunables
#[derive(Debug, Clone)]
pub struct FrontEndSettings {
    /// Interval between segmentation scans
    pub scan_interval: Duration,
    /// Name the companion posts as in logs
    pub persona_name: String,
}

impl Default for FrontEndSettings {
    fn default() -> Self {
        Self {
            scan_interval: DEFAULT_SCAN_INTERVAL,
            persona_name: "Miku".to_string(),
        }
    }
}

/// Delivers replies on the platform: text into the channel, speech into voice
pub struct PlatformReply<G> {
    gateway: Arc<G>,
    session: Arc<SessionState>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    audio_dir: Arc<tempfile::TempDir>,
    counter: Arc<AtomicU64>,
    /// Channel for replies; `None` means the session's text channel
    channel: Option<ChannelRef>,
    /// Post "<name> said: <transcript>" before the reply
    announce: bool,
}

impl<G: ChatPlatformGateway> PlatformReply<G> {
    /// Reply dispatcher for voice turns
    ///
    /// # Errors
    ///
    /// Returns error if the scratch directory for reply audio cannot be created
    pub fn for_voice(
        gateway: Arc<G>,
        session: Arc<SessionState>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
    ) -> Result<Self> {
        Ok(Self {
            gateway,
            session,
            synthesizer,
            audio_dir: Arc::new(tempfile::Builder::new().prefix("duet-replies").tempdir()?),
            counter: Arc::new(AtomicU64::new(0)),
            channel: None,
            announce: true,
        })
    }

    /// Same platform and synthesizer, replying into `channel` without announcing
    #[must_use]
    pub fn for_message(&self, channel: ChannelRef) -> Self {
        Self {
            gateway: Arc::clone(&self.gateway),
            session: Arc::clone(&self.session),
            synthesizer: Arc::clone(&self.synthesizer),
            audio_dir: Arc::clone(&self.audio_dir),
            counter: Arc::clone(&self.counter),
            channel: Some(channel),
            announce: false,
        }
    }

    fn next_audio_path(&self) -> PathBuf {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        self.audio_dir.path().join(format!("reply-{n}.mp3"))
    }

    async fn post(&self, channel: &ChannelRef, text: &str) {
        if let Err(e) = self.gateway.send_text(channel, text).await {
            tracing::warn!(channel = %channel.name, error = %e, "failed to post message");
        }
    }

    async fn speak(&self, voice: &ChannelRef, reply: &str) {
        let path = self.next_audio_path();
        let outcome = self
            .synthesizer
            .speak(reply, &SpeechDestination::FileSink(path.clone()))
            .await;

        if outcome.is_delivered() {
            if let Err(e) = self.gateway.play_audio(voice, &path).await {
                tracing::warn!(error = %e, "failed to play reply in voice");
            }
        } else {
            tracing::debug!(outcome = ?outcome, "no reply audio to play");
        }

        if let Err(e) = tokio::fs::remove_file(&path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::debug!(path = %path.display(), error = %e, "failed to remove reply audio");
        }
    }
}

#[async_trait]
impl<G: ChatPlatformGateway> ReplyDispatcher for PlatformReply<G> {
    async fn dispatch(&self, speaker: &SpeakerId, transcript: &str, reply: &str) {
        if let Some(channel) = self.channel.clone().or_else(|| self.session.text_channel()) {
            if self.announce {
                let name = self.session.speaker_name(speaker);
                self.post(&channel, &format!("{name} said: {transcript}")).await;
            }
            self.post(&channel, reply).await;
        }

        if let Some(voice) = self.session.voice_channel() {
            self.speak(&voice, reply).await;
        }
    }
}

/// The front-end event loop
pub struct FrontEnd<G> {
    gateway: Arc<G>,
    signals: SignalChannel,
    session: Arc<SessionState>,
    segmenter: Arc<AudioSegmenter>,
    coordinator: TurnCoordinator,
    replies: Arc<PlatformReply<G>>,
    settings: FrontEndSettings,
}

impl<G: ChatPlatformGateway + 'static> FrontEnd<G> {
    /// Assemble a front-end
    ///
    /// # Errors
    ///
    /// Returns error if the reply scratch directory cannot be created
    pub fn new(
        gateway: Arc<G>,
        signals: SignalChannel,
        segmenter: AudioSegmenter,
        pipeline: Arc<TurnPipeline>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        settings: FrontEndSettings,
    ) -> Result<Self> {
        let session = Arc::new(SessionState::new());
        let replies = Arc::new(PlatformReply::for_voice(
            Arc::clone(&gateway),
            Arc::clone(&session),
            synthesizer,
        )?);
        let coordinator = TurnCoordinator::new(
            pipeline,
            Arc::clone(&replies) as Arc<dyn ReplyDispatcher>,
            session.voice_mode_flag(),
        );

        Ok(Self {
            gateway,
            signals,
            session,
            segmenter: Arc::new(segmenter),
            coordinator,
            replies,
            settings,
        })
    }

    /// Session state
    #[must_use]
    pub const fn session(&self) -> &Arc<SessionState> {
        &self.session
    }

    /// Turn coordinator for platform voice
    #[must_use]
    pub const fn coordinator(&self) -> &TurnCoordinator {
        &self.coordinator
    }

    /// Run until the event stream ends or the process is interrupted
    ///
    /// # Errors
    ///
    /// Returns error if history cannot be saved at shutdown
    pub async fn run(&self, mut events: mpsc::Receiver<GatewayEvent>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.settings.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(persona = %self.settings.persona_name, "front-end running, waiting for !join");

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = ticker.tick() => {
                    self.scan();
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupted");
                    break;
                }
            }
        }

        tracing::info!("front-end stopping");
        self.coordinator.pipeline().save_history().await
    }

    /// Apply one platform event
    pub async fn handle_event(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::Join {
                text_channel,
                voice_channel,
            } => self.on_join(text_channel, voice_channel).await,
            GatewayEvent::Leave { text_channel } => self.on_leave(&text_channel).await,
            GatewayEvent::Message {
                author_id,
                author_name,
                channel,
                content,
            } => self.on_message(author_id, &author_name, channel, content).await,
            GatewayEvent::VoiceMembership {
                user_id,
                is_self,
                channel,
            } => self.on_voice_membership(&user_id, is_self, channel.as_ref()),
            GatewayEvent::Audio {
                speaker,
                display_name,
                pcm,
            } => {
                if self.session.voice_channel().is_some() {
                    self.session.remember_speaker(&speaker, &display_name);
                    self.segmenter.feed(&speaker, &pcm);
                }
            }
        }
    }

    /// Refresh the voice-mode mirror and submit finished utterances
    ///
    /// Returns the number of utterances produced.
    pub fn scan(&self) -> usize {
        self.refresh_voice_mode();

        let utterances = self.segmenter.tick();
        let count = utterances.len();
        for utterance in utterances {
            let speaker = utterance.speaker.clone();
            let submission = self.coordinator.submit(utterance);
            tracing::debug!(speaker = %speaker, submission = ?submission, "utterance submitted");
        }
        count
    }

    fn refresh_voice_mode(&self) -> bool {
        let active = self.signals.is_signaled(SignalName::VoiceModeActive);
        if self.session.set_voice_mode_active(active) {
            tracing::info!(active, "voice mode changed");
        }
        active
    }

    async fn say(&self, channel: &ChannelRef, text: &str) {
        if let Err(e) = self.gateway.send_text(channel, text).await {
            tracing::warn!(channel = %channel.name, error = %e, "failed to post message");
        }
    }

    async fn on_join(&self, text_channel: ChannelRef, voice_channel: Option<ChannelRef>) {
        let Some(voice) = voice_channel else {
            self.say(&text_channel, "You are not in a voice channel!").await;
            return;
        };

        if let Err(e) = self.gateway.join_voice(&voice).await {
            tracing::warn!(channel = %voice.name, error = %e, "failed to join voice");
            self.say(&text_channel, &format!("Couldn't join {}.", voice.name)).await;
            return;
        }

        self.say(&text_channel, &format!("Joined {}", voice.name)).await;
        self.session.joined(voice.clone(), text_channel.clone());

        match self.signals.signal(SignalName::JoinedChannel, None) {
            Ok(()) => tracing::info!(channel = %voice.name, "joined voice channel, orchestrator signaled"),
            Err(e) => tracing::error!(error = %e, "failed to write joined-channel record"),
        }

        self.say(&text_channel, "Please choose your input mode: type 'voice' or 'text'.")
            .await;
    }

    async fn on_leave(&self, text_channel: &ChannelRef) {
        let Some(voice) = self.session.voice_channel() else {
            self.say(text_channel, "I'm not in a voice channel!").await;
            return;
        };

        if let Err(e) = self.gateway.leave_voice(&voice).await {
            tracing::warn!(error = %e, "failed to leave voice cleanly");
        }
        self.end_voice_session();
        self.say(text_channel, "Left the voice channel!").await;
    }

    fn end_voice_session(&self) {
        self.session.left();
        self.session.set_voice_mode_active(false);
        self.signals.clear_quietly(&[
            SignalName::VoiceModeActive,
            SignalName::JoinedChannel,
            SignalName::InputMode,
        ]);
        for speaker in self.segmenter.buffers().speakers() {
            self.segmenter.discard(&speaker);
        }
    }

    async fn on_message(&self, author_id: String, author_name: &str, channel: ChannelRef, content: String) {
        if self.session.awaiting_input_mode() {
            self.choose_input_mode(&channel, &content).await;
            return;
        }

        if self.refresh_voice_mode() {
            tracing::info!(author = %author_name, "voice mode active, chat message ignored");
            return;
        }

        tracing::info!(author = %author_name, content = %content, "chat message received");

        let dispatcher = self.replies.for_message(channel);
        let pipeline = Arc::clone(self.coordinator.pipeline());
        let speaker = SpeakerId::from(author_id);
        self.session.remember_speaker(&speaker, author_name);

        tokio::spawn(async move {
            pipeline.handle_text(&speaker, &content, &dispatcher).await;
        });
    }

    async fn choose_input_mode(&self, channel: &ChannelRef, content: &str) {
        let choice = content.trim().to_ascii_lowercase();
        let mode = match choice.as_str() {
            "voice" => InputMode::Voice,
            "text" => InputMode::Text,
            _ => {
                self.say(channel, "Please choose 'voice' or 'text'.").await;
                return;
            }
        };

        if let Err(e) = self.signals.signal(SignalName::InputMode, Some(mode.as_str())) {
            tracing::error!(error = %e, "failed to write input-mode record");
            self.say(channel, "Couldn't record the input mode, please try again.")
                .await;
            return;
        }

        self.session.input_mode_chosen();
        tracing::info!(mode = %mode, "input mode chosen, orchestrator signaled");
        self.say(
            channel,
            &format!("Input mode set to {mode}. You can now provide input locally."),
        )
        .await;
    }

    fn on_voice_membership(&self, user_id: &str, is_self: bool, channel: Option<&ChannelRef>) {
        tracing::debug!(user = user_id, is_self, channel = ?channel.map(|c| &c.name), "voice membership changed");

        if is_self && channel.is_none() && self.session.voice_channel().is_some() {
            tracing::warn!("disconnected from voice by the platform");
            self.end_voice_session();
        }
    }
}
