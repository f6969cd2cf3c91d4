//! Turn taking
//!
//! A turn is utterance → transcript → reply → speech for one speaker. Each
//! speaker has at most one turn in flight and at most one utterance waiting
//! behind it; a newer utterance replaces the waiting one. Different speakers
//! take turns concurrently, but speech output is serialized so replies never
//! talk over each other.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, watch};

use crate::history::ConversationHistory;
use crate::responder::ResponderService;
use crate::voice::{SpeakerId, SpeechDestination, SpeechSynthesizer, SpeechToText, Transcript, Utterance};

/// Where a speaker is in the turn cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnState {
    /// No turn in flight
    #[default]
    Idle,
    /// Waiting on speech-to-text
    AwaitingTranscript,
    /// Waiting on the responder
    AwaitingResponse,
    /// Reply is being spoken
    AwaitingSpeech,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::AwaitingTranscript => "awaiting-transcript",
            Self::AwaitingResponse => "awaiting-response",
            Self::AwaitingSpeech => "awaiting-speech",
        })
    }
}

/// What [`TurnCoordinator::submit`] did with an utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// A new turn started for this speaker
    Started,
    /// Held until the in-flight turn finishes
    Queued,
    /// Held, displacing an older waiting utterance
    Replaced,
    /// Dropped because voice mode owns turns
    Suppressed,
}

/// Delivers a finished reply
#[async_trait]
pub trait ReplyDispatcher: Send + Sync {
    /// Deliver `reply` to `transcript` from `speaker`; failures are logged, not returned
    async fn dispatch(&self, speaker: &SpeakerId, transcript: &str, reply: &str);
}

/// Speaks replies through a synthesizer
pub struct SpeakReply {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    destination: SpeechDestination,
}

impl SpeakReply {
    /// Speak to `destination`
    #[must_use]
    pub fn new(synthesizer: Arc<dyn SpeechSynthesizer>, destination: SpeechDestination) -> Self {
        Self {
            synthesizer,
            destination,
        }
    }
}

#[async_trait]
impl ReplyDispatcher for SpeakReply {
    async fn dispatch(&self, speaker: &SpeakerId, _transcript: &str, reply: &str) {
        let outcome = self.synthesizer.speak(reply, &self.destination).await;
        tracing::debug!(speaker = %speaker, outcome = ?outcome, "reply spoken");
    }
}

/// The stages of a turn, shared by every input path
pub struct TurnPipeline {
    stt: Arc<dyn SpeechToText>,
    responder: Arc<dyn ResponderService>,
    history: AsyncMutex<ConversationHistory>,
    history_path: Option<PathBuf>,
    speech_lock: AsyncMutex<()>,
}

impl TurnPipeline {
    /// Create a pipeline over the given collaborators
    #[must_use]
    pub fn new(
        stt: Arc<dyn SpeechToText>,
        responder: Arc<dyn ResponderService>,
        history: ConversationHistory,
    ) -> Self {
        Self {
            stt,
            responder,
            history: AsyncMutex::new(history),
            history_path: None,
            speech_lock: AsyncMutex::new(()),
        }
    }

    /// Persist history to `path` after every completed exchange
    #[must_use]
    pub fn with_history_path(mut self, path: PathBuf) -> Self {
        self.history_path = Some(path);
        self
    }

    /// Current history as `Role: text` lines
    pub async fn history_lines(&self) -> Vec<String> {
        self.history.lock().await.lines()
    }

    /// Transcribe an utterance; misses and outages yield `None`
    pub async fn transcribe(&self, utterance: &Utterance) -> Option<String> {
        match self
            .stt
            .transcribe(&utterance.pcm, utterance.sample_rate)
            .await
        {
            Transcript::Text(text) => {
                tracing::info!(speaker = %utterance.speaker, transcript = %text, "heard");
                Some(text)
            }
            Transcript::NoMatch => {
                tracing::debug!(speaker = %utterance.speaker, "no speech recognized");
                None
            }
            Transcript::Unavailable(reason) => {
                tracing::warn!(speaker = %utterance.speaker, reason = %reason, "speech-to-text unavailable");
                None
            }
        }
    }

    /// Ask the responder for a reply and record the exchange
    ///
    /// The user line and the reply enter history together, before the reply
    /// is spoken.
    pub async fn reply(&self, text: &str) -> Option<String> {
        let (lines, limit) = {
            let history = self.history.lock().await;
            (history.lines(), history.limit())
        };

        let reply = match self.responder.respond(text, &lines, limit).await {
            Ok(reply) if !reply.trim().is_empty() => reply,
            Ok(_) => {
                tracing::warn!("responder returned an empty reply");
                return None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "responder failed");
                return None;
            }
        };

        let mut history = self.history.lock().await;
        history.push_user(text);
        history.push_assistant(reply.clone());
        if let Some(path) = &self.history_path
            && let Err(e) = history.save(path)
        {
            tracing::warn!(path = %path.display(), error = %e, "failed to save history");
        }

        Some(reply)
    }

    /// Hand a reply to the dispatcher, one reply at a time across all speakers
    pub async fn deliver(
        &self,
        speaker: &SpeakerId,
        transcript: &str,
        reply: &str,
        dispatcher: &dyn ReplyDispatcher,
    ) {
        let _speaking = self.speech_lock.lock().await;
        dispatcher.dispatch(speaker, transcript, reply).await;
    }

    /// Run the reply half of a turn for text that is already known
    pub async fn handle_text(
        &self,
        speaker: &SpeakerId,
        text: &str,
        dispatcher: &dyn ReplyDispatcher,
    ) -> Option<String> {
        let reply = self.reply(text).await?;
        self.deliver(speaker, text, &reply, dispatcher).await;
        Some(reply)
    }

    /// Write history now, if a path is configured
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub async fn save_history(&self) -> crate::Result<()> {
        match &self.history_path {
            Some(path) => self.history.lock().await.save(path),
            None => Ok(()),
        }
    }
}

#[derive(Debug)]
struct SpeakerSlot {
    state: TurnState,
    pending: Option<Utterance>,
}

/// Runs turns for many speakers at once
#[derive(Clone)]
pub struct TurnCoordinator {
    pipeline: Arc<TurnPipeline>,
    dispatcher: Arc<dyn ReplyDispatcher>,
    suppressed: Arc<AtomicBool>,
    slots: Arc<Mutex<HashMap<SpeakerId, SpeakerSlot>>>,
    in_flight: Arc<watch::Sender<usize>>,
}

impl TurnCoordinator {
    /// Create a coordinator; while `suppressed` is set, new utterances are dropped
    #[must_use]
    pub fn new(
        pipeline: Arc<TurnPipeline>,
        dispatcher: Arc<dyn ReplyDispatcher>,
        suppressed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            pipeline,
            dispatcher,
            suppressed,
            slots: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(watch::channel(0).0),
        }
    }

    /// The shared pipeline
    #[must_use]
    pub fn pipeline(&self) -> &Arc<TurnPipeline> {
        &self.pipeline
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<SpeakerId, SpeakerSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Offer an utterance; starts a turn, queues it, or drops it
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit(&self, utterance: Utterance) -> Submission {
        if self.suppressed.load(Ordering::Acquire) {
            tracing::debug!(speaker = %utterance.speaker, "voice mode active, utterance dropped");
            return Submission::Suppressed;
        }

        let speaker = utterance.speaker.clone();
        let mut slots = self.slots();

        if let Some(slot) = slots.get_mut(&speaker) {
            let replaced = slot.pending.replace(utterance).is_some();
            tracing::debug!(speaker = %speaker, state = %slot.state, replaced, "turn in flight, utterance held");
            return if replaced {
                Submission::Replaced
            } else {
                Submission::Queued
            };
        }

        slots.insert(
            speaker.clone(),
            SpeakerSlot {
                state: TurnState::AwaitingTranscript,
                pending: None,
            },
        );
        self.in_flight.send_replace(slots.len());
        drop(slots);

        tracing::debug!(speaker = %speaker, "turn started");
        let this = self.clone();
        tokio::spawn(async move { this.run_speaker(utterance).await });
        Submission::Started
    }

    /// A speaker's current state
    #[must_use]
    pub fn state(&self, speaker: &SpeakerId) -> TurnState {
        self.slots().get(speaker).map_or(TurnState::Idle, |s| s.state)
    }

    /// The utterance waiting behind a speaker's in-flight turn
    #[must_use]
    pub fn pending(&self, speaker: &SpeakerId) -> Option<Utterance> {
        self.slots().get(speaker).and_then(|s| s.pending.clone())
    }

    /// Speakers with a turn in flight
    #[must_use]
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Wait until no speaker has a turn in flight
    pub async fn wait_idle(&self) {
        let mut rx = self.in_flight.subscribe();
        // the sender lives in self, so the channel cannot close here
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    async fn run_speaker(self, first: Utterance) {
        let speaker = first.speaker.clone();
        let mut utterance = first;
        loop {
            self.run_turn(&utterance).await;
            match self.next_pending(&speaker) {
                Some(next) => utterance = next,
                None => break,
            }
        }
    }

    async fn run_turn(&self, utterance: &Utterance) {
        let speaker = &utterance.speaker;

        let Some(transcript) = self.pipeline.transcribe(utterance).await else {
            return;
        };

        self.set_state(speaker, TurnState::AwaitingResponse);
        let Some(reply) = self.pipeline.reply(&transcript).await else {
            return;
        };

        self.set_state(speaker, TurnState::AwaitingSpeech);
        self.pipeline
            .deliver(speaker, &transcript, &reply, self.dispatcher.as_ref())
            .await;
        tracing::debug!(speaker = %speaker, "turn complete");
    }

    fn set_state(&self, speaker: &SpeakerId, state: TurnState) {
        if let Some(slot) = self.slots().get_mut(speaker) {
            slot.state = state;
        }
    }

    /// Take the waiting utterance or return the speaker to idle, atomically
    fn next_pending(&self, speaker: &SpeakerId) -> Option<Utterance> {
        let mut slots = self.slots();
        let pending = slots.get_mut(speaker).and_then(|s| s.pending.take());

        let next = match pending {
            Some(utterance) if !self.suppressed.load(Ordering::Acquire) => {
                if let Some(slot) = slots.get_mut(speaker) {
                    slot.state = TurnState::AwaitingTranscript;
                }
                Some(utterance)
            }
            Some(_) => {
                tracing::debug!(speaker = %speaker, "voice mode active, held utterance dropped");
                slots.remove(speaker);
                None
            }
            None => {
                slots.remove(speaker);
                None
            }
        };

        self.in_flight.send_replace(slots.len());
        next
    }
}
