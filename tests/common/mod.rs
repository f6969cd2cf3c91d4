//! Shared test utilities

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use duet::frontend::ChatPlatformGateway;
use duet::session::ChannelRef;
use duet::voice::{
    SpeakerId, SpeechDestination, SpeechOutcome, SpeechSynthesizer, SpeechToText, Transcript,
    Utterance, VoiceActivityClassifier,
};
use duet::{ConversationHistory, Error, ReplyDispatcher, ResponderService, Result, TurnPipeline};
use tokio::sync::Semaphore;

/// Bytes per frame used by the scripted classifier
pub const FRAME_BYTES: usize = 4;

/// Classifier that answers from a script, then reports silence
pub struct ScriptedClassifier {
    script: VecDeque<bool>,
}

impl ScriptedClassifier {
    pub fn new(script: impl IntoIterator<Item = bool>) -> Self {
        Self {
            script: script.into_iter().collect(),
        }
    }
}

impl VoiceActivityClassifier for ScriptedClassifier {
    fn frame_bytes(&self) -> usize {
        FRAME_BYTES
    }

    fn is_speech(&mut self, _frame: &[u8]) -> Result<bool> {
        Ok(self.script.pop_front().unwrap_or(false))
    }
}

/// A finalized utterance whose PCM is the UTF-8 of `text`
pub fn utterance(speaker: &str, text: &str) -> Utterance {
    Utterance {
        speaker: SpeakerId::from(speaker),
        pcm: text.as_bytes().to_vec(),
        sample_rate: 16000,
        captured_at: Utc::now(),
    }
}

/// STT that returns fixed transcripts in order and records what it was given
#[derive(Default)]
pub struct ScriptedStt {
    transcripts: Mutex<VecDeque<Transcript>>,
    pub calls: Mutex<Vec<Vec<u8>>>,
}

impl ScriptedStt {
    pub fn new(transcripts: impl IntoIterator<Item = Transcript>) -> Self {
        Self {
            transcripts: Mutex::new(transcripts.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Vec<u8>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechToText for ScriptedStt {
    async fn transcribe(&self, pcm: &[u8], _sample_rate: u32) -> Transcript {
        self.calls.lock().unwrap().push(pcm.to_vec());
        self.transcripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Transcript::NoMatch)
    }
}

/// STT that reads PCM as UTF-8 text, each call waiting for a permit
pub struct GatedStt {
    gate: Semaphore,
    pub heard: Mutex<Vec<String>>,
}

impl GatedStt {
    pub fn new() -> Self {
        Self {
            gate: Semaphore::new(0),
            heard: Mutex::new(Vec::new()),
        }
    }

    /// Let `n` transcriptions finish
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn heard(&self) -> Vec<String> {
        self.heard.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechToText for GatedStt {
    async fn transcribe(&self, pcm: &[u8], _sample_rate: u32) -> Transcript {
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
        let text = String::from_utf8_lossy(pcm).to_string();
        self.heard.lock().unwrap().push(text.clone());
        Transcript::from_text(&text)
    }
}

/// Responder that records prompts and answers with a fixed reply or an echo
pub struct RecordingResponder {
    reply: Option<String>,
    pub prompts: Mutex<Vec<(String, Vec<String>)>>,
}

impl RecordingResponder {
    pub fn fixed(reply: &str) -> Self {
        Self {
            reply: Some(reply.to_string()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Replies "re: <prompt>"
    pub fn echo() -> Self {
        Self {
            reply: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .map(|(p, _)| p.clone())
            .collect()
    }
}

#[async_trait]
impl ResponderService for RecordingResponder {
    async fn respond(&self, prompt: &str, history: &[String], _limit: usize) -> Result<String> {
        self.prompts
            .lock()
            .unwrap()
            .push((prompt.to_string(), history.to_vec()));
        Ok(self
            .reply
            .clone()
            .unwrap_or_else(|| format!("re: {prompt}")))
    }
}

/// Responder that always fails
pub struct FailingResponder;

#[async_trait]
impl ResponderService for FailingResponder {
    async fn respond(&self, _prompt: &str, _history: &[String], _limit: usize) -> Result<String> {
        Err(Error::Responder("service down".to_string()))
    }
}

/// Synthesizer that records what it was asked to say
///
/// File sinks receive a few placeholder bytes so playback has something to
/// pick up.
#[derive(Default)]
pub struct RecordingSynthesizer {
    pub spoken: Mutex<Vec<(String, SpeechDestination)>>,
}

impl RecordingSynthesizer {
    pub fn texts(&self) -> Vec<String> {
        self.spoken
            .lock()
            .unwrap()
            .iter()
            .map(|(t, _)| t.clone())
            .collect()
    }
}

#[async_trait]
impl SpeechSynthesizer for RecordingSynthesizer {
    async fn speak(&self, text: &str, destination: &SpeechDestination) -> SpeechOutcome {
        self.spoken
            .lock()
            .unwrap()
            .push((text.to_string(), destination.clone()));
        if let SpeechDestination::FileSink(path) = destination
            && let Err(e) = std::fs::write(path, b"ID3")
        {
            return SpeechOutcome::Failed(e.to_string());
        }
        SpeechOutcome::Delivered
    }
}

/// One recorded dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub speaker: String,
    pub transcript: String,
    pub reply: String,
}

/// Dispatcher that records replies and how many ran at once
#[derive(Default)]
pub struct RecordingDispatcher {
    pub dispatched: Mutex<Vec<Dispatched>>,
    delay: Duration,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl RecordingDispatcher {
    /// Each dispatch takes `delay`
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn dispatched(&self) -> Vec<Dispatched> {
        self.dispatched.lock().unwrap().clone()
    }

    pub fn replies(&self) -> Vec<String> {
        self.dispatched().into_iter().map(|d| d.reply).collect()
    }
}

#[async_trait]
impl ReplyDispatcher for RecordingDispatcher {
    async fn dispatch(&self, speaker: &SpeakerId, transcript: &str, reply: &str) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.dispatched.lock().unwrap().push(Dispatched {
            speaker: speaker.to_string(),
            transcript: transcript.to_string(),
            reply: reply.to_string(),
        });

        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Gateway that records everything instead of talking to a platform
#[derive(Default)]
pub struct FakeGateway {
    pub sent: Mutex<Vec<(String, String)>>,
    pub joined: Mutex<Vec<String>>,
    pub left: Mutex<Vec<String>>,
    pub played: Mutex<Vec<PathBuf>>,
    pub fail_join: bool,
}

impl FakeGateway {
    /// Texts posted to a channel id
    pub fn sent_to(&self, channel_id: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == channel_id)
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn last_sent(&self) -> Option<String> {
        self.sent.lock().unwrap().last().map(|(_, t)| t.clone())
    }
}

#[async_trait]
impl ChatPlatformGateway for FakeGateway {
    fn sample_rate(&self) -> u32 {
        16000
    }

    async fn send_text(&self, channel: &ChannelRef, text: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((channel.id.clone(), text.to_string()));
        Ok(())
    }

    async fn join_voice(&self, channel: &ChannelRef) -> Result<()> {
        if self.fail_join {
            return Err(Error::Channel("join refused".to_string()));
        }
        self.joined.lock().unwrap().push(channel.id.clone());
        Ok(())
    }

    async fn leave_voice(&self, channel: &ChannelRef) -> Result<()> {
        self.left.lock().unwrap().push(channel.id.clone());
        Ok(())
    }

    async fn play_audio(&self, _channel: &ChannelRef, path: &Path) -> Result<()> {
        assert!(path.exists(), "reply audio should exist while playing");
        self.played.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }
}

/// A pipeline over the given fakes with empty history
pub fn pipeline(
    stt: Arc<dyn SpeechToText>,
    responder: Arc<dyn ResponderService>,
    limit: usize,
) -> Arc<TurnPipeline> {
    Arc::new(TurnPipeline::new(stt, responder, ConversationHistory::new(limit)))
}

/// Wait until `check` holds, polling briefly
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
