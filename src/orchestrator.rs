//! Process orchestration
//!
//! The orchestrator spawns the front-end as a child process, waits for it to
//! report that it joined a voice channel and which input mode the user chose,
//! then runs the local input loop. Whatever happens after the spawn, teardown
//! removes every signal record and stops the child.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::future::Future;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::signal::{InputMode, SignalChannel, SignalName, WaitOutcome};
use crate::turn::{ReplyDispatcher, SpeakReply, TurnPipeline};
use crate::voice::{
    AudioCapture, AudioSegmenter, ENERGY_THRESHOLD, SpeakerId, Utterance, pcm16_samples, rms,
};
use crate::{Error, Result};

/// Default wait for each handshake record
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Word that ends the local loop, typed or spoken
pub const EXIT_WORD: &str = "exit";

/// Speaker id used for the local user
pub const LOCAL_SPEAKER: &str = "local";

/// One unit of local input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalInput {
    /// A typed line
    Text(String),
    /// A finalized microphone utterance
    Utterance(Utterance),
    /// No more input will come
    Closed,
}

/// Source of local input for the orchestrator loop
#[async_trait(?Send)]
pub trait InputSource {
    /// Wait for the next input; must be cancel safe
    ///
    /// # Errors
    ///
    /// Returns error if the source fails irrecoverably
    async fn next_input(&mut self) -> Result<LocalInput>;

    /// Called once a reply has been delivered
    ///
    /// Sources that hear the room drop whatever they captured meanwhile.
    fn resume(&mut self) {}
}

/// Lines typed on stdin
///
/// Lines are read on a dedicated thread: a blocking stdin read cannot be
/// cancelled, and the runtime must be able to shut down while one is pending.
pub struct TypedInput {
    lines: mpsc::Receiver<std::io::Result<String>>,
}

impl TypedInput {
    /// Read from this process's stdin
    #[must_use]
    pub fn stdin() -> Self {
        Self::from_reader(std::io::BufReader::new(std::io::stdin()))
    }

    /// Read lines from any blocking reader
    #[must_use]
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: BufRead + Send + 'static,
    {
        let (tx, lines) = mpsc::channel(1);
        let spawned = std::thread::Builder::new()
            .name("duet-input".to_string())
            .spawn(move || {
                for line in BufRead::lines(reader) {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
            });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to start the input reader");
        }

        Self { lines }
    }

    /// Print `prompt` and wait for the next line; `None` once input ends
    ///
    /// # Errors
    ///
    /// Returns error if the prompt cannot be written or the read fails
    pub async fn read_line(&mut self, prompt: &str) -> Result<Option<String>> {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(prompt.as_bytes()).await?;
        stdout.flush().await?;

        match self.lines.recv().await {
            Some(line) => Ok(Some(line?)),
            None => Ok(None),
        }
    }
}

impl Default for TypedInput {
    fn default() -> Self {
        Self::stdin()
    }
}

#[async_trait(?Send)]
impl InputSource for TypedInput {
    async fn next_input(&mut self) -> Result<LocalInput> {
        Ok(match self.read_line("You (text): ").await? {
            Some(line) => LocalInput::Text(line),
            None => LocalInput::Closed,
        })
    }
}

/// Frames of edge audio kept on each side of a frame above the gate
pub const EDGE_FRAMES: usize = 5;

/// Energy gate in front of the segmenter for a continuous microphone stream
///
/// A microphone delivers silence too, so frames below the gate are not fed
/// to the segmenter. This mirrors chat platforms, which only transmit while a
/// user is speaking, and lets the silence timeout fire. Up to
/// [`EDGE_FRAMES`] quiet frames before and after a loud one are kept so soft
/// onsets and endings survive.
pub struct MicrophoneGate {
    segmenter: AudioSegmenter,
    speaker: SpeakerId,
    gate: f32,
    pending: Vec<u8>,
    lead_in: VecDeque<Vec<u8>>,
    trailing: usize,
}

impl MicrophoneGate {
    /// Gate audio at `gate` RMS before it reaches `segmenter`
    #[must_use]
    pub fn new(segmenter: AudioSegmenter, gate: f32) -> Self {
        Self {
            segmenter,
            speaker: SpeakerId::from(LOCAL_SPEAKER),
            gate,
            pending: Vec::new(),
            lead_in: VecDeque::new(),
            trailing: 0,
        }
    }

    /// Samples per second the segmenter expects
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.segmenter.sample_rate()
    }

    /// Gate captured PCM and feed what passes; returns the bytes fed
    pub fn push(&mut self, pcm: &[u8]) -> usize {
        self.push_at(pcm, Instant::now())
    }

    /// [`Self::push`] with an explicit clock
    pub fn push_at(&mut self, pcm: &[u8], now: Instant) -> usize {
        self.pending.extend_from_slice(pcm);
        if self.pending.is_empty() {
            return 0;
        }

        let frame_bytes = match self.segmenter.frame_bytes() {
            0 => self.pending.len(),
            n => n,
        };
        let whole = self.pending.len() / frame_bytes * frame_bytes;

        let mut voiced = Vec::new();
        for frame in self.pending[..whole].chunks_exact(frame_bytes) {
            if rms(&pcm16_samples(frame)) >= self.gate {
                voiced.extend(self.lead_in.drain(..).flatten());
                voiced.extend_from_slice(frame);
                self.trailing = EDGE_FRAMES;
            } else if self.trailing > 0 {
                voiced.extend_from_slice(frame);
                self.trailing -= 1;
            } else {
                if self.lead_in.len() == EDGE_FRAMES {
                    self.lead_in.pop_front();
                }
                self.lead_in.push_back(frame.to_vec());
            }
        }
        self.pending.drain(..whole);

        if !voiced.is_empty() {
            self.segmenter.feed_at(&self.speaker, &voiced, now);
        }
        voiced.len()
    }

    /// The next finalized utterance, if the silence timeout has passed
    pub fn poll(&self) -> Option<Utterance> {
        self.poll_at(Instant::now())
    }

    /// [`Self::poll`] with an explicit clock
    pub fn poll_at(&self, now: Instant) -> Option<Utterance> {
        self.segmenter.tick_at(now).into_iter().next()
    }

    /// Forget all audio not yet turned into an utterance
    pub fn reset(&mut self) {
        self.segmenter.discard(&self.speaker);
        self.pending.clear();
        self.lead_in.clear();
        self.trailing = 0;
    }
}

/// Microphone audio segmented into utterances
pub struct MicrophoneInput {
    capture: AudioCapture,
    gate: MicrophoneGate,
    scan_interval: Duration,
}

impl MicrophoneInput {
    /// Start capturing from the default input device
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be opened
    pub fn start(segmenter: AudioSegmenter, scan_interval: Duration) -> Result<Self> {
        let gate = MicrophoneGate::new(segmenter, ENERGY_THRESHOLD);
        let mut capture = AudioCapture::new(gate.sample_rate())?;
        capture.start()?;
        tracing::info!("listening to microphone");

        Ok(Self {
            capture,
            gate,
            scan_interval,
        })
    }
}

impl Drop for MicrophoneInput {
    fn drop(&mut self) {
        self.capture.stop();
    }
}

#[async_trait(?Send)]
impl InputSource for MicrophoneInput {
    async fn next_input(&mut self) -> Result<LocalInput> {
        loop {
            tokio::time::sleep(self.scan_interval).await;

            self.gate.push(&self.capture.take_pcm16());
            if let Some(utterance) = self.gate.poll() {
                return Ok(LocalInput::Utterance(utterance));
            }
        }
    }

    fn resume(&mut self) {
        // the reply was played through the speakers; do not answer ourselves
        let heard = self.capture.take_samples().len();
        self.gate.reset();
        tracing::debug!(samples = heard, "dropped audio captured during the reply");
    }
}

/// Speaks replies locally and echoes them to the terminal
pub struct ConsoleReply {
    persona: String,
    speaker: SpeakReply,
}

impl ConsoleReply {
    /// Echo as `persona` and speak through `speaker`
    #[must_use]
    pub fn new(persona: impl Into<String>, speaker: SpeakReply) -> Self {
        Self {
            persona: persona.into(),
            speaker,
        }
    }
}

#[async_trait]
impl ReplyDispatcher for ConsoleReply {
    async fn dispatch(&self, speaker: &SpeakerId, transcript: &str, reply: &str) {
        println!("{}: {reply}", self.persona);
        self.speaker.dispatch(speaker, transcript, reply).await;
    }
}

/// How to launch the front-end process
#[derive(Debug, Clone)]
pub struct FrontEndCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl FrontEndCommand {
    /// Launch an arbitrary program
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Re-launch this executable as `front-end --signal-dir <dir>`
    ///
    /// # Errors
    ///
    /// Returns error if the current executable cannot be located
    pub fn current_exe(signal_dir: &Path, extra: impl IntoIterator<Item = OsString>) -> Result<Self> {
        let program = std::env::current_exe()?;
        let mut args: Vec<OsString> = vec![
            "front-end".into(),
            "--signal-dir".into(),
            signal_dir.as_os_str().to_owned(),
        ];
        args.extend(extra);
        Ok(Self { program, args })
    }

    /// Spawn with stdout/stderr relayed into the log
    ///
    /// # Errors
    ///
    /// Returns error if the process cannot be started
    pub fn spawn(&self) -> Result<Child> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Config(format!("failed to spawn front-end {}: {e}", self.program.display()))
            })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::info!(source = "front-end", "{line}");
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!(source = "front-end", "{line}");
                }
            });
        }

        tracing::info!(pid = child.id(), program = %self.program.display(), "front-end launched");
        Ok(child)
    }
}

/// Drives one orchestrated session
pub struct ProcessOrchestrator {
    signals: SignalChannel,
    front_end: FrontEndCommand,
    handshake_timeout: Duration,
}

impl ProcessOrchestrator {
    /// Create an orchestrator
    #[must_use]
    pub const fn new(signals: SignalChannel, front_end: FrontEndCommand, handshake_timeout: Duration) -> Self {
        Self {
            signals,
            front_end,
            handshake_timeout,
        }
    }

    /// The signal channel shared with the front-end
    #[must_use]
    pub const fn signals(&self) -> &SignalChannel {
        &self.signals
    }

    /// Run a full session: spawn, handshake, local loop, teardown
    ///
    /// `open_input` is called once with the chosen mode to build the input
    /// source.
    ///
    /// # Errors
    ///
    /// Returns error on handshake timeout, if the front-end exits before the
    /// loop ends, or if the input source fails. Records are removed and the
    /// front-end is stopped in every case.
    pub async fn run<F>(
        &self,
        open_input: F,
        pipeline: &TurnPipeline,
        dispatcher: &dyn ReplyDispatcher,
    ) -> Result<()>
    where
        F: FnOnce(InputMode) -> Result<Box<dyn InputSource>>,
    {
        self.run_until(open_input, pipeline, dispatcher, interrupted())
            .await
    }

    /// [`Self::run`], ending early with [`Error::Interrupted`] once
    /// `shutdown` completes
    ///
    /// # Errors
    ///
    /// As [`Self::run`], plus [`Error::Interrupted`]. Teardown still runs.
    pub async fn run_until<F, S>(
        &self,
        open_input: F,
        pipeline: &TurnPipeline,
        dispatcher: &dyn ReplyDispatcher,
        shutdown: S,
    ) -> Result<()>
    where
        F: FnOnce(InputMode) -> Result<Box<dyn InputSource>>,
        S: Future<Output = ()>,
    {
        self.signals.clear_quietly(&SignalName::ALL);

        let mut child = self.front_end.spawn()?;
        let result = tokio::select! {
            result = self.session(&mut child, open_input, pipeline, dispatcher) => result,
            () = shutdown => Err(Error::Interrupted),
        };
        self.teardown(&mut child).await;

        if let Err(e) = pipeline.save_history().await {
            tracing::warn!(error = %e, "failed to save history");
        }

        match &result {
            Ok(()) => tracing::info!("session ended"),
            Err(Error::Interrupted) => tracing::info!("session interrupted"),
            Err(e) => tracing::error!(error = %e, "session failed"),
        }
        result
    }

    async fn session<F>(
        &self,
        child: &mut Child,
        open_input: F,
        pipeline: &TurnPipeline,
        dispatcher: &dyn ReplyDispatcher,
    ) -> Result<()>
    where
        F: FnOnce(InputMode) -> Result<Box<dyn InputSource>>,
    {
        let mode = self.handshake(child).await?;

        if mode == InputMode::Voice {
            self.signals.signal(SignalName::VoiceModeActive, None)?;
            tracing::info!("voice mode active, front-end chat suppressed");
        }

        let mut input = open_input(mode)?;
        println!("Using {mode} input mode. Say or type '{EXIT_WORD}' to quit.");
        run_input_loop(input.as_mut(), pipeline, dispatcher, Some(child)).await
    }

    /// Wait for `joined-channel` then `input-mode`, returning the chosen mode
    async fn handshake(&self, child: &mut Child) -> Result<InputMode> {
        tracing::info!(
            timeout = ?self.handshake_timeout,
            "waiting for the front-end to join a voice channel (use !join)"
        );
        self.await_record(SignalName::JoinedChannel, child).await?;
        tracing::info!("front-end joined a voice channel");

        tracing::info!("waiting for the input mode choice");
        self.await_record(SignalName::InputMode, child).await?;

        let mode = match self.signals.read_value(SignalName::InputMode) {
            Ok(Some(value)) => value.parse().unwrap_or_else(|e| {
                tracing::warn!(value = %value, error = %e, "invalid input mode, defaulting to text");
                InputMode::Text
            }),
            Ok(None) => {
                tracing::warn!("input mode record vanished, defaulting to text");
                InputMode::Text
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot read input mode, defaulting to text");
                InputMode::Text
            }
        };

        tracing::info!(mode = %mode, "input mode selected");
        Ok(mode)
    }

    async fn await_record(&self, name: SignalName, child: &mut Child) -> Result<()> {
        match self.signals.wait_for(name, self.handshake_timeout, child).await {
            WaitOutcome::Signaled => Ok(()),
            WaitOutcome::TimedOut => Err(Error::HandshakeTimeout {
                record: name.as_str(),
                waited: self.handshake_timeout,
            }),
            WaitOutcome::PeerDied(code) => Err(Error::FrontEndExited { code }),
        }
    }

    /// Remove `voice-mode-active`, stop the child, remove the handshake records
    async fn teardown(&self, child: &mut Child) {
        self.signals.clear_quietly(&[SignalName::VoiceModeActive]);

        match child.try_wait() {
            Ok(Some(status)) => tracing::info!(code = status.code(), "front-end already exited"),
            _ => match child.kill().await {
                Ok(()) => tracing::info!("front-end terminated"),
                Err(e) => tracing::warn!(error = %e, "failed to terminate front-end"),
            },
        }

        self.signals
            .clear_quietly(&[SignalName::JoinedChannel, SignalName::InputMode]);
    }
}

/// Run local turns until the exit word, end of input, or the peer exiting
///
/// # Errors
///
/// Returns error if the input source fails or `peer` exits
pub async fn run_input_loop(
    input: &mut dyn InputSource,
    pipeline: &TurnPipeline,
    dispatcher: &dyn ReplyDispatcher,
    mut peer: Option<&mut Child>,
) -> Result<()> {
    let speaker = SpeakerId::from(LOCAL_SPEAKER);

    loop {
        let next = tokio::select! {
            status = wait_peer(peer.as_deref_mut()) => {
                return Err(Error::FrontEndExited { code: status.and_then(|s| s.code()) });
            }
            next = input.next_input() => next?,
        };

        let text = match next {
            LocalInput::Closed => {
                tracing::info!("input closed");
                return Ok(());
            }
            LocalInput::Text(line) => line.trim().to_string(),
            LocalInput::Utterance(utterance) => {
                let started = Instant::now();
                match pipeline.transcribe(&utterance).await {
                    Some(text) => {
                        tracing::debug!(elapsed = ?started.elapsed(), "utterance transcribed");
                        text
                    }
                    None => {
                        tracing::info!("no speech recognized, listening again");
                        continue;
                    }
                }
            }
        };

        if text.is_empty() {
            continue;
        }
        if is_exit(&text) {
            tracing::info!("exit requested");
            return Ok(());
        }

        pipeline.handle_text(&speaker, &text, dispatcher).await;
        input.resume();
    }
}

/// Completes on Ctrl-C; never completes if the handler cannot be installed
pub async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

async fn wait_peer(peer: Option<&mut Child>) -> Option<std::process::ExitStatus> {
    match peer {
        Some(child) => child.wait().await.ok(),
        None => std::future::pending().await,
    }
}

/// Whether text asks to end the session
#[must_use]
pub fn is_exit(text: &str) -> bool {
    text.trim()
        .trim_end_matches(['.', '!'])
        .eq_ignore_ascii_case(EXIT_WORD)
}
