//! Filesystem-backed signal records
//!
//! The orchestrator and the front-end run as separate processes and share
//! lifecycle state only through small files in a common directory. A record's
//! existence is the signal; `input-mode` additionally carries a value.
//!
//! Writes go to a temporary file in the same directory which is then renamed
//! over the record. Rename is atomic on POSIX filesystems, so a reader sees
//! either no record or the whole payload. Filesystems without atomic rename
//! (some network mounts) are not supported.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

use crate::{Error, Result};

/// Extension used for record files
const SIGNAL_EXTENSION: &str = "signal";

/// Names of the lifecycle records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalName {
    /// Front-end has joined a voice channel
    JoinedChannel,
    /// User picked an input mode; value is "voice" or "text"
    InputMode,
    /// Orchestrator owns voice input; front-end suppresses chat and voice turns
    VoiceModeActive,
}

impl SignalName {
    /// Every record, in handshake order
    pub const ALL: [Self; 3] = [Self::JoinedChannel, Self::InputMode, Self::VoiceModeActive];

    /// Stable record name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::JoinedChannel => "joined-channel",
            Self::InputMode => "input-mode",
            Self::VoiceModeActive => "voice-mode-active",
        }
    }

    /// Payload written when the caller does not supply one
    const fn marker(self) -> &'static str {
        match self {
            Self::JoinedChannel => "joined",
            Self::InputMode => "text",
            Self::VoiceModeActive => "active",
        }
    }
}

impl fmt::Display for SignalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input mode chosen by the user in the chat platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    /// Local microphone
    Voice,
    /// Typed lines on the terminal
    Text,
}

impl InputMode {
    /// Wire value stored in the `input-mode` record
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Voice => "voice",
            Self::Text => "text",
        }
    }
}

impl fmt::Display for InputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InputMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "voice" => Ok(Self::Voice),
            "text" => Ok(Self::Text),
            other => Err(Error::Signal(format!("unrecognized input mode '{other}'"))),
        }
    }
}

/// Liveness of the process on the other side of the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Still running
    Running,
    /// Exited, with its exit code when it had one
    Exited(Option<i32>),
}

/// Checked on every poll while waiting for a record
pub trait PeerProbe {
    /// Current state of the peer; must not block
    fn poll_state(&mut self) -> PeerState;
}

impl PeerProbe for tokio::process::Child {
    fn poll_state(&mut self) -> PeerState {
        match self.try_wait() {
            Ok(Some(status)) => PeerState::Exited(status.code()),
            Ok(None) => PeerState::Running,
            Err(e) => {
                tracing::warn!(error = %e, "failed to poll peer process");
                PeerState::Running
            }
        }
    }
}

/// Probe for waits that have no peer process to watch
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPeer;

impl PeerProbe for NoPeer {
    fn poll_state(&mut self) -> PeerState {
        PeerState::Running
    }
}

/// Result of waiting for a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Record appeared
    Signaled,
    /// Deadline passed without the record
    TimedOut,
    /// Peer process exited first
    PeerDied(Option<i32>),
}

/// Mailbox of signal records in one directory
#[derive(Debug, Clone)]
pub struct SignalChannel {
    dir: PathBuf,
    poll_interval: Duration,
}

impl SignalChannel {
    /// Open a channel rooted at `dir`, creating the directory if needed
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created
    pub fn open(dir: impl Into<PathBuf>, poll_interval: Duration) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            Error::Signal(format!("cannot create signal dir {}: {e}", dir.display()))
        })?;

        if poll_interval.is_zero() {
            return Err(Error::Config("signal poll interval must be non-zero".to_string()));
        }

        Ok(Self { dir, poll_interval })
    }

    /// Directory holding the records
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Interval between polls in [`Self::wait_for`]
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Path of a record file
    #[must_use]
    pub fn path(&self, name: SignalName) -> PathBuf {
        self.dir.join(format!("{}.{SIGNAL_EXTENSION}", name.as_str()))
    }

    /// Create or overwrite a record
    ///
    /// # Errors
    ///
    /// Returns error if the record cannot be written
    pub fn signal(&self, name: SignalName, value: Option<&str>) -> Result<()> {
        let payload = value.unwrap_or_else(|| name.marker());
        let target = self.path(name);

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(payload.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&target)
            .map_err(|e| Error::Signal(format!("cannot write {}: {}", target.display(), e.error)))?;

        tracing::debug!(record = %name, value = payload, "signal written");
        Ok(())
    }

    /// Whether a record exists
    #[must_use]
    pub fn is_signaled(&self, name: SignalName) -> bool {
        self.path(name).try_exists().unwrap_or(false)
    }

    /// Read a record's value, `None` if absent
    ///
    /// # Errors
    ///
    /// Returns error if the record exists but cannot be read
    pub fn read_value(&self, name: SignalName) -> Result<Option<String>> {
        match std::fs::read_to_string(self.path(name)) {
            Ok(value) => Ok(Some(value.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a record; returns whether it existed
    ///
    /// # Errors
    ///
    /// Returns error if the record exists but cannot be removed
    pub fn clear(&self, name: SignalName) -> Result<bool> {
        match std::fs::remove_file(self.path(name)) {
            Ok(()) => {
                tracing::debug!(record = %name, "signal cleared");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove several records, logging instead of failing
    pub fn clear_quietly(&self, names: &[SignalName]) {
        for &name in names {
            match self.clear(name) {
                Ok(true) => tracing::info!(record = %name, "removed signal record"),
                Ok(false) => {}
                Err(e) => tracing::warn!(record = %name, error = %e, "failed to remove signal record"),
            }
        }
    }

    /// Wait until a record appears, the timeout elapses, or the peer exits
    ///
    /// The deadline takes priority over a poll that lands on the same instant,
    /// but a record already present at the deadline still counts.
    pub async fn wait_for(
        &self,
        name: SignalName,
        timeout: Duration,
        peer: &mut impl PeerProbe,
    ) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = tokio::time::sleep_until(deadline) => {
                    return if self.is_signaled(name) {
                        WaitOutcome::Signaled
                    } else {
                        WaitOutcome::TimedOut
                    };
                }
                _ = ticker.tick() => {
                    if self.is_signaled(name) {
                        return WaitOutcome::Signaled;
                    }
                    if let PeerState::Exited(code) = peer.poll_state() {
                        return WaitOutcome::PeerDied(code);
                    }
                    tracing::trace!(record = %name, "signal not present yet");
                }
            }
        }
    }
}
