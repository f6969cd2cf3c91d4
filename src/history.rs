//! Bounded conversation history
//!
//! Entries are kept oldest first and capped at the memory limit; appending
//! past the cap evicts from the front. The history can be persisted as a JSON
//! array so a companion remembers across sessions.

use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Who said a history line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The human
    User,
    /// The companion
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => f.write_str("User"),
            Self::Assistant => f.write_str("Assistant"),
        }
    }
}

/// One line of conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Speaker role
    pub speaker: Role,
    /// What was said
    pub text: String,
}

impl fmt::Display for HistoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.speaker, self.text)
    }
}

/// Most recent conversation lines, capped at `limit`
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    entries: VecDeque<HistoryEntry>,
    limit: usize,
}

impl ConversationHistory {
    /// Create an empty history holding at most `limit` entries
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit),
            limit,
        }
    }

    /// Load a persisted history, keeping only the newest `limit` entries
    ///
    /// A missing file yields an empty history.
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: &Path, limit: usize) -> Result<Self> {
        let mut history = Self::new(limit);
        if !path.exists() {
            return Ok(history);
        }

        let content = fs::read_to_string(path)?;
        let entries: Vec<HistoryEntry> = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("invalid history file {}: {e}", path.display())))?;
        for entry in entries {
            history.push_entry(entry);
        }

        tracing::debug!(path = %path.display(), entries = history.len(), "loaded history");
        Ok(history)
    }

    /// Persist as a JSON array
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self.entries)?;
        fs::write(path, content)?;
        tracing::debug!(path = %path.display(), entries = self.len(), "saved history");
        Ok(())
    }

    /// Record a user line
    pub fn push_user(&mut self, text: impl Into<String>) {
        self.push(Role::User, text);
    }

    /// Record an assistant line
    pub fn push_assistant(&mut self, text: impl Into<String>) {
        self.push(Role::Assistant, text);
    }

    /// Record a line, evicting the oldest past the cap
    pub fn push(&mut self, speaker: Role, text: impl Into<String>) {
        self.push_entry(HistoryEntry {
            speaker,
            text: text.into(),
        });
    }

    fn push_entry(&mut self, entry: HistoryEntry) {
        if self.limit == 0 {
            return;
        }
        while self.entries.len() >= self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Entries, oldest first
    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    /// Entries rendered as `Role: text`, oldest first
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.entries.iter().map(ToString::to_string).collect()
    }

    /// Maximum number of entries kept
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Append-only log of every chat line seen, one `author: text` per line
#[derive(Debug, Clone)]
pub struct ChatLog {
    path: PathBuf,
}

impl ChatLog {
    /// Log to `path`, creating it on first write
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Where lines are appended
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one chat line
    ///
    /// # Errors
    ///
    /// Returns error if the log cannot be opened or written
    pub fn append(&self, author: &str, text: &str) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        // one line per message
        let text = text.replace(['\r', '\n'], " ");
        writeln!(file, "{author}: {text}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_role_prefixed_lines() {
        let mut history = ConversationHistory::new(10);
        history.push_user("hello");
        history.push_assistant("hi there");
        assert_eq!(history.lines(), vec!["User: hello", "Assistant: hi there"]);
    }

    #[test]
    fn evicts_oldest_first() {
        let mut history = ConversationHistory::new(3);
        for i in 0..5 {
            history.push_user(format!("m{i}"));
        }
        assert_eq!(history.lines(), vec!["User: m2", "User: m3", "User: m4"]);
    }

    #[test]
    fn zero_limit_keeps_nothing() {
        let mut history = ConversationHistory::new(0);
        history.push_user("hello");
        assert!(history.is_empty());
    }

    #[test]
    fn save_and_load_respects_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.json");

        let mut history = ConversationHistory::new(10);
        history.push_user("my number is 7");
        history.push_assistant("noted");
        history.push_user("bye");
        history.save(&path).unwrap();

        let loaded = ConversationHistory::load(&path, 2).unwrap();
        assert_eq!(loaded.lines(), vec!["Assistant: noted", "User: bye"]);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = ConversationHistory::load(&dir.path().join("absent.json"), 5).unwrap();
        assert!(loaded.is_empty());
        assert_eq!(loaded.limit(), 5);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.json");
        fs::write(&path, "not json").unwrap();
        assert!(ConversationHistory::load(&path, 5).is_err());
    }

    #[test]
    fn chat_log_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = ChatLog::new(dir.path().join("logs").join("chat_log.txt"));

        log.append("alice", "hi").unwrap();
        log.append("bob", "two\nlines").unwrap();

        let content = fs::read_to_string(log.path()).unwrap();
        assert_eq!(content, "alice: hi\nbob: two lines\n");
    }
}
