//! Twitch chat relay over IRC
//!
//! Twitch chat has no voice channels, so this is not a [`super::FrontEnd`]
//! platform. The relay answers every chat message in the channel it was posted
//! in and appends each message to a chat log. The bot's own messages are
//! ignored.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};

use crate::history::ChatLog;
use crate::turn::TurnPipeline;
use crate::{Error, Result};

/// Twitch IRC endpoint (plain TCP)
pub const TWITCH_IRC_ADDR: &str = "irc.chat.twitch.tv:6667";

/// Twitch rejects longer chat messages
const MAX_MESSAGE_CHARS: usize = 500;

/// Message queue depth between the reader task and the relay loop
const MESSAGE_BUFFER: usize = 64;

/// Login details for the chat connection
#[derive(Debug, Clone)]
pub struct TwitchSettings {
    /// Bot account name
    pub nick: String,
    /// OAuth token, with or without the `oauth:` prefix
    pub token: String,
    /// Channel to join, with or without `#`
    pub channel: String,
}

/// A chat line from another user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Login name of the author
    pub author: String,
    /// Channel, without `#`
    pub channel: String,
    /// Message text
    pub text: String,
}

/// One parsed server line the relay cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrcLine {
    /// Keepalive that must be answered with `PONG`
    Ping(String),
    /// A chat message
    Privmsg(ChatMessage),
}

/// Parse a raw IRC line; `None` for anything the relay ignores
#[must_use]
pub fn parse_line(line: &str) -> Option<IrcLine> {
    let line = line.trim_end_matches(['\r', '\n']);

    // IRCv3 tags come first when requested
    let line = match line.strip_prefix('@') {
        Some(tagged) => tagged.split_once(' ')?.1,
        None => line,
    };

    if let Some(token) = line.strip_prefix("PING ") {
        return Some(IrcLine::Ping(token.trim_start_matches(':').to_string()));
    }

    let rest = line.strip_prefix(':')?;
    let (prefix, rest) = rest.split_once(' ')?;
    let rest = rest.strip_prefix("PRIVMSG ")?;
    let (target, text) = rest.split_once(" :")?;
    let author = prefix.split_once('!').map_or(prefix, |(nick, _)| nick);

    Some(IrcLine::Privmsg(ChatMessage {
        author: author.to_string(),
        channel: target.trim_start_matches('#').to_string(),
        text: text.to_string(),
    }))
}

/// Split a reply into chat-sized lines
fn chat_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .flat_map(|line| {
            let chars: Vec<char> = line.chars().collect();
            chars
                .chunks(MAX_MESSAGE_CHARS)
                .map(|chunk| chunk.iter().collect::<String>())
                .collect::<Vec<_>>()
        })
        .collect()
}

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// A joined Twitch chat channel
pub struct TwitchChat {
    writer: Mutex<Writer>,
    nick: String,
    channel: String,
}

impl TwitchChat {
    /// Connect to Twitch IRC, log in and join the channel
    ///
    /// Returns the connection and the stream of other users' messages.
    ///
    /// # Errors
    ///
    /// Returns error if the token or channel is missing or the connection fails
    pub async fn connect(settings: &TwitchSettings) -> Result<(Arc<Self>, mpsc::Receiver<ChatMessage>)> {
        if settings.token.is_empty() {
            return Err(Error::Config("TWITCH_TOKEN is required for the Twitch relay".to_string()));
        }
        if settings.channel.is_empty() {
            return Err(Error::Config("twitch.channel is required for the Twitch relay".to_string()));
        }

        let stream = TcpStream::connect(TWITCH_IRC_ADDR)
            .await
            .map_err(|e| Error::Channel(format!("failed to reach Twitch chat: {e}")))?;
        Self::over(stream, settings).await
    }

    /// Run the chat protocol over an already open stream
    ///
    /// # Errors
    ///
    /// Returns error if the login lines cannot be written
    pub async fn over<S>(stream: S, settings: &TwitchSettings) -> Result<(Arc<Self>, mpsc::Receiver<ChatMessage>)>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let chat = Arc::new(Self {
            writer: Mutex::new(Box::new(writer)),
            nick: settings.nick.to_lowercase(),
            channel: settings.channel.trim_start_matches('#').to_lowercase(),
        });

        let token = settings.token.trim_start_matches("oauth:");
        chat.send_raw(&format!("PASS oauth:{token}")).await?;
        chat.send_raw(&format!("NICK {}", chat.nick)).await?;
        chat.send_raw(&format!("JOIN #{}", chat.channel)).await?;
        tracing::info!(nick = %chat.nick, channel = %chat.channel, "joined Twitch chat");

        let (tx, rx) = mpsc::channel(MESSAGE_BUFFER);
        let reader_chat = Arc::clone(&chat);
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "Twitch chat read failed");
                        break;
                    }
                };

                match parse_line(&line) {
                    Some(IrcLine::Ping(token)) => {
                        if let Err(e) = reader_chat.send_raw(&format!("PONG :{token}")).await {
                            tracing::warn!(error = %e, "failed to answer PING");
                        }
                    }
                    Some(IrcLine::Privmsg(message)) => {
                        if message.author.eq_ignore_ascii_case(&reader_chat.nick) {
                            continue;
                        }
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => tracing::trace!(line = %line, "ignored IRC line"),
                }
            }
            tracing::info!("Twitch chat connection closed");
        });

        Ok((chat, rx))
    }

    /// Joined channel, without `#`
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Post text to the joined channel, one chat message per line
    ///
    /// # Errors
    ///
    /// Returns error if the connection is gone
    pub async fn say(&self, text: &str) -> Result<()> {
        for line in chat_lines(text) {
            self.send_raw(&format!("PRIVMSG #{} :{line}", self.channel)).await?;
        }
        Ok(())
    }

    async fn send_raw(&self, line: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .map_err(|e| Error::Channel(format!("Twitch chat write failed: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::Channel(format!("Twitch chat write failed: {e}")))
    }
}

/// Answer chat messages until the connection closes
///
/// Every message is appended to `log` first. A message that gets no reply is
/// logged and skipped.
pub async fn relay(
    chat: &TwitchChat,
    mut messages: mpsc::Receiver<ChatMessage>,
    pipeline: &TurnPipeline,
    log: Option<&ChatLog>,
) {
    while let Some(message) = messages.recv().await {
        tracing::info!(author = %message.author, "{}", message.text);

        if let Some(log) = log
            && let Err(e) = log.append(&message.author, &message.text)
        {
            tracing::warn!(path = %log.path().display(), error = %e, "failed to write chat log");
        }

        let Some(reply) = pipeline.reply(&message.text).await else {
            continue;
        };
        if let Err(e) = chat.say(&reply).await {
            tracing::warn!(error = %e, "failed to send Twitch reply");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_privmsg() {
        let line = ":alice!alice@alice.tmi.twitch.tv PRIVMSG #stream :hello there :)\r\n";
        assert_eq!(
            parse_line(line),
            Some(IrcLine::Privmsg(ChatMessage {
                author: "alice".to_string(),
                channel: "stream".to_string(),
                text: "hello there :)".to_string(),
            }))
        );
    }

    #[test]
    fn parses_tagged_privmsg() {
        let line = "@badge-info=;color=#FF0000 :bob!bob@bob.tmi.twitch.tv PRIVMSG #stream :hi";
        let Some(IrcLine::Privmsg(message)) = parse_line(line) else {
            panic!("expected a chat message");
        };
        assert_eq!(message.author, "bob");
        assert_eq!(message.text, "hi");
    }

    #[test]
    fn parses_ping() {
        assert_eq!(
            parse_line("PING :tmi.twitch.tv"),
            Some(IrcLine::Ping("tmi.twitch.tv".to_string()))
        );
    }

    #[test]
    fn ignores_other_lines() {
        assert_eq!(parse_line(":tmi.twitch.tv 001 duet :Welcome, GLHF!"), None);
        assert_eq!(parse_line(":duet!duet@duet.tmi.twitch.tv JOIN #stream"), None);
        assert_eq!(parse_line(""), None);
    }

    #[test]
    fn long_replies_are_split() {
        let long = "a".repeat(MAX_MESSAGE_CHARS + 10);
        let lines = chat_lines(&format!("first\n\n{long}"));
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "first");
        assert_eq!(lines[1].len(), MAX_MESSAGE_CHARS);
        assert_eq!(lines[2].len(), 10);
    }
}
