//! Reply generation
//!
//! The responder sees the newest history lines plus the new prompt and
//! returns one short, speakable reply.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

static STAGE_SYMBOLS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[*()]").expect("valid regex"));

static DOT_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\.{2,}").expect("valid regex"));

static STAGE_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:sigh|whisper|dramatic pause)\b").expect("valid regex")
});

/// Produces a reply to a prompt given recent conversation
#[async_trait]
pub trait ResponderService: Send + Sync {
    /// Reply to `prompt`, considering at most the last `limit` history lines
    ///
    /// # Errors
    ///
    /// Returns error if no reply could be produced
    async fn respond(&self, prompt: &str, history: &[String], limit: usize) -> Result<String>;
}

/// Who the companion is
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Persona {
    /// Name the companion answers to
    pub name: String,
    /// One-line character description
    pub description: String,
}

impl Default for Persona {
    fn default() -> Self {
        Self {
            name: "Miku".to_string(),
            description: "an AI VTuber known for deadpan humor and sarcasm".to_string(),
        }
    }
}

impl Persona {
    /// Build the full prompt for one turn
    #[must_use]
    pub fn render_prompt(&self, prompt: &str, history: &[String], limit: usize) -> String {
        let start = history.len().saturating_sub(limit);
        let memory = history[start..].join("\n");

        format!(
            "You are {name}, {description}.\n\
             - Stay playful, witty, and mischievous, but never be too aggressive.\n\
             - Never use asterisks (*) or stage directions\n\
             - Avoid dramatic pauses, sighs, or whispers\n\
             - Deliver information directly first, then add humor\n\
             - Keep responses concise (1-2 sentences max)\n\
             - Always remember numbers/names accurately\n\
             \n\
             Conversation History:\n\
             {memory}\n\
             \n\
             User: {prompt}\n\
             {name}:",
            name = self.name,
            description = self.description,
        )
    }
}

/// Remove stage directions and theatrical filler from a model reply
#[must_use]
pub fn clean_response(text: &str) -> String {
    let text = STAGE_SYMBOLS.replace_all(text, "");
    let text = DOT_RUN.replace_all(&text, ".");
    let text = STAGE_WORDS.replace_all(&text, "");
    text.trim().to_string()
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

/// `OpenAI`-compatible `/chat/completions` client
pub struct ChatCompletionResponder {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    persona: Persona,
}

impl ChatCompletionResponder {
    /// Create a responder
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(api_url: String, api_key: String, model: String, persona: Persona) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("responder API key required".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_url,
            api_key,
            model,
            persona,
        })
    }
}

#[async_trait]
impl ResponderService for ChatCompletionResponder {
    async fn respond(&self, prompt: &str, history: &[String], limit: usize) -> Result<String> {
        let full_prompt = self.persona.render_prompt(prompt, history, limit);
        let request = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: &full_prompt,
            }],
        };

        tracing::debug!(model = %self.model, history = history.len().min(limit), "requesting reply");

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Responder(format!("API error {status}: {body}")));
        }

        let body: ChatResponse = response.json().await?;
        let content = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::Responder("response had no choices".to_string()))?;

        let reply = clean_response(&content);
        tracing::info!(reply = %reply, "reply generated");
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_stage_directions() {
        assert_eq!(
            clean_response("*sigh* Well... (laughs) fine"),
            "Well. laughs fine"
        );
    }

    #[test]
    fn stage_words_are_case_insensitive_whole_words() {
        assert_eq!(clean_response("WHISPER it, sighing"), "it, sighing");
        assert_eq!(clean_response("a dramatic pause here"), "a  here");
    }

    #[test]
    fn prompt_includes_only_recent_history() {
        let persona = Persona::default();
        let history = vec![
            "User: one".to_string(),
            "Assistant: two".to_string(),
            "User: three".to_string(),
        ];
        let prompt = persona.render_prompt("four", &history, 2);

        assert!(!prompt.contains("User: one"));
        assert!(prompt.contains("Assistant: two\nUser: three"));
        assert!(prompt.ends_with("User: four\nMiku:"));
    }

    #[test]
    fn prompt_tolerates_empty_history() {
        let prompt = Persona::default().render_prompt("hi", &[], 20);
        assert!(prompt.contains("Conversation History:\n\n\nUser: hi"));
    }

    #[test]
    fn missing_key_rejected() {
        let result = ChatCompletionResponder::new(
            "https://example.invalid".into(),
            String::new(),
            "m".into(),
            Persona::default(),
        );
        assert!(result.is_err());
    }
}
