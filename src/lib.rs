//! duet - a voice-chat companion that takes turns with a room
//!
//! Two processes cooperate through a handful of filesystem records:
//! - The front-end connects to the chat platform, segments each speaker's
//!   voice into utterances, and runs one turn at a time per speaker
//! - The orchestrator launches the front-end, waits for it to join a voice
//!   channel and learn the user's input mode, then runs the local loop
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐   signal records   ┌──────────────────────────┐
//! │       Orchestrator       │ ◄────────────────► │        Front-end         │
//! │  handshake │ local loop  │  joined-channel    │  Discord │ segmenter     │
//! │  mic / stdin             │  input-mode        │  turn coordinator        │
//! └────────────┬─────────────┘  voice-mode-active └────────────┬─────────────┘
//!              │                                               │
//! ┌────────────▼───────────────────────────────────────────────▼─────────────┐
//! │                 Turn pipeline: STT → responder → TTS                      │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod frontend;
pub mod history;
pub mod orchestrator;
pub mod responder;
pub mod session;
pub mod signal;
pub mod turn;
pub mod voice;

pub use config::Config;
pub use error::{Error, Result};
pub use history::{ConversationHistory, HistoryEntry, Role};
pub use orchestrator::{InputSource, LocalInput, ProcessOrchestrator};
pub use responder::{ChatCompletionResponder, Persona, ResponderService};
pub use session::{ChannelRef, SessionState};
pub use signal::{InputMode, SignalChannel, SignalName, WaitOutcome};
pub use turn::{ReplyDispatcher, Submission, TurnCoordinator, TurnPipeline, TurnState};
