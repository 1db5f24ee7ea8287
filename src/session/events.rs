//! Messages between the front end and the session

use serde::{Deserialize, Serialize};

use crate::llm::ChatMessage;

/// A request from the front end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum UiCommand {
    /// Chat model for subsequent turns
    Model(String),
    /// Voice (tone) for subsequent turns
    Tone(String),
    /// Emotion tag for subsequent turns
    Emotion(String),
    /// Begin recording a spoken question
    AudioStart,
    /// Stop recording, transcribe and ask
    AudioStop,
    /// Ask a typed question
    Question(String),
    /// Abandon the turn in flight
    Cancel,
}

/// A notification for the front end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum UiUpdate {
    /// Conversation history after a finished turn
    History(Vec<ChatMessage>),
    /// Text recognized from a recording
    Transcript(String),
    /// A turn ended with an error
    TurnFailed(String),
}

/// Settings snapshot taken when a turn starts
#[derive(Debug, Clone, PartialEq)]
pub struct TurnSettings {
    pub model: String,
    pub voice: String,
    pub emotion: String,
    pub speed: f64,
}
