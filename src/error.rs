//! Error types for murmur

use thiserror::Error;

/// Result type alias for murmur operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a conversation turn
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Chat completion stream error
    #[error("chat error: {0}")]
    Chat(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Capture process error
    #[error("capture error: {0}")]
    Capture(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Decoder construction or decode error
    #[error("decoder error: {0}")]
    Decoder(String),

    /// Turn was cancelled before it finished
    #[error("turn cancelled")]
    Cancelled,

    /// A pipeline stage panicked or its channel broke unexpectedly
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
