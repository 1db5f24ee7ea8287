//! murmur - streaming voice assistant
//!
//! Speak (or type) a question; the reply is spoken back while the language
//! model is still generating it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 Front end (console / commands)               │
//! └───────────────┬───────────────────────────────▲──────────────┘
//!        UiCommand│                               │UiUpdate
//! ┌───────────────▼───────────────────────────────┴──────────────┐
//! │  Session: turn gate │ history │ recorder → transcriber       │
//! └───────────────┬──────────────────────────────────────────────┘
//!                 │ one turn
//! ┌───────────────▼──────────────────────────────────────────────┐
//! │  chat stream → segmenter → synthesis → playback engine       │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod console;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod session;
pub mod voice;

pub use config::Config;
pub use error::{Error, Result};
pub use session::{Services, Session, UiCommand, UiUpdate};
