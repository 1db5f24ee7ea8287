//! Voice processing module
//!
//! Handles audio capture, transcription, synthesis and playback.

mod capture;
mod engine;
mod playback;
mod stt;
mod tts;

pub use capture::AudioRecorder;
pub use engine::{PlaybackEngine, PlaybackState};
pub use playback::{
    AudioSink, BufferReader, DeviceSink, Mp3Player, PlaybackBuffer, Player, ReaderCancel,
};
pub use stt::{SpeechToText, Transcriber};
pub use tts::{AudioStream, Synthesizer, TextToSpeech, VoiceProfile};
