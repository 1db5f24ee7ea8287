//! Configuration management for murmur

pub mod file;

use std::time::Duration;

use self::file::MurmurConfigFile;
use crate::{Error, Result};

/// Default OpenAI-compatible API base URL
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// murmur configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Chat model configuration
    pub llm: LlmConfig,

    /// Voice configuration
    pub voice: VoiceConfig,

    /// Playback engine tuning
    pub playback: PlaybackConfig,

    /// Pipeline wiring
    pub pipeline: PipelineConfig,

    /// API keys
    pub api_keys: ApiKeys,
}

/// Chat completion configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Model identifier sent with each chat request
    pub model: String,

    /// OpenAI-compatible base URL (without trailing `/chat/completions`)
    pub base_url: String,

    /// Max tokens per reply
    pub max_tokens: u32,
}

/// TTS provider backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsProviderKind {
    OpenAI,
    ElevenLabs,
}

/// STT provider backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SttProviderKind {
    Whisper,
    Deepgram,
}

/// Voice processing configuration
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// TTS backend
    pub tts_provider: TtsProviderKind,

    /// TTS model (e.g. "tts-1", "`eleven_multilingual_v2`")
    pub tts_model: String,

    /// TTS voice identifier
    pub voice: String,

    /// Emotion tag (e.g. "neutral", "angry", "exciting", "amaze")
    pub emotion: String,

    /// TTS speed multiplier (0.25 to 4.0)
    pub speed: f64,

    /// STT backend
    pub stt_provider: SttProviderKind,

    /// STT model (e.g. "whisper-1", "nova-2")
    pub stt_model: String,

    /// Capture process command line, program first
    pub capture_command: Vec<String>,

    /// Format written by the capture command, declared to the transcriber
    pub capture_format: String,
}

/// Playback engine tuning
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Output device sample rate; the synthesizer must produce the same rate
    pub sample_rate: u32,

    /// Bytes buffered before the decoder is first constructed
    pub min_buffer_bytes: usize,

    /// Interval at which the supervisor checks the player status
    pub poll_interval: Duration,

    /// Decoder rebuilds allowed before playback is abandoned
    pub max_init_attempts: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            min_buffer_bytes: 200,
            poll_interval: Duration::from_millis(100),
            max_init_attempts: 10,
        }
    }
}

/// Pipeline channel and segmentation configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Capacity of the chat fragment channel
    pub text_capacity: usize,

    /// Capacity of the sentence channel
    pub sentence_capacity: usize,

    /// Capacity of the audio chunk channel
    pub audio_capacity: usize,

    /// Characters that terminate a sentence
    pub sentence_delimiters: String,

    /// How often a waiting turn logs that another turn is still in flight
    pub gate_log_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            text_capacity: 1000,
            sentence_capacity: 16,
            audio_capacity: 1000,
            sentence_delimiters: "。！？".to_string(),
            gate_log_interval: Duration::from_secs(1),
        }
    }
}

/// API keys for external services
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// `OpenAI` API key (chat, Whisper and TTS)
    pub openai: Option<String>,

    /// `ElevenLabs` API key (optional TTS)
    pub elevenlabs: Option<String>,

    /// `Deepgram` API key (optional STT)
    pub deepgram: Option<String>,
}

impl Config {
    /// Load configuration from the environment and the optional TOML file
    ///
    /// # Errors
    ///
    /// Returns error if a provider name is unknown
    pub fn load() -> Result<Self> {
        Self::from_sources(file::load_config_file(), |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// Precedence is env > toml > default.
    ///
    /// # Errors
    ///
    /// Returns error if a provider name is unknown or a value is out of range
    pub fn from_sources<F>(fc: MurmurConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_keys = ApiKeys {
            openai: env("OPENAI_API_KEY").or(fc.api_keys.openai),
            elevenlabs: env("ELEVENLABS_API_KEY").or(fc.api_keys.elevenlabs),
            deepgram: env("DEEPGRAM_API_KEY").or(fc.api_keys.deepgram),
        };

        let llm = LlmConfig {
            model: env("MURMUR_MODEL")
                .or(fc.llm.model)
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            base_url: env("OPENAI_BASE_URL")
                .or_else(|| env("BASE_URL"))
                .filter(|s| !s.is_empty())
                .or(fc.llm.base_url)
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            max_tokens: fc.llm.max_tokens.unwrap_or(1000),
        };

        let tts_provider = match env("MURMUR_TTS_PROVIDER").or(fc.voice.tts_provider) {
            Some(name) => parse_tts_provider(&name)?,
            None => TtsProviderKind::OpenAI,
        };
        let stt_provider = match env("MURMUR_STT_PROVIDER").or(fc.voice.stt_provider) {
            Some(name) => parse_stt_provider(&name)?,
            None => SttProviderKind::Whisper,
        };

        let speed = fc.voice.speed.unwrap_or(1.0);
        if !(0.25..=4.0).contains(&speed) {
            return Err(Error::Config(format!(
                "voice.speed must be between 0.25 and 4.0, got {speed}"
            )));
        }

        let capture_command = fc
            .voice
            .capture_command
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| ["sox", "-d", "-t", "wav", "-"].map(String::from).to_vec());

        let voice = VoiceConfig {
            tts_provider,
            tts_model: env("MURMUR_TTS_MODEL")
                .or(fc.voice.tts_model)
                .unwrap_or_else(|| default_tts_model(tts_provider).to_string()),
            voice: env("MURMUR_VOICE")
                .or(fc.voice.voice)
                .unwrap_or_else(|| "alloy".to_string()),
            emotion: fc.voice.emotion.unwrap_or_else(|| "neutral".to_string()),
            speed,
            stt_provider,
            stt_model: env("MURMUR_STT_MODEL")
                .or(fc.voice.stt_model)
                .unwrap_or_else(|| default_stt_model(stt_provider).to_string()),
            capture_command,
            capture_format: fc.voice.capture_format.unwrap_or_else(|| "wav".to_string()),
        };

        let default = PlaybackConfig::default();
        let playback = PlaybackConfig {
            sample_rate: fc.playback.sample_rate.unwrap_or(default.sample_rate),
            min_buffer_bytes: fc
                .playback
                .min_buffer_bytes
                .unwrap_or(default.min_buffer_bytes),
            poll_interval: fc
                .playback
                .poll_interval_ms
                .map_or(default.poll_interval, Duration::from_millis),
            max_init_attempts: fc
                .playback
                .max_init_attempts
                .unwrap_or(default.max_init_attempts)
                .max(1),
        };

        let default = PipelineConfig::default();
        let pipeline = PipelineConfig {
            text_capacity: fc.pipeline.text_capacity.unwrap_or(default.text_capacity).max(1),
            sentence_capacity: fc
                .pipeline
                .sentence_capacity
                .unwrap_or(default.sentence_capacity)
                .max(1),
            audio_capacity: fc.pipeline.audio_capacity.unwrap_or(default.audio_capacity).max(1),
            sentence_delimiters: fc
                .pipeline
                .sentence_delimiters
                .filter(|d| !d.is_empty())
                .unwrap_or(default.sentence_delimiters),
            gate_log_interval: fc
                .pipeline
                .gate_log_interval_ms
                .map_or(default.gate_log_interval, Duration::from_millis),
        };

        Ok(Self {
            llm,
            voice,
            playback,
            pipeline,
            api_keys,
        })
    }
}

fn parse_tts_provider(name: &str) -> Result<TtsProviderKind> {
    match name.to_ascii_lowercase().as_str() {
        "openai" => Ok(TtsProviderKind::OpenAI),
        "elevenlabs" => Ok(TtsProviderKind::ElevenLabs),
        other => Err(Error::Config(format!("unknown TTS provider: {other}"))),
    }
}

fn parse_stt_provider(name: &str) -> Result<SttProviderKind> {
    match name.to_ascii_lowercase().as_str() {
        "whisper" | "openai" => Ok(SttProviderKind::Whisper),
        "deepgram" => Ok(SttProviderKind::Deepgram),
        other => Err(Error::Config(format!("unknown STT provider: {other}"))),
    }
}

const fn default_tts_model(provider: TtsProviderKind) -> &'static str {
    match provider {
        TtsProviderKind::OpenAI => "tts-1",
        TtsProviderKind::ElevenLabs => "eleven_multilingual_v2",
    }
}

const fn default_stt_model(provider: SttProviderKind) -> &'static str {
    match provider {
        SttProviderKind::Whisper => "whisper-1",
        SttProviderKind::Deepgram => "nova-2",
    }
}
