//! Conversation session
//!
//! A [`Session`] owns the conversation history and the long-lived
//! collaborators (chat source, synthesizer, transcriber, audio sink), and
//! runs one turn at a time through the streaming pipeline.

mod events;
mod gate;

pub use events::{TurnSettings, UiCommand, UiUpdate};
pub use gate::{TurnGate, TurnPermit};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{PipelineConfig, PlaybackConfig};
use crate::llm::{ChatMessage, ChatRequest, ChatSource, OpenAiChat};
use crate::pipeline::{
    Completion, SentenceSegmenter, run_completion, run_segmenter, run_synthesis,
};
use crate::voice::{
    AudioRecorder, AudioSink, DeviceSink, PlaybackEngine, SpeechToText, Synthesizer,
    TextToSpeech, Transcriber, VoiceProfile,
};
use crate::{Config, Error, Result};

/// External capabilities a session drives
#[derive(Clone)]
pub struct Services {
    pub chat: Arc<dyn ChatSource>,
    pub synth: Arc<dyn Synthesizer>,
    pub transcriber: Arc<dyn Transcriber>,
    pub sink: Arc<dyn AudioSink>,
}

struct Inner {
    services: Services,
    settings: RwLock<TurnSettings>,
    history: RwLock<Vec<ChatMessage>>,
    gate: TurnGate,
    recorder: tokio::sync::Mutex<AudioRecorder>,
    capture_format: String,
    updates: mpsc::Sender<UiUpdate>,
    pipeline: PipelineConfig,
    playback: PlaybackConfig,
    max_tokens: u32,
    current: Mutex<Option<CancellationToken>>,
}

/// Runs conversation turns and keeps their history
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    /// Create a session over the given services
    #[must_use]
    pub fn new(services: Services, config: &Config, updates: mpsc::Sender<UiUpdate>) -> Self {
        let settings = TurnSettings {
            model: config.llm.model.clone(),
            voice: config.voice.voice.clone(),
            emotion: config.voice.emotion.clone(),
            speed: config.voice.speed,
        };

        Self {
            inner: Arc::new(Inner {
                services,
                settings: RwLock::new(settings),
                history: RwLock::new(Vec::new()),
                gate: TurnGate::new(config.pipeline.gate_log_interval),
                recorder: tokio::sync::Mutex::new(AudioRecorder::new(
                    config.voice.capture_command.clone(),
                )),
                capture_format: config.voice.capture_format.clone(),
                updates,
                pipeline: config.pipeline.clone(),
                playback: config.playback.clone(),
                max_tokens: config.llm.max_tokens,
                current: Mutex::new(None),
            }),
        }
    }

    /// Create a session backed by the configured HTTP providers and the
    /// default audio output device
    ///
    /// # Errors
    ///
    /// Returns error if a required API key is missing or the output device
    /// cannot be opened
    pub fn from_config(config: &Config, updates: mpsc::Sender<UiUpdate>) -> Result<Self> {
        let chat = OpenAiChat::new(
            config.api_keys.openai.clone().unwrap_or_default(),
            config.llm.base_url.clone(),
        )?;
        let synth = TextToSpeech::from_config(config)?;
        let transcriber = SpeechToText::from_config(config)?;
        let sink = DeviceSink::open(config.playback.sample_rate)?;

        tracing::info!(
            model = %config.llm.model,
            base_url = %config.llm.base_url,
            tts = ?config.voice.tts_provider,
            stt = ?config.voice.stt_provider,
            "session ready"
        );

        let services = Services {
            chat: Arc::new(chat),
            synth: Arc::new(synth),
            transcriber: Arc::new(transcriber),
            sink: Arc::new(sink),
        };
        Ok(Self::new(services, config, updates))
    }

    /// Run one turn: wait for any turn in flight, stream the reply through
    /// synthesis to the speakers, and record it in the history
    ///
    /// The assistant message is appended even when a stage fails, holding
    /// whatever text arrived before the failure.
    ///
    /// # Errors
    ///
    /// Returns the first stage error, or [`Error::Cancelled`]
    pub async fn ask(&self, question: impl Into<String>) -> Result<String> {
        let question = question.into();
        let permit = self.inner.gate.acquire().await?;

        let span = tracing::info_span!("turn", id = %Uuid::new_v4());
        self.run_turn(question, permit).instrument(span).await
    }

    async fn run_turn(&self, question: String, _permit: TurnPermit) -> Result<String> {
        let inner = &self.inner;
        let cancel = CancellationToken::new();
        *lock(&inner.current) = Some(cancel.clone());

        let settings = self.settings();
        let messages = {
            let mut history = inner.history.write().unwrap_or_else(PoisonError::into_inner);
            history.push(ChatMessage::user(question));
            history.clone()
        };

        tracing::info!(model = %settings.model, voice = %settings.voice, "turn started");

        let request = ChatRequest {
            model: settings.model,
            messages,
            max_tokens: inner.max_tokens,
        };
        let profile = VoiceProfile {
            voice: settings.voice,
            emotion: settings.emotion,
            speed: settings.speed,
        };

        let (text_tx, text_rx) = mpsc::channel(inner.pipeline.text_capacity.max(1));
        let (sentence_tx, sentence_rx) = mpsc::channel(inner.pipeline.sentence_capacity.max(1));
        let (audio_tx, audio_rx) = mpsc::channel(inner.pipeline.audio_capacity.max(1));

        let completion = tokio::spawn(
            run_completion(
                Arc::clone(&inner.services.chat),
                request,
                text_tx,
                cancel.clone(),
            )
            .in_current_span(),
        );
        let segmenter = tokio::spawn(
            run_segmenter(
                SentenceSegmenter::new(&inner.pipeline.sentence_delimiters),
                text_rx,
                sentence_tx,
                cancel.clone(),
            )
            .in_current_span(),
        );
        let synthesis = tokio::spawn(
            run_synthesis(
                Arc::clone(&inner.services.synth),
                profile,
                sentence_rx,
                audio_tx,
                cancel.clone(),
            )
            .in_current_span(),
        );
        let engine = PlaybackEngine::new(
            audio_rx,
            Arc::clone(&inner.services.sink),
            inner.playback.clone(),
            cancel.clone(),
        );
        let playback = tokio::spawn(async move { engine.run().await }.in_current_span());

        let (completion, segmented, synthesized, played) =
            tokio::join!(completion, segmenter, synthesis, playback);

        let Completion { text, result } = completion.unwrap_or_else(|e| Completion {
            text: String::new(),
            result: Err(joined("completion", &e)),
        });

        let history = {
            let mut history = inner.history.write().unwrap_or_else(PoisonError::into_inner);
            history.push(ChatMessage::assistant(text.clone()));
            history.clone()
        };
        *lock(&inner.current) = None;
        self.publish(UiUpdate::History(history)).await;

        let outcome = [
            result,
            flatten("segmenter", segmented),
            flatten("synthesis", synthesized),
            flatten("playback", played),
        ]
        .into_iter()
        .find_map(Result::err);

        match outcome {
            None => {
                tracing::info!(chars = text.chars().count(), "turn complete");
                Ok(text)
            }
            Some(e) => {
                tracing::warn!(error = %e, chars = text.chars().count(), "turn failed");
                self.publish(UiUpdate::TurnFailed(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// Apply a front-end command
    ///
    /// Questions, including transcribed recordings, run as background turns;
    /// their outcome arrives as [`UiUpdate`]s.
    ///
    /// # Errors
    ///
    /// Returns error if recording or transcription fails
    pub async fn dispatch(&self, command: UiCommand) -> Result<()> {
        match command {
            UiCommand::Model(model) => {
                tracing::info!(model = %model, "model selected");
                self.update_settings(|s| s.model = model);
            }
            UiCommand::Tone(voice) => {
                tracing::info!(voice = %voice, "tone selected");
                self.update_settings(|s| s.voice = voice);
            }
            UiCommand::Emotion(emotion) => {
                tracing::info!(emotion = %emotion, "emotion selected");
                self.update_settings(|s| s.emotion = emotion);
            }
            UiCommand::AudioStart => self.inner.recorder.lock().await.start()?,
            UiCommand::AudioStop => {
                let transcript = self.transcribe_recording().await?;
                if transcript.is_empty() {
                    tracing::warn!("nothing recognized in recording");
                    return Ok(());
                }
                self.publish(UiUpdate::Transcript(transcript.clone())).await;
                self.spawn_turn(transcript);
            }
            UiCommand::Question(question) => {
                let question = question.trim();
                if !question.is_empty() {
                    self.spawn_turn(question.to_string());
                }
            }
            UiCommand::Cancel => {
                if !self.cancel_turn() {
                    tracing::debug!("no turn to cancel");
                }
            }
        }
        Ok(())
    }

    /// Run a turn in the background
    pub fn spawn_turn(&self, question: String) -> JoinHandle<Result<String>> {
        let session = self.clone();
        tokio::spawn(async move { session.ask(question).await })
    }

    /// Cancel the turn in flight; `false` if there is none
    pub fn cancel_turn(&self) -> bool {
        match lock(&self.inner.current).as_ref() {
            Some(token) => {
                tracing::info!("cancelling turn");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether a turn is in flight
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.inner.gate.is_busy()
    }

    /// Whether the recorder is running
    pub async fn is_recording(&self) -> bool {
        self.inner.recorder.lock().await.is_recording()
    }

    /// Snapshot of the conversation so far
    #[must_use]
    pub fn history(&self) -> Vec<ChatMessage> {
        self.inner
            .history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Settings the next turn will use
    #[must_use]
    pub fn settings(&self) -> TurnSettings {
        self.inner
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update_settings(&self, apply: impl FnOnce(&mut TurnSettings)) {
        let mut settings = self
            .inner
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        apply(&mut settings);
    }

    async fn transcribe_recording(&self) -> Result<String> {
        let audio = {
            let mut recorder = self.inner.recorder.lock().await;
            recorder.stop().await?;
            recorder.buffer().to_vec()
        };

        if audio.is_empty() {
            return Err(Error::Capture("recording is empty".to_string()));
        }

        let transcript = self
            .inner
            .services
            .transcriber
            .transcribe(&audio, &self.inner.capture_format)
            .await?;
        Ok(transcript.trim().to_string())
    }

    async fn publish(&self, update: UiUpdate) {
        if self.inner.updates.send(update).await.is_err() {
            tracing::debug!("front end gone, update dropped");
        }
    }
}

fn joined(stage: &str, e: &tokio::task::JoinError) -> Error {
    Error::Pipeline(format!("{stage} stage failed: {e}"))
}

fn flatten(stage: &str, joined_result: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined_result.unwrap_or_else(|e| Err(joined(stage, &e)))
}
