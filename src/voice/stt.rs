//! Speech-to-text (STT) processing

use async_trait::async_trait;

use crate::config::{DEFAULT_BASE_URL, SttProviderKind};
use crate::{Config, Error, Result};

/// Turns recorded audio into text
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe `audio`, encoded as `format` (e.g. "wav")
    ///
    /// # Errors
    ///
    /// Returns error if transcription fails
    async fn transcribe(&self, audio: &[u8], format: &str) -> Result<String>;
}

/// Response from OpenAI Whisper transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Response from Deepgram transcription API
#[derive(serde::Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(serde::Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

impl DeepgramResponse {
    fn into_transcript(self) -> String {
        self.results
            .channels
            .into_iter()
            .next()
            .and_then(|c| c.alternatives.into_iter().next())
            .map(|a| a.transcript)
            .unwrap_or_default()
    }
}

/// Transcribes speech through a hosted STT API
pub struct SpeechToText {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    provider: SttProviderKind,
}

impl SpeechToText {
    /// Create the provider selected in `config`
    ///
    /// # Errors
    ///
    /// Returns error if the provider's API key is missing
    pub fn from_config(config: &Config) -> Result<Self> {
        let model = config.voice.stt_model.clone();
        match config.voice.stt_provider {
            SttProviderKind::Whisper => Self::new_whisper_with_base_url(
                config.api_keys.openai.clone().unwrap_or_default(),
                model,
                config.llm.base_url.clone(),
            ),
            SttProviderKind::Deepgram => Self::new_deepgram(
                config.api_keys.deepgram.clone().unwrap_or_default(),
                model,
            ),
        }
    }

    /// Create a new STT instance using `OpenAI` Whisper
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_whisper(api_key: String, model: String) -> Result<Self> {
        Self::new_whisper_with_base_url(api_key, model, DEFAULT_BASE_URL.to_string())
    }

    /// Create a Whisper instance against an OpenAI-compatible host
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_whisper_with_base_url(
        api_key: String,
        model: String,
        base_url: String,
    ) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(
                "OpenAI API key required for Whisper".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            base_url,
            provider: SttProviderKind::Whisper,
        })
    }

    /// Create a new STT instance using Deepgram
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_deepgram(api_key: String, model: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("Deepgram API key required".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            base_url: "https://api.deepgram.com/v1".to_string(),
            provider: SttProviderKind::Deepgram,
        })
    }

    /// Transcribe using OpenAI Whisper
    async fn transcribe_whisper(&self, audio: &[u8], format: &str) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), format, "starting Whisper transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio.to_vec())
                    .file_name(format!("audio.{format}"))
                    .mime_str(&content_type(format))
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone());

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .inspect_err(|e| tracing::error!(error = %e, "Whisper request failed"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Whisper API error");
            return Err(Error::Stt(format!("Whisper API error {status}: {body}")));
        }

        let result: WhisperResponse = response
            .json()
            .await
            .inspect_err(|e| tracing::error!(error = %e, "failed to parse Whisper response"))?;

        Ok(result.text)
    }

    /// Transcribe using Deepgram
    async fn transcribe_deepgram(&self, audio: &[u8], format: &str) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), format, "starting Deepgram transcription");

        let url = format!(
            "{}/listen?model={}&punctuate=true",
            self.base_url, self.model
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Token {}", self.api_key))
            .header("Content-Type", content_type(format))
            .body(audio.to_vec())
            .send()
            .await
            .inspect_err(|e| tracing::error!(error = %e, "Deepgram request failed"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Deepgram API error");
            return Err(Error::Stt(format!("Deepgram API error {status}: {body}")));
        }

        let result: DeepgramResponse = response
            .json()
            .await
            .inspect_err(|e| tracing::error!(error = %e, "failed to parse Deepgram response"))?;

        Ok(result.into_transcript())
    }
}

#[async_trait]
impl Transcriber for SpeechToText {
    async fn transcribe(&self, audio: &[u8], format: &str) -> Result<String> {
        let transcript = match self.provider {
            SttProviderKind::Whisper => self.transcribe_whisper(audio, format).await?,
            SttProviderKind::Deepgram => self.transcribe_deepgram(audio, format).await?,
        };

        tracing::info!(transcript = %transcript, "transcription complete");
        Ok(transcript)
    }
}

/// MIME type for a declared audio format
fn content_type(format: &str) -> String {
    match format {
        "mp3" => "audio/mpeg".to_string(),
        "wav" => "audio/wav".to_string(),
        other => format!("audio/{other}"),
    }
}
