//! Text-to-speech (TTS) processing

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;

use crate::config::{DEFAULT_BASE_URL, TtsProviderKind};
use crate::{Config, Error, Result};

/// Encoded audio for one utterance, in arrival order
pub type AudioStream = BoxStream<'static, Result<Bytes>>;

/// Voice settings held fixed for a whole turn
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceProfile {
    /// Provider voice identifier
    pub voice: String,
    /// Emotion tag; "neutral" means no styling
    pub emotion: String,
    /// Speed multiplier
    pub speed: f64,
}

/// Turns text into a stream of encoded audio chunks
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Start synthesizing `text`
    ///
    /// # Errors
    ///
    /// Returns error if the request is rejected; failures after the first
    /// chunk are yielded as stream items
    async fn synthesize(&self, text: &str, profile: &VoiceProfile) -> Result<AudioStream>;
}

/// Synthesizes speech through a hosted TTS API
pub struct TextToSpeech {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    provider: TtsProviderKind,
}

impl TextToSpeech {
    /// Create the provider selected in `config`
    ///
    /// # Errors
    ///
    /// Returns error if the provider's API key is missing
    pub fn from_config(config: &Config) -> Result<Self> {
        let model = config.voice.tts_model.clone();
        match config.voice.tts_provider {
            TtsProviderKind::OpenAI => Self::new_openai_with_base_url(
                config.api_keys.openai.clone().unwrap_or_default(),
                model,
                config.llm.base_url.clone(),
            ),
            TtsProviderKind::ElevenLabs => Self::new_elevenlabs(
                config.api_keys.elevenlabs.clone().unwrap_or_default(),
                model,
            ),
        }
    }

    /// Create a new TTS instance using `OpenAI`
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_openai(api_key: String, model: String) -> Result<Self> {
        Self::new_openai_with_base_url(api_key, model, DEFAULT_BASE_URL.to_string())
    }

    /// Create a new TTS instance against an OpenAI-compatible host
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_openai_with_base_url(
        api_key: String,
        model: String,
        base_url: String,
    ) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("OpenAI API key required for TTS".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            base_url,
            provider: TtsProviderKind::OpenAI,
        })
    }

    /// Create a new TTS instance using `ElevenLabs`
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_elevenlabs(api_key: String, model: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(
                "ElevenLabs API key required for TTS".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            base_url: "https://api.elevenlabs.io/v1".to_string(),
            provider: TtsProviderKind::ElevenLabs,
        })
    }

    /// Send a synthesis request via OpenAI TTS
    async fn request_openai(&self, text: &str, profile: &VoiceProfile) -> Result<reqwest::Response> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f64,
            response_format: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            instructions: Option<String>,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice: &profile.voice,
            speed: profile.speed,
            response_format: "mp3",
            instructions: emotion_instructions(&profile.emotion),
        };

        let response = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        Ok(response)
    }

    /// Send a synthesis request via the `ElevenLabs` streaming endpoint
    async fn request_elevenlabs(
        &self,
        text: &str,
        profile: &VoiceProfile,
    ) -> Result<reqwest::Response> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let url = format!(
            "{}/text-to-speech/{}/stream?output_format=mp3_24000_48",
            self.base_url, profile.voice
        );

        let request = ElevenLabsRequest {
            text,
            model_id: &self.model,
        };

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .json(&request)
            .send()
            .await?;

        Ok(response)
    }
}

#[async_trait]
impl Synthesizer for TextToSpeech {
    async fn synthesize(&self, text: &str, profile: &VoiceProfile) -> Result<AudioStream> {
        tracing::debug!(
            provider = ?self.provider,
            voice = %profile.voice,
            emotion = %profile.emotion,
            speed = profile.speed,
            chars = text.chars().count(),
            "starting synthesis"
        );

        let response = match self.provider {
            TtsProviderKind::OpenAI => self.request_openai(text, profile).await?,
            TtsProviderKind::ElevenLabs => self.request_elevenlabs(text, profile).await?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "TTS API error");
            return Err(Error::Tts(format!("{:?} TTS error {status}: {body}", self.provider)));
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Error::Tts(format!("audio stream interrupted: {e}"))));

        Ok(Box::pin(stream))
    }
}

/// Speaking instructions for an emotion tag, `None` for neutral delivery
fn emotion_instructions(emotion: &str) -> Option<String> {
    let emotion = emotion.trim();
    if emotion.is_empty() || emotion.eq_ignore_ascii_case("neutral") {
        return None;
    }
    Some(format!("Speak with a {emotion} tone."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_emotion_has_no_instructions() {
        assert_eq!(emotion_instructions("neutral"), None);
        assert_eq!(emotion_instructions(" "), None);
        assert_eq!(
            emotion_instructions("exciting").as_deref(),
            Some("Speak with a exciting tone.")
        );
    }

    #[test]
    fn missing_keys_rejected() {
        assert!(TextToSpeech::new_openai(String::new(), "tts-1".to_string()).is_err());
        assert!(TextToSpeech::new_elevenlabs(String::new(), "m".to_string()).is_err());
    }
}
