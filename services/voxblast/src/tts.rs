use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use voxblast_core::collaborators::{SpeechSynthesizer, VoiceParams};

pub const OPENAI_SPEECH_URL: &str = "https://api.openai.com/v1/audio/speech";

/// Speech synthesis over the OpenAI audio endpoint. Asks for raw PCM16 at
/// 24 kHz so the sink can play it without a container decoder.
pub struct OpenAiSynthesizer {
    client: Client,
    api_key: String,
    model: String,
    url: String,
}

impl OpenAiSynthesizer {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
            url: OPENAI_SPEECH_URL.to_string(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    fn request_body(&self, text: &str, voice: &VoiceParams) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": voice.voice,
            "speed": voice.speed,
            "response_format": "pcm",
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSynthesizer {
    async fn synthesize(&self, text: &str, voice: &VoiceParams) -> Result<Vec<u8>> {
        tracing::debug!("synthesizing {:?} with voice {}", text, voice.voice);
        let audio = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(text, voice))
            .send()
            .await
            .context("Speech request failed")?
            .error_for_status()
            .context("Speech endpoint rejected the request")?
            .bytes()
            .await
            .context("Failed to read speech audio")?;
        Ok(audio.to_vec())
    }
}
