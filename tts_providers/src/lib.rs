//! Speech synthesis backends for the audio cache gateway.
//!
//! Each backend implements [`SpeechProvider`] over plain HTTP. Non-2xx
//! responses are surfaced with their upstream status and body so the
//! caller can relay them; nothing is retried here.

use async_trait::async_trait;
use audio_cache::{ProviderError, SpeechProvider, SynthesisGateway};
use serde::Serialize;
use tracing::{debug, info};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const ELEVENLABS_BASE_URL: &str = "https://api.elevenlabs.io/v1";

/// Structure for the OpenAI speech API request
#[derive(Serialize)]
struct OpenAiSpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

pub struct OpenAiTts {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
}

impl OpenAiTts {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, OPENAI_BASE_URL)
    }

    /// Point the client at a different endpoint, e.g. a local mock.
    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl SpeechProvider for OpenAiTts {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>, ProviderError> {
        let url = format!("{}/audio/speech", self.base_url);
        let req_body = OpenAiSpeechRequest {
            model: "tts-1",
            input: text,
            voice,
            response_format: "mp3",
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&req_body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::new(
                Some(status.as_u16()),
                format!("OpenAI TTS returned {status}: {body}"),
            ));
        }

        let audio = response.bytes().await.map_err(transport_error)?;
        debug!(bytes = audio.len(), voice, "OpenAI synthesis complete");
        Ok(audio.to_vec())
    }
}

#[derive(Serialize)]
struct ElevenLabsRequest<'a> {
    text: &'a str,
    voice_settings: VoiceSettings,
}

#[derive(Serialize)]
struct VoiceSettings {
    stability: f64,
    similarity_boost: f64,
}

pub struct ElevenLabsTts {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
}

impl ElevenLabsTts {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, ELEVENLABS_BASE_URL)
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl SpeechProvider for ElevenLabsTts {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>, ProviderError> {
        let voice_id = elevenlabs_voice_id(voice);
        let url = format!("{}/text-to-speech/{voice_id}/stream", self.base_url);
        let req_body = ElevenLabsRequest {
            text,
            voice_settings: VoiceSettings {
                stability: 0.5,
                similarity_boost: 0.75,
            },
        };

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .header("Accept", "audio/mpeg")
            .json(&req_body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::new(
                Some(status.as_u16()),
                format!("ElevenLabs returned {status}: {body}"),
            ));
        }

        let audio = response.bytes().await.map_err(transport_error)?;
        debug!(bytes = audio.len(), voice_id, "ElevenLabs synthesis complete");
        Ok(audio.to_vec())
    }
}

/// Map the neutral voice names onto ElevenLabs voice ids so callers can
/// switch providers without changing the voice they ask for. Unknown
/// names fall back to Rachel.
pub fn elevenlabs_voice_id(voice: &str) -> &str {
    match voice {
        "alloy" => "21m00Tcm4TlvDq8ikWAM",   // Rachel
        "echo" => "AZnzlk1XvdvUeBnXmlld",    // Domi
        "fable" => "EXAVITQu4vr4xnSDxMaL",   // Bella
        "onyx" => "VR6AewLTigWG4xSOukaG",    // Arnold
        "nova" => "pNInz6obpgDQGcFmaJgB",    // Adam
        "shimmer" => "jBpfuIE2acCO8z3wKNLl", // Fin
        _ => "21m00Tcm4TlvDq8ikWAM",
    }
}

fn transport_error(e: reqwest::Error) -> ProviderError {
    ProviderError::new(e.status().map(|s| s.as_u16()), e.to_string())
}

/// Register every provider whose API key is present in the environment.
/// Requests naming an unregistered provider fail up front instead of
/// burning an upstream call.
pub fn register_from_env(gateway: &mut SynthesisGateway) {
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        if !key.trim().is_empty() {
            gateway.register_provider("openai", Box::new(OpenAiTts::new(key)));
            info!("registered OpenAI TTS provider");
        }
    }
    if let Ok(key) = std::env::var("ELEVENLABS_API_KEY") {
        if !key.trim().is_empty() {
            gateway.register_provider("elevenlabs", Box::new(ElevenLabsTts::new(key)));
            info!("registered ElevenLabs TTS provider");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_voices_map_to_distinct_ids() {
        let ids: std::collections::HashSet<_> = ["alloy", "echo", "fable", "onyx", "nova", "shimmer"]
            .iter()
            .map(|v| elevenlabs_voice_id(v))
            .collect();
        assert_eq!(ids.len(), 6);
    }

    #[test]
    fn unknown_voice_falls_back_to_rachel() {
        assert_eq!(elevenlabs_voice_id("whisper"), elevenlabs_voice_id("alloy"));
    }
}
