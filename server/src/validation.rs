use crate::error::ApiError;

/// Maximum text length for TTS requests
const MAX_TEXT_LENGTH: usize = 5000;

const KNOWN_PROVIDERS: &[&str] = &["openai", "elevenlabs"];

/// Validate TTS request
pub fn validate_tts_request(text: &str, provider: &str) -> Result<(), ApiError> {
    if text.trim().is_empty() {
        return Err(ApiError::InvalidInput("Text cannot be empty".to_string()));
    }
    if text.len() > MAX_TEXT_LENGTH {
        return Err(ApiError::InvalidInput(format!(
            "Text too long (max {} characters)",
            MAX_TEXT_LENGTH
        )));
    }

    if !KNOWN_PROVIDERS.contains(&provider) {
        return Err(ApiError::InvalidInput(format!(
            "Unknown TTS provider: {}. Expected one of: {}",
            provider,
            KNOWN_PROVIDERS.join(", ")
        )));
    }

    Ok(())
}
