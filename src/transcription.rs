use crate::error::CoreError;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: Option<String>,
}

/// Extract the transcript from a transcription endpoint's JSON answer
pub fn parse_response(body: &[u8]) -> Result<String, CoreError> {
    let response: TranscriptionResponse = serde_json::from_slice(body).map_err(|e| {
        CoreError::Transport(format!(
            "unparsable transcription response ({}): {}",
            e,
            snippet(body)
        ))
    })?;

    if let Some(error) = response.error {
        let message = error
            .message
            .unwrap_or_else(|| "unknown error".to_string());
        return Err(CoreError::Transport(format!("transcription failed: {}", message)));
    }

    let text = response
        .text
        .ok_or_else(|| CoreError::Transport("transcription response has no text field".into()))?;

    tracing::info!("Transcription complete: {} chars", text.len());
    Ok(text)
}

/// Response body for error messages: lossy UTF-8, trimmed, capped at 200 chars
pub fn snippet(body: &[u8]) -> String {
    const MAX_CHARS: usize = 200;
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.chars().count() > MAX_CHARS {
        format!("{}…", text.chars().take(MAX_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}
