use crate::config::{ChatSettings, RECORDER_OUTPUT_PLACEHOLDER};
use crate::process::CommandSpec;
use std::path::Path;

/// Builds the external commands the core runs. HTTP and audio capture stay
/// inside these commands; the core only streams their output.
pub trait Transport {
    /// Streaming chat completion whose request body lives in `body`
    fn chat_completion(&self, settings: &ChatSettings, body: &Path, api_key: &str) -> CommandSpec;

    /// One-shot multipart upload of `audio`, answering with a JSON document
    fn transcription(&self, settings: &ChatSettings, audio: &Path, api_key: &str) -> CommandSpec;

    /// Microphone capture writing to `output` until terminated
    fn recorder(&self, output: &Path) -> CommandSpec;
}

/// Production transport: `curl` for HTTP, `sox` (or a configured command) for capture
#[derive(Debug, Clone, Default)]
pub struct CurlTransport {
    recorder_command: Option<Vec<String>>,
}

impl CurlTransport {
    pub fn new(recorder_command: Option<Vec<String>>) -> Self {
        Self { recorder_command }
    }
}

impl Transport for CurlTransport {
    fn chat_completion(&self, settings: &ChatSettings, body: &Path, api_key: &str) -> CommandSpec {
        CommandSpec::new("curl")
            .args(["-sS", "-N", "--fail-with-body", "-X", "POST"])
            .arg(settings.endpoint("chat/completions"))
            .args(["-H", "Content-Type: application/json"])
            .arg("-H")
            .arg(format!("Authorization: Bearer {}", api_key))
            .arg("-d")
            .arg(format!("@{}", body.display()))
    }

    fn transcription(&self, settings: &ChatSettings, audio: &Path, api_key: &str) -> CommandSpec {
        let mut command = CommandSpec::new("curl")
            .args(["-sS", "--fail-with-body", "-X", "POST"])
            .arg(settings.endpoint("audio/transcriptions"))
            .arg("-H")
            .arg(format!("Authorization: Bearer {}", api_key))
            .arg("-F")
            .arg(format!("file=@{}", audio.display()))
            .arg("--form-string")
            .arg(format!("model={}", settings.transcription_model));

        if let Some(language) = settings.language.as_deref().filter(|l| !l.is_empty()) {
            command = command.arg("--form-string").arg(format!("language={}", language));
        }
        if let Some(prompt) = settings.transcription_prompt.as_deref().filter(|p| !p.is_empty()) {
            command = command.arg("--form-string").arg(format!("prompt={}", prompt));
        }

        command
    }

    fn recorder(&self, output: &Path) -> CommandSpec {
        match &self.recorder_command {
            Some(argv) => custom_recorder(argv, output),
            None => default_recorder(output),
        }
    }
}

fn custom_recorder(argv: &[String], output: &Path) -> CommandSpec {
    let output = output.display().to_string();
    let mut argv = argv
        .iter()
        .map(|arg| arg.replace(RECORDER_OUTPUT_PLACEHOLDER, &output));

    // Config validation rejects an empty argv
    let program = argv.next().unwrap_or_else(|| "sox".to_string());
    CommandSpec::new(program).args(argv)
}

/// 16 kHz mono 16-bit WAV, the format transcription endpoints handle best
#[cfg(not(target_os = "windows"))]
fn default_recorder(output: &Path) -> CommandSpec {
    CommandSpec::new("sox")
        .args(["-q", "-d", "-c", "1", "-r", "16000", "-b", "16"])
        .arg(output.display().to_string())
}

#[cfg(target_os = "windows")]
fn default_recorder(output: &Path) -> CommandSpec {
    CommandSpec::new("sox")
        .args(["-q", "-t", "waveaudio", "default", "-c", "1", "-r", "16000", "-b", "16"])
        .arg(output.display().to_string())
}
