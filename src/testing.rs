//! Shared fixtures for tests that drive real processes through `sh`.

use crate::config::ChatSettings;
use crate::credentials::CredentialSource;
use crate::process::CommandSpec;
use crate::transport::Transport;
use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};

pub fn sh(script: &str) -> CommandSpec {
    CommandSpec::new("sh").args(["-c", script])
}

/// A shell script printing one `data:` line per token, then the end marker
pub fn sse_script(tokens: &[&str], trailer: &str) -> String {
    let mut script = String::from("printf '%s\\n\\n'");
    for token in tokens {
        let line = format!(
            "data: {}",
            serde_json::json!({ "choices": [{ "delta": { "content": token } }] })
        );
        script.push_str(&format!(" '{}'", line.replace('\'', r"'\''")));
    }
    script.push_str("; ");
    script.push_str(trailer);
    script
}

pub fn settings() -> ChatSettings {
    ChatSettings {
        api_key: Some("test-key".into()),
        ..ChatSettings::default()
    }
}

/// Credentials that never resolve from the environment or a file
pub fn no_credentials() -> CredentialSource {
    CredentialSource::new("PARLEY_TEST_KEY_THAT_IS_NEVER_SET", None)
}

pub struct ScriptTransport {
    pub chat: CommandSpec,
    pub transcription: CommandSpec,
    pub recorder: CommandSpec,
    pub last_body: RefCell<Option<PathBuf>>,
    pub last_audio: RefCell<Option<PathBuf>>,
    pub last_recording: RefCell<Option<PathBuf>>,
    pub transcription_calls: Cell<usize>,
}

impl Default for ScriptTransport {
    fn default() -> Self {
        Self {
            chat: sh("printf 'data: [DONE]\\n'"),
            transcription: sh(r#"printf '{"text": "hello"}'"#),
            recorder: CommandSpec::new("sleep").arg("30"),
            last_body: RefCell::new(None),
            last_audio: RefCell::new(None),
            last_recording: RefCell::new(None),
            transcription_calls: Cell::new(0),
        }
    }
}

impl Transport for ScriptTransport {
    fn chat_completion(&self, _settings: &ChatSettings, body: &Path, _api_key: &str) -> CommandSpec {
        *self.last_body.borrow_mut() = Some(body.to_path_buf());
        self.chat.clone()
    }

    fn transcription(&self, _settings: &ChatSettings, audio: &Path, _api_key: &str) -> CommandSpec {
        self.transcription_calls.set(self.transcription_calls.get() + 1);
        *self.last_audio.borrow_mut() = Some(audio.to_path_buf());
        self.transcription.clone()
    }

    fn recorder(&self, output: &Path) -> CommandSpec {
        *self.last_recording.borrow_mut() = Some(output.to_path_buf());
        self.recorder.clone()
    }
}
