use crate::config::ChatSettings;
use crate::credentials::CredentialSource;
use crate::decoder::{LineDecoder, StreamEvent};
use crate::error::CoreError;
use crate::messages::{ChatMessage, CompletionResult};
use crate::process::{self, JobCallbacks, JobExit, JobHandle, Latch};
use crate::transcription::snippet;
use crate::transport::Transport;
use serde::Serialize;
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;
use tempfile::NamedTempFile;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

/// Per-request state shared by the stdout and exit callbacks of one job
struct StreamState {
    decoder: LineDecoder,
    text: String,
    stderr: Vec<u8>,
    request: Option<NamedTempFile>,
    on_done: Option<Box<dyn FnOnce(CompletionResult)>>,
    latch: Latch,
}

/// Streams chat completions through an external transport command
///
/// This client:
/// - Resolves the API key (settings, environment, credentials file)
/// - Writes the request body to a temp file the transport reads
/// - Decodes streamed output into tokens for `on_token`
/// - Fires `on_done` exactly once, on the end marker or process exit,
///   whichever comes first, after removing the request file
pub struct ChatClient {
    transport: Rc<dyn Transport>,
    credentials: CredentialSource,
}

impl ChatClient {
    pub fn new(transport: Rc<dyn Transport>, credentials: CredentialSource) -> Self {
        Self {
            transport,
            credentials,
        }
    }

    /// Start streaming a reply to `messages`.
    ///
    /// Every outcome, including setup failures, reaches `on_done`. Setup
    /// failures are scheduled on the local set rather than invoked inline.
    /// Returns the job handle when a request is actually in flight.
    pub fn stream<T, D>(
        &self,
        messages: &[ChatMessage],
        settings: &ChatSettings,
        mut on_token: T,
        on_done: D,
    ) -> Option<JobHandle>
    where
        T: FnMut(&str) + 'static,
        D: FnOnce(CompletionResult) + 'static,
    {
        if messages.is_empty() {
            schedule_failure(
                on_done,
                CoreError::Configuration("no messages to send".into()),
            );
            return None;
        }

        let Some(api_key) = self.credentials.resolve(settings.api_key.as_deref()) else {
            schedule_failure(
                on_done,
                CoreError::missing_credential(self.credentials.env_var()),
            );
            return None;
        };

        let request = match write_request(messages, settings) {
            Ok(request) => request,
            Err(e) => {
                schedule_failure(on_done, e);
                return None;
            }
        };

        let command = self
            .transport
            .chat_completion(settings, request.path(), &api_key);

        let state = Rc::new(RefCell::new(StreamState {
            decoder: LineDecoder::new(),
            text: String::new(),
            stderr: Vec::new(),
            request: Some(request),
            on_done: Some(Box::new(on_done)),
            latch: Latch::new(),
        }));

        let stdout_state = Rc::clone(&state);
        let stderr_state = Rc::clone(&state);
        let exit_state = Rc::clone(&state);
        let callbacks = JobCallbacks::new()
            .on_stdout(move |chunk| handle_chunk(&stdout_state, &chunk, &mut on_token))
            .on_stderr(move |chunk| stderr_state.borrow_mut().stderr.extend(chunk))
            .on_exit(move |exit| handle_exit(&exit_state, exit));

        match process::spawn(&command, callbacks) {
            Ok(job) => {
                tracing::info!(
                    "{}: streaming reply ({} messages, model {})",
                    job.id(),
                    messages.len(),
                    settings.model
                );
                Some(job)
            }
            Err(e) => {
                tokio::task::spawn_local(async move { finish(&state, Some(e)) });
                None
            }
        }
    }
}

fn schedule_failure<D>(on_done: D, error: CoreError)
where
    D: FnOnce(CompletionResult) + 'static,
{
    tracing::warn!("Chat request not started: {}", error);
    tokio::task::spawn_local(async move {
        on_done(CompletionResult {
            text: String::new(),
            error: Some(error),
        })
    });
}

fn write_request(
    messages: &[ChatMessage],
    settings: &ChatSettings,
) -> Result<NamedTempFile, CoreError> {
    let mut file = tempfile::Builder::new()
        .prefix("parley-request-")
        .suffix(".json")
        .tempfile()?;

    let request = ChatRequest {
        model: &settings.model,
        messages,
        stream: true,
    };
    serde_json::to_writer(&mut file, &request).map_err(std::io::Error::from)?;
    file.flush()?;

    Ok(file)
}

fn handle_chunk(state: &Rc<RefCell<StreamState>>, chunk: &[u8], on_token: &mut dyn FnMut(&str)) {
    let events = state.borrow_mut().decoder.push(chunk);

    for event in events {
        match event {
            StreamEvent::Token(text) => {
                state.borrow_mut().text.push_str(&text);
                on_token(&text);
            }
            StreamEvent::End => finish(state, None),
            StreamEvent::Skip => {}
        }
    }
}

fn handle_exit(state: &Rc<RefCell<StreamState>>, exit: JobExit) {
    let error = {
        let state = state.borrow();
        if state.latch.is_fired() {
            tracing::debug!("Reply already finished; ignoring {}", exit);
            return;
        }

        if state.decoder.pending_bytes() > 0 {
            tracing::debug!(
                "Discarding {} bytes of unterminated output",
                state.decoder.pending_bytes()
            );
        }

        if exit.stopped_by_caller() {
            tracing::info!("Reply stopped after {} chars", state.text.len());
            None
        } else if exit.success() {
            None
        } else {
            Some(CoreError::Transport(format!(
                "chat request failed with {}: {}",
                exit,
                snippet(&state.stderr)
            )))
        }
    };

    finish(state, error);
}

fn finish(state: &Rc<RefCell<StreamState>>, error: Option<CoreError>) {
    let (request, on_done, text) = {
        let mut state = state.borrow_mut();
        if !state.latch.try_fire() {
            return;
        }
        (
            state.request.take(),
            state.on_done.take(),
            std::mem::take(&mut state.text),
        )
    };

    if let Some(request) = request {
        if let Err(e) = request.close() {
            tracing::warn!("Failed to remove request file: {}", e);
        }
    }

    match &error {
        Some(e) => tracing::warn!("Reply failed after {} chars: {}", text.len(), e),
        None => tracing::info!("Reply complete: {} chars", text.len()),
    }

    if let Some(on_done) = on_done {
        on_done(CompletionResult { text, error });
    }
}
