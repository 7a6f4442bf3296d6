use crate::config::ChatSettings;
use crate::credentials::CredentialSource;
use crate::error::CoreError;
use crate::messages::RecordingState;
use crate::process::{self, JobCallbacks, JobExit, JobHandle};
use crate::text_processing::TranscriptFilter;
use crate::transcription::{self, snippet};
use crate::transport::Transport;
use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::rc::Rc;
use tempfile::NamedTempFile;
use tokio::sync::watch;

type DoneFn = Box<dyn FnOnce(Result<String, CoreError>)>;

#[derive(Default)]
struct Session {
    job: Option<JobHandle>,
    audio: Option<NamedTempFile>,
    api_key: Option<String>,
    on_done: Option<DoneFn>,
    stderr: Vec<u8>,
}

struct PipelineShared {
    transport: Rc<dyn Transport>,
    credentials: CredentialSource,
    settings: ChatSettings,
    filter: TranscriptFilter,
    state_tx: watch::Sender<RecordingState>,
    session: RefCell<Session>,
    closed: Cell<bool>,
}

/// Records from the microphone, then transcribes the recording
///
/// This service:
/// - Runs the recorder as a job writing to a temp WAV file
/// - Moves to transcription only when the recorder ended cleanly or because
///   we stopped it
/// - Uploads the file with a second one-shot job and parses the JSON answer
/// - Deletes the temp file on every return to `Idle`
///
/// State changes are published on a watch channel (`subscribe`).
pub struct RecordingPipeline {
    shared: Rc<PipelineShared>,
}

impl RecordingPipeline {
    pub fn new(
        transport: Rc<dyn Transport>,
        credentials: CredentialSource,
        settings: ChatSettings,
        filter: TranscriptFilter,
    ) -> Self {
        let (state_tx, _state_rx) = watch::channel(RecordingState::Idle);
        Self {
            shared: Rc::new(PipelineShared {
                transport,
                credentials,
                settings,
                filter,
                state_tx,
                session: RefCell::new(Session::default()),
                closed: Cell::new(false),
            }),
        }
    }

    pub fn state(&self) -> RecordingState {
        *self.shared.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RecordingState> {
        self.shared.state_tx.subscribe()
    }

    #[cfg(test)]
    /// Path of the current recording, while one exists
    pub fn audio_path(&self) -> Option<PathBuf> {
        self.shared
            .session
            .borrow()
            .audio
            .as_ref()
            .map(|file| file.path().to_path_buf())
    }

    /// Start recording. `on_done` later receives the transcript or the error
    /// that ended the session.
    ///
    /// Returns `Ok(false)` without doing anything unless idle. Setup failures
    /// (no credential, temp file, recorder spawn) are returned here and
    /// `on_done` is dropped unused.
    pub fn start<F>(&self, on_done: F) -> Result<bool, CoreError>
    where
        F: FnOnce(Result<String, CoreError>) + 'static,
    {
        let state = self.state();
        if state != RecordingState::Idle || self.shared.closed.get() {
            tracing::debug!("Already {:?}, ignoring start", state);
            return Ok(false);
        }

        let api_key = self
            .shared
            .credentials
            .resolve(self.shared.settings.api_key.as_deref())
            .ok_or_else(|| CoreError::missing_credential(self.shared.credentials.env_var()))?;

        let audio = tempfile::Builder::new()
            .prefix("parley-")
            .suffix(".wav")
            .tempfile()?;

        let command = self.shared.transport.recorder(audio.path());

        let stderr_shared = Rc::clone(&self.shared);
        let exit_shared = Rc::clone(&self.shared);
        let callbacks = JobCallbacks::new()
            .on_stderr(move |chunk| stderr_shared.session.borrow_mut().stderr.extend(chunk))
            .on_exit(move |exit| exit_shared.recorder_exited(exit));

        // On failure `audio` drops here and the file goes with it
        let job = process::spawn(&command, callbacks)?;
        tracing::info!("{}: recording to {:?}", job.id(), audio.path());

        *self.shared.session.borrow_mut() = Session {
            job: Some(job),
            audio: Some(audio),
            api_key: Some(api_key),
            on_done: Some(Box::new(on_done)),
            stderr: Vec::new(),
        };
        self.shared.set_state(RecordingState::Recording);

        Ok(true)
    }

    /// Ask the recorder to stop. The move to `Transcribing` happens when its
    /// exit is observed.
    pub fn stop(&self) -> bool {
        let state = self.state();
        if state != RecordingState::Recording {
            tracing::debug!("Not recording ({:?}), ignoring stop", state);
            return false;
        }

        let job = self.shared.session.borrow().job.clone();
        job.is_some_and(|job| job.stop())
    }

    /// End the pipeline for good: stop any running job, delete the recording
    /// and drop the pending `on_done` without calling it.
    ///
    /// `on_done` usually captures the owner of this pipeline, so dropping it
    /// here is what lets both be freed.
    pub fn shutdown(&self) {
        if self.shared.closed.replace(true) {
            return;
        }

        let session = std::mem::take(&mut *self.shared.session.borrow_mut());
        if let Some(job) = &session.job {
            job.stop();
        }
        if let Some(audio) = session.audio {
            let path = audio.path().to_path_buf();
            if let Err(e) = audio.close() {
                tracing::warn!("Failed to remove recording {:?}: {}", path, e);
            }
        }

        self.shared.set_state(RecordingState::Idle);
        tracing::debug!("Recording pipeline shut down");
    }
}

impl PipelineShared {
    fn set_state(&self, state: RecordingState) {
        let previous = self.state_tx.send_replace(state);
        tracing::debug!("Recording state {:?} -> {:?}", previous, state);
    }

    fn recorder_exited(self: &Rc<Self>, exit: JobExit) {
        if self.closed.get() {
            return;
        }

        let stderr = {
            let mut session = self.session.borrow_mut();
            session.job = None;
            std::mem::take(&mut session.stderr)
        };

        if !exit.success() && !exit.stopped_by_caller() {
            self.finish(Err(CoreError::Transport(format!(
                "recorder exited with {}: {}",
                exit,
                snippet(&stderr)
            ))));
            return;
        }

        tracing::info!("Recording stopped ({})", exit);
        self.set_state(RecordingState::Transcribing);
        self.transcribe();
    }

    fn transcribe(self: &Rc<Self>) {
        let (audio, api_key) = {
            let session = self.session.borrow();
            (
                session.audio.as_ref().map(|file| file.path().to_path_buf()),
                session.api_key.clone(),
            )
        };
        let (Some(audio), Some(api_key)) = (audio, api_key) else {
            self.finish(Err(CoreError::Configuration(
                "recording session has no audio file".into(),
            )));
            return;
        };

        let command = self.transport.transcription(&self.settings, &audio, &api_key);

        let body = Rc::new(RefCell::new(Vec::new()));
        let stderr = Rc::new(RefCell::new(Vec::new()));
        let body_sink = Rc::clone(&body);
        let stderr_sink = Rc::clone(&stderr);
        let shared = Rc::clone(self);
        let callbacks = JobCallbacks::new()
            .on_stdout(move |chunk| body_sink.borrow_mut().extend(chunk))
            .on_stderr(move |chunk| stderr_sink.borrow_mut().extend(chunk))
            .on_exit(move |exit| {
                let body = body.take();
                let stderr = stderr.take();
                shared.transcription_exited(exit, &body, &stderr);
            });

        match process::spawn(&command, callbacks) {
            Ok(job) => {
                tracing::info!("{}: transcribing {:?}", job.id(), audio);
                self.session.borrow_mut().job = Some(job);
            }
            Err(e) => self.finish(Err(e)),
        }
    }

    fn transcription_exited(&self, exit: JobExit, body: &[u8], stderr: &[u8]) {
        if self.closed.get() {
            return;
        }

        let result = if exit.success() {
            transcription::parse_response(body).map(|text| self.filter.apply(&text))
        } else {
            let detail = if stderr.is_empty() { body } else { stderr };
            Err(CoreError::Transport(format!(
                "transcription request failed with {}: {}",
                exit,
                snippet(detail)
            )))
        };

        self.finish(result);
    }

    fn finish(&self, result: Result<String, CoreError>) {
        let (audio, on_done) = {
            let mut session = self.session.borrow_mut();
            session.job = None;
            session.api_key = None;
            session.stderr.clear();
            (session.audio.take(), session.on_done.take())
        };

        if let Some(audio) = audio {
            let path = audio.path().to_path_buf();
            match audio.close() {
                Ok(()) => tracing::debug!("Removed recording {:?}", path),
                Err(e) => tracing::warn!("Failed to remove recording {:?}: {}", path, e),
            }
        }

        self.set_state(RecordingState::Idle);

        match &result {
            Ok(text) => tracing::info!("Transcript ready: {} chars", text.len()),
            Err(e) => tracing::warn!("Recording session failed: {}", e),
        }

        if let Some(on_done) = on_done {
            on_done(result);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::CommandSpec;
    use crate::testing::{ScriptTransport, no_credentials, settings, sh};
    use std::collections::HashMap;
    use tokio::sync::oneshot;
    use tokio::task::LocalSet;

    fn pipeline(transport: &Rc<ScriptTransport>) -> RecordingPipeline {
        RecordingPipeline::new(
            transport.clone(),
            no_credentials(),
            settings(),
            TranscriptFilter::default(),
        )
    }

    fn start(
        pipeline: &RecordingPipeline,
    ) -> oneshot::Receiver<Result<String, CoreError>> {
        let (done_tx, done_rx) = oneshot::channel();
        let started = pipeline
            .start(move |result| {
                let _ = done_tx.send(result);
            })
            .expect("start");
        assert!(started);
        done_rx
    }

    #[tokio::test]
    async fn test_stop_leads_to_transcription() {
        LocalSet::new()
            .run_until(async {
                let transport = Rc::new(ScriptTransport::default());
                let pipeline = pipeline(&transport);

                let done_rx = start(&pipeline);
                assert_eq!(pipeline.state(), RecordingState::Recording);
                let audio = pipeline.audio_path().expect("audio path");
                assert!(audio.exists());

                assert!(pipeline.stop());
                let text = done_rx.await.expect("on_done").expect("transcript");

                assert_eq!(text, "hello");
                assert_eq!(transport.transcription_calls.get(), 1);
                assert_eq!(transport.last_audio.borrow().as_ref(), Some(&audio));
                assert_eq!(pipeline.state(), RecordingState::Idle);
                assert!(!audio.exists());
            })
            .await;
    }

    #[tokio::test]
    async fn test_recorder_failure_skips_transcription() {
        LocalSet::new()
            .run_until(async {
                let transport = Rc::new(ScriptTransport {
                    recorder: sh("echo 'no capture device' >&2; exit 2"),
                    ..ScriptTransport::default()
                });
                let pipeline = pipeline(&transport);

                let done_rx = start(&pipeline);
                let audio = pipeline.audio_path().expect("audio path");
                let err = done_rx.await.expect("on_done").expect_err("recorder failed");

                assert!(
                    matches!(err, CoreError::Transport(ref msg) if msg.contains("no capture device")),
                    "{err}"
                );
                assert_eq!(transport.transcription_calls.get(), 0);
                assert_eq!(pipeline.state(), RecordingState::Idle);
                assert!(!audio.exists());
            })
            .await;
    }

    #[tokio::test]
    async fn test_clean_recorder_exit_still_transcribes() {
        LocalSet::new()
            .run_until(async {
                let transport = Rc::new(ScriptTransport {
                    recorder: sh("true"),
                    ..ScriptTransport::default()
                });
                let pipeline = pipeline(&transport);

                let done_rx = start(&pipeline);
                assert_eq!(done_rx.await.expect("on_done").expect("text"), "hello");
                assert_eq!(transport.transcription_calls.get(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn test_bad_transcription_responses_clean_up() {
        let cases = [
            sh("printf 'not json'"),
            sh(r#"printf '{"error": {"message": "quota exceeded"}}'"#),
            sh("echo 'curl: (7) failed to connect' >&2; exit 7"),
            CommandSpec::new("/nonexistent/parley-curl"),
        ];

        for transcription in cases {
            LocalSet::new()
                .run_until(async {
                    let transport = Rc::new(ScriptTransport {
                        transcription: transcription.clone(),
                        ..ScriptTransport::default()
                    });
                    let pipeline = pipeline(&transport);

                    let done_rx = start(&pipeline);
                    let audio = pipeline.audio_path().expect("audio path");
                    pipeline.stop();

                    let result = done_rx.await.expect("on_done");
                    assert!(result.is_err(), "{:?} should fail", transcription);
                    assert_eq!(pipeline.state(), RecordingState::Idle);
                    assert!(!audio.exists());
                })
                .await;
        }
    }

    #[tokio::test]
    async fn test_start_and_stop_are_state_gated() {
        LocalSet::new()
            .run_until(async {
                let transport = Rc::new(ScriptTransport::default());
                let pipeline = pipeline(&transport);
                assert!(!pipeline.stop());

                let done_rx = start(&pipeline);
                let second = pipeline.start(|_| panic!("second session must not run"));
                assert!(matches!(second, Ok(false)));

                pipeline.stop();
                done_rx.await.expect("on_done").expect("text");
                assert!(!pipeline.stop());
            })
            .await;
    }

    #[tokio::test]
    async fn test_shutdown_removes_recording_and_drops_callback() {
        LocalSet::new()
            .run_until(async {
                let transport = Rc::new(ScriptTransport::default());
                let pipeline = pipeline(&transport);

                let done_rx = start(&pipeline);
                let audio = pipeline.audio_path().expect("audio path");
                assert!(audio.exists());

                pipeline.shutdown();
                assert!(!audio.exists());
                assert_eq!(pipeline.state(), RecordingState::Idle);
                assert!(done_rx.await.is_err(), "on_done dropped, never called");

                // The recorder's exit after the stop must not start a transcription
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                assert_eq!(transport.transcription_calls.get(), 0);
                assert!(matches!(pipeline.start(|_| {}), Ok(false)));
            })
            .await;
    }

    #[tokio::test]
    async fn test_setup_failures_are_synchronous() {
        LocalSet::new()
            .run_until(async {
                let transport = Rc::new(ScriptTransport::default());
                let pipeline = RecordingPipeline::new(
                    transport.clone(),
                    no_credentials(),
                    ChatSettings::default(),
                    TranscriptFilter::default(),
                );
                assert!(matches!(
                    pipeline.start(|_| {}),
                    Err(CoreError::Configuration(_))
                ));
                assert_eq!(pipeline.state(), RecordingState::Idle);

                let transport = Rc::new(ScriptTransport {
                    recorder: CommandSpec::new("/nonexistent/parley-sox"),
                    ..ScriptTransport::default()
                });
                let pipeline = super::tests::pipeline(&transport);
                assert!(matches!(pipeline.start(|_| {}), Err(CoreError::Spawn { .. })));
                assert_eq!(pipeline.state(), RecordingState::Idle);
                assert!(pipeline.audio_path().is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn test_transcript_is_filtered_and_state_is_published() {
        LocalSet::new()
            .run_until(async {
                let transport = Rc::new(ScriptTransport {
                    transcription: sh(r#"printf '{"text": "  parlay   rocks "}'"#),
                    ..ScriptTransport::default()
                });
                let mut overrides = HashMap::new();
                overrides.insert("parlay".to_string(), "parley".to_string());
                let pipeline = RecordingPipeline::new(
                    transport.clone(),
                    no_credentials(),
                    settings(),
                    TranscriptFilter::new(&overrides),
                );
                let mut state_rx = pipeline.subscribe();

                let done_rx = start(&pipeline);
                assert!(state_rx.has_changed().expect("sender alive"));
                assert_eq!(*state_rx.borrow_and_update(), RecordingState::Recording);

                pipeline.stop();
                assert_eq!(done_rx.await.expect("on_done").expect("text"), "parley rocks");
                assert_eq!(*state_rx.borrow_and_update(), RecordingState::Idle);
            })
            .await;
    }
}
