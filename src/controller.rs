use crate::animation::{Animator, FrameLibrary};
use crate::config::ChatSettings;
use crate::credentials::CredentialSource;
use crate::error::CoreError;
use crate::messages::{ChatMessage, CompletionResult, RecordingState, Role};
use crate::process::JobHandle;
use crate::services::{ChatClient, RecordingPipeline};
use crate::sink::SharedSink;
use crate::text_processing::TranscriptFilter;
use crate::transcript::{ChatHistory, TranscriptView};
use crate::transport::Transport;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tokio::sync::watch;

struct ControllerInner {
    settings: ChatSettings,
    client: ChatClient,
    pipeline: RecordingPipeline,
    animator: Animator,
    history: RefCell<ChatHistory>,
    view: RefCell<TranscriptView>,
    streaming: Cell<bool>,
    reply_job: RefCell<Option<JobHandle>>,
}

/// Owns one chat session: history, reply streaming, recording and the face
///
/// All state lives here rather than in globals, so independent controllers
/// never interfere. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct ChatController {
    inner: Rc<ControllerInner>,
}

impl ChatController {
    /// The face occupies the top of `sink`; the transcript follows below it
    pub fn new(
        settings: ChatSettings,
        transport: Rc<dyn Transport>,
        credentials: CredentialSource,
        filter: TranscriptFilter,
        history: ChatHistory,
        sink: SharedSink,
    ) -> Self {
        let animator = Animator::new(FrameLibrary::builtin());
        animator.bind(Rc::clone(&sink), 0);
        animator.stop();
        sink.borrow_mut().append_lines(&[String::new()]);

        let client = ChatClient::new(Rc::clone(&transport), credentials.clone());
        let pipeline = RecordingPipeline::new(transport, credentials, settings.clone(), filter);

        Self {
            inner: Rc::new(ControllerInner {
                settings,
                client,
                pipeline,
                animator,
                history: RefCell::new(history),
                view: RefCell::new(TranscriptView::new(sink)),
                streaming: Cell::new(false),
                reply_job: RefCell::new(None),
            }),
        }
    }

    /// Start the idle animation. Must be called within a `LocalSet`.
    pub fn start(&self) {
        self.inner.animator.start_state("idle");
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.streaming.get()
    }

    pub fn recording_state(&self) -> RecordingState {
        self.inner.pipeline.state()
    }

    pub fn subscribe_recording(&self) -> watch::Receiver<RecordingState> {
        self.inner.pipeline.subscribe()
    }

    #[cfg(test)]
    pub fn history(&self) -> Vec<ChatMessage> {
        self.inner.history.borrow().messages().to_vec()
    }

    #[cfg(test)]
    pub fn animation_state(&self) -> Option<String> {
        self.inner.animator.current_state()
    }

    /// Send `text` as the next user message and stream the reply.
    ///
    /// Returns `false` for blank input or while a reply is still streaming.
    pub fn submit(&self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }

        if self.inner.streaming.get() {
            tracing::debug!("Reply still streaming, ignoring submission");
            return false;
        }
        self.inner.streaming.set(true);

        self.inner.history.borrow_mut().push(ChatMessage::user(text));
        {
            let mut view = self.inner.view.borrow_mut();
            view.push_message(Role::User, text);
            view.begin_reply();
        }
        self.inner.animator.start_state("thinking");

        let messages = self.inner.history.borrow().messages().to_vec();

        let talking = Cell::new(false);
        let on_token = {
            let this = self.clone();
            move |token: &str| {
                if !talking.replace(true) {
                    this.inner.animator.start_state("talking");
                }
                this.inner.view.borrow_mut().append_reply(token);
            }
        };
        let on_done = {
            let this = self.clone();
            move |result| this.finish_reply(result)
        };

        let job = self
            .inner
            .client
            .stream(&messages, &self.inner.settings, on_token, on_done);
        *self.inner.reply_job.borrow_mut() = job;

        true
    }

    /// Stop the reply currently streaming, if any
    pub fn cancel_reply(&self) -> bool {
        let job = self.inner.reply_job.borrow().clone();
        job.is_some_and(|job| job.stop())
    }

    /// Idle starts a recording, Recording stops it, Transcribing is ignored
    pub fn toggle_recording(&self) {
        match self.inner.pipeline.state() {
            RecordingState::Idle => {
                let this = self.clone();
                match self
                    .inner
                    .pipeline
                    .start(move |result| this.transcript_ready(result))
                {
                    Ok(true) => {
                        self.notice("recording, /rec again to stop");
                        self.inner.animator.start_state("listening");
                    }
                    Ok(false) => {}
                    Err(e) => self.notice(&format!("cannot record: {}", e)),
                }
            }
            RecordingState::Recording => {
                if self.inner.pipeline.stop() {
                    self.notice("transcribing");
                    self.inner.animator.start_state("thinking");
                }
            }
            RecordingState::Transcribing => {
                tracing::debug!("Already transcribing, ignoring toggle");
            }
        }
    }

    /// Stop everything in flight and release the recording. Call before
    /// dropping the last handle.
    pub fn shutdown(&self) {
        self.cancel_reply();
        self.inner.pipeline.shutdown();
        self.inner.animator.stop();
    }

    fn notice(&self, text: &str) {
        self.inner.view.borrow_mut().notice(text);
    }

    fn finish_reply(&self, result: CompletionResult) {
        self.inner.streaming.set(false);
        self.inner.reply_job.borrow_mut().take();
        self.inner.view.borrow_mut().end_reply();

        if !result.text.is_empty() {
            self.inner
                .history
                .borrow_mut()
                .push(ChatMessage::assistant(result.text));
        }

        match result.error {
            None => self.inner.animator.start_state("idle"),
            Some(e) => {
                self.notice(&format!("error: {}", e));
                self.inner.animator.start_state("error");
            }
        }
    }

    fn transcript_ready(&self, result: Result<String, CoreError>) {
        match result {
            Ok(text) if text.is_empty() => {
                self.notice("heard nothing");
                self.inner.animator.start_state("idle");
            }
            Ok(text) => {
                if !self.submit(&text) {
                    self.notice(&format!("not sent, reply in progress: {}", text));
                }
            }
            Err(e) => {
                self.notice(&format!("recording failed: {}", e));
                self.inner.animator.stop();
            }
        }
    }
}
