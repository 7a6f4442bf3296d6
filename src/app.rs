use crate::config::Config;
use crate::controller::ChatController;
use crate::messages::RecordingState;
use crate::sink::LineBuffer;
use crate::text_processing::TranscriptFilter;
use crate::transcript::ChatHistory;
use crate::transport::CurlTransport;

use anyhow::{Context, Result};
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

const REPAINT_INTERVAL: Duration = Duration::from_millis(50);

enum Command<'a> {
    Quit,
    ToggleRecording,
    StopReply,
    Message(&'a str),
}

fn parse_command(line: &str) -> Command<'_> {
    match line.trim() {
        "/quit" | "/q" => Command::Quit,
        "/rec" => Command::ToggleRecording,
        "/stop" => Command::StopReply,
        text => Command::Message(text),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct Painted {
    revision: u64,
    recording: RecordingState,
    streaming: bool,
}

pub struct App {
    controller: ChatController,
    screen: Rc<RefCell<LineBuffer>>,
    recording: watch::Receiver<RecordingState>,
    painted: Option<Painted>,
}

impl App {
    pub fn new(config: Config) -> Result<Self> {
        let screen = Rc::new(RefCell::new(LineBuffer::new()));
        let transport = Rc::new(CurlTransport::new(config.recorder_command.clone()));

        let controller = ChatController::new(
            config.chat_settings(),
            transport,
            config.credential_source(),
            TranscriptFilter::new(&config.word_overrides),
            ChatHistory::new(config.system_prompt.as_deref()),
            screen.clone(),
        );

        tracing::info!("Ready! Model {}, /rec to record, /quit to exit", config.model);

        let recording = controller.subscribe_recording();

        Ok(Self {
            controller,
            screen,
            recording,
            painted: None,
        })
    }

    pub async fn run(mut self) -> Result<()> {
        self.controller.start();

        let mut input = BufReader::new(tokio::io::stdin()).lines();
        let mut repaint = tokio::time::interval(REPAINT_INTERVAL);

        loop {
            tokio::select! {
                line = input.next_line() => {
                    let Some(line) = line.context("Failed to read stdin")? else {
                        tracing::debug!("stdin closed");
                        break;
                    };
                    if !self.handle_line(&line) {
                        break;
                    }
                }

                _ = repaint.tick() => self.repaint()?,

                Ok(()) = self.recording.changed() => self.repaint()?,

                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received Ctrl+C, shutting down");
                    break;
                }
            }
        }

        self.controller.shutdown();
        tracing::info!("parley shutdown complete");
        Ok(())
    }

    /// Returns `false` when the user asked to quit
    fn handle_line(&mut self, line: &str) -> bool {
        match parse_command(line) {
            Command::Quit => return false,
            Command::ToggleRecording => {
                self.controller.toggle_recording();
                tracing::debug!("Recording state now {:?}", self.controller.recording_state());
            }
            Command::StopReply => {
                if !self.controller.cancel_reply() {
                    tracing::debug!("No reply to stop");
                }
            }
            Command::Message(text) => {
                if !text.is_empty() && !self.controller.submit(text) {
                    tracing::info!("Still replying; wait or /stop");
                }
            }
        }

        // Input echo scrolled the screen
        self.painted = None;
        true
    }

    fn repaint(&mut self) -> Result<()> {
        let screen = self.screen.borrow();
        let current = Painted {
            revision: screen.revision(),
            recording: *self.recording.borrow_and_update(),
            streaming: self.controller.is_streaming(),
        };
        if self.painted == Some(current) {
            return Ok(());
        }

        let status = match (current.recording, current.streaming) {
            (RecordingState::Recording, _) => "[rec] ",
            (RecordingState::Transcribing, _) => "[transcribing] ",
            (RecordingState::Idle, true) => "[replying] ",
            (RecordingState::Idle, false) => "",
        };

        let mut out = std::io::stdout().lock();
        write!(out, "\x1b[2J\x1b[H").context("Failed to write to terminal")?;
        for line in screen.lines() {
            writeln!(out, "{}", line)?;
        }
        write!(out, "\n{}> ", status)?;
        out.flush().context("Failed to flush terminal")?;

        self.painted = Some(current);
        Ok(())
    }
}
