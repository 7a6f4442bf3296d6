//! Incremental decoder for the `data:`-prefixed event stream a streaming
//! chat-completion endpoint writes to stdout.
//!
//! Chunks may split anywhere, including inside a UTF-8 sequence, so the
//! partial line is buffered as bytes and only decoded once its newline
//! arrives.

use crate::error::CoreError;
use serde::Deserialize;

const EVENT_PREFIX: &str = "data:";
const END_MARKER: &str = "[DONE]";

/// One classified line of the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Token(String),
    End,
    Skip,
}

#[derive(Debug, Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default)]
pub struct LineDecoder {
    partial: Vec<u8>,
    finished: bool,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw chunk, returning the events for every line it completed.
    ///
    /// Once `End` has been produced the decoder is finished and ignores
    /// everything that follows.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        self.partial.extend_from_slice(chunk);

        let mut consumed = 0;
        while let Some(offset) = self.partial[consumed..].iter().position(|&b| b == b'\n') {
            let line_end = consumed + offset;
            let line = String::from_utf8_lossy(&self.partial[consumed..line_end]).into_owned();
            consumed = line_end + 1;

            let event = classify_line(&line);
            let is_end = event == StreamEvent::End;
            events.push(event);

            if is_end {
                self.finished = true;
                self.partial.clear();
                return events;
            }
        }

        self.partial.drain(..consumed);
        events
    }

    #[cfg(test)]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Bytes of an unterminated trailing line. These are never emitted.
    pub fn pending_bytes(&self) -> usize {
        self.partial.len()
    }
}

fn classify_line(line: &str) -> StreamEvent {
    let line = line.strip_suffix('\r').unwrap_or(line);
    if line.is_empty() {
        return StreamEvent::Skip;
    }

    let Some(payload) = line.strip_prefix(EVENT_PREFIX) else {
        return StreamEvent::Skip;
    };

    let payload = payload.trim_start();
    if payload.trim_end() == END_MARKER {
        return StreamEvent::End;
    }

    match parse_payload(payload) {
        Ok(Some(text)) => StreamEvent::Token(text),
        Ok(None) => StreamEvent::Skip,
        Err(e) => {
            tracing::debug!("Skipping line: {}", e);
            StreamEvent::Skip
        }
    }
}

fn parse_payload(payload: &str) -> Result<Option<String>, CoreError> {
    let chunk: ChunkPayload =
        serde_json::from_str(payload).map_err(|e| CoreError::MalformedEvent(e.to_string()))?;

    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta)
        .and_then(|delta| delta.content)
        .filter(|text| !text.is_empty()))
}
