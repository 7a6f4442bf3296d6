use std::cell::RefCell;
use std::rc::Rc;

/// A mutable surface of ordered text lines
///
/// Shared by the animator and the transcript view. Ranges are half-open and
/// clamped to the current length, so writing past the end appends.
pub trait LineSink {
    /// Replace lines `[start, end)` with `lines`
    fn set_lines(&mut self, start: usize, end: usize, lines: &[String]);

    fn append_lines(&mut self, lines: &[String]);

    fn line_count(&self) -> usize;
}

pub type SharedSink = Rc<RefCell<dyn LineSink>>;

/// In-memory line buffer with a revision counter for cheap repaint checks
#[derive(Debug, Default)]
pub struct LineBuffer {
    lines: Vec<String>,
    revision: u64,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Bumped on every mutation
    pub fn revision(&self) -> u64 {
        self.revision
    }
}

impl LineSink for LineBuffer {
    fn set_lines(&mut self, start: usize, end: usize, lines: &[String]) {
        let start = start.min(self.lines.len());
        let end = end.clamp(start, self.lines.len());
        self.lines.splice(start..end, lines.iter().cloned());
        self.revision += 1;
    }

    fn append_lines(&mut self, lines: &[String]) {
        self.lines.extend(lines.iter().cloned());
        self.revision += 1;
    }

    fn line_count(&self) -> usize {
        self.lines.len()
    }
}
