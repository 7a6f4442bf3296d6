use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::time::Duration;

const STILL_FRAME_DURATION: Duration = Duration::from_secs(1);

/// Sparse override of a base layout, keyed by 1-based line number
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FramePatch {
    lines: BTreeMap<usize, String>,
}

impl FramePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn line(mut self, number: usize, text: impl Into<String>) -> Self {
        self.lines.insert(number, text.into());
        self
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Overlay `patch` on `base`. Line numbers outside the base are ignored.
pub fn merge_patch(base: &[String], patch: &FramePatch) -> Vec<String> {
    let mut merged = base.to_vec();
    for (&number, text) in &patch.lines {
        if let Some(line) = number.checked_sub(1).and_then(|i| merged.get_mut(i)) {
            line.clone_from(text);
        }
    }
    merged
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub patch: FramePatch,
    pub duration: Duration,
}

impl Frame {
    pub fn new(patch: FramePatch, duration: Duration) -> Self {
        Self { patch, duration }
    }
}

/// Non-empty, looping list of frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSequence {
    frames: Vec<Frame>,
}

impl FrameSequence {
    /// An empty list becomes the single still frame
    pub fn new(frames: Vec<Frame>) -> Self {
        if frames.is_empty() {
            return Self::still();
        }
        Self { frames }
    }

    pub fn still() -> Self {
        Self {
            frames: vec![Frame::new(FramePatch::new(), STILL_FRAME_DURATION)],
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn frame(&self, index: usize) -> &Frame {
        &self.frames[index % self.frames.len()]
    }
}

/// Base layout plus the named sequences drawn over it
pub struct FrameLibrary {
    base: Vec<String>,
    sequences: HashMap<String, Rc<FrameSequence>>,
    still: Rc<FrameSequence>,
}

impl FrameLibrary {
    pub fn new(base: Vec<String>) -> Self {
        Self {
            base,
            sequences: HashMap::new(),
            still: Rc::new(FrameSequence::still()),
        }
    }

    pub fn with_sequence(mut self, name: impl Into<String>, sequence: FrameSequence) -> Self {
        self.sequences.insert(name.into(), Rc::new(sequence));
        self
    }

    pub fn base(&self) -> &[String] {
        &self.base
    }

    pub fn sequence(&self, name: &str) -> Rc<FrameSequence> {
        match self.sequences.get(name) {
            Some(sequence) => Rc::clone(sequence),
            None => {
                tracing::debug!("No frames for {:?}, showing still frame", name);
                Rc::clone(&self.still)
            }
        }
    }

    /// The companion face and its moods
    pub fn builtin() -> Self {
        let ms = Duration::from_millis;
        let base = ["  .-----.  ", " ( o   o ) ", " (   -   ) ", "  '-----'  "]
            .map(String::from)
            .to_vec();

        Self::new(base)
            .with_sequence(
                "idle",
                FrameSequence::new(vec![
                    Frame::new(FramePatch::new(), ms(2400)),
                    Frame::new(FramePatch::new().line(2, " ( -   - ) "), ms(150)),
                ]),
            )
            .with_sequence(
                "thinking",
                FrameSequence::new(vec![
                    Frame::new(FramePatch::new().line(2, " (  o   o) ").line(3, " (   ~   ) ."), ms(350)),
                    Frame::new(FramePatch::new().line(2, " (  o   o) ").line(3, " (   ~   ) .."), ms(350)),
                    Frame::new(FramePatch::new().line(2, " (  o   o) ").line(3, " (   ~   ) ..."), ms(350)),
                ]),
            )
            .with_sequence(
                "talking",
                FrameSequence::new(vec![
                    Frame::new(FramePatch::new().line(3, " (   o   ) "), ms(120)),
                    Frame::new(FramePatch::new(), ms(100)),
                    Frame::new(FramePatch::new().line(3, " (   O   ) "), ms(140)),
                    Frame::new(FramePatch::new().line(3, " (   -   ) "), ms(90)),
                ]),
            )
            .with_sequence(
                "listening",
                FrameSequence::new(vec![
                    Frame::new(FramePatch::new().line(2, " ( O   O ) ").line(3, " (   .   ) "), ms(500)),
                    Frame::new(FramePatch::new().line(3, " (   .   ) "), ms(500)),
                ]),
            )
            .with_sequence(
                "error",
                FrameSequence::new(vec![Frame::new(
                    FramePatch::new().line(2, " ( x   x ) ").line(3, " (   ~   ) "),
                    ms(1000),
                )]),
            )
    }
}
