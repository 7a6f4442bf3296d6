use super::frames::{FrameLibrary, FramePatch, FrameSequence, merge_patch};
use crate::sink::SharedSink;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

const MIN_FRAME_DURATION: Duration = Duration::from_millis(16);

struct Target {
    sink: SharedSink,
    offset: usize,
}

struct AnimatorShared {
    generation: Cell<u64>,
    target: RefCell<Option<Target>>,
    current: RefCell<Option<String>>,
    library: FrameLibrary,
}

impl AnimatorShared {
    fn advance(&self) -> u64 {
        let generation = self.generation.get() + 1;
        self.generation.set(generation);
        generation
    }

    fn render(&self, patch: &FramePatch) {
        let target = self.target.borrow();
        let Some(target) = target.as_ref() else {
            return;
        };

        let lines = merge_patch(self.library.base(), patch);
        target
            .sink
            .borrow_mut()
            .set_lines(target.offset, target.offset + lines.len(), &lines);
    }
}

/// Plays frame sequences into a bound sink
///
/// Each scheduled tick carries the generation it was scheduled under.
/// `start_state` and `stop` bump the generation, so every tick from an older
/// chain finds itself stale, renders nothing and schedules nothing.
#[derive(Clone)]
pub struct Animator {
    shared: Rc<AnimatorShared>,
}

impl Animator {
    pub fn new(library: FrameLibrary) -> Self {
        Self {
            shared: Rc::new(AnimatorShared {
                generation: Cell::new(0),
                target: RefCell::new(None),
                current: RefCell::new(None),
                library,
            }),
        }
    }

    /// Render into lines `[offset, offset + base height)` of `sink`
    pub fn bind(&self, sink: SharedSink, offset: usize) {
        *self.shared.target.borrow_mut() = Some(Target { sink, offset });
    }

    #[cfg(test)]
    pub fn generation(&self) -> u64 {
        self.shared.generation.get()
    }

    pub fn current_state(&self) -> Option<String> {
        self.shared.current.borrow().clone()
    }

    #[cfg(test)]
    pub fn height(&self) -> usize {
        self.shared.library.base().len()
    }

    /// Switch to the named sequence. Must be called within a `LocalSet`.
    pub fn start_state(&self, name: &str) {
        let generation = self.shared.advance();
        let sequence = self.shared.library.sequence(name);
        *self.shared.current.borrow_mut() = Some(name.to_string());
        tracing::debug!("Animation {:?} (generation {})", name, generation);

        schedule_tick(
            Rc::clone(&self.shared),
            generation,
            sequence,
            0,
            Duration::ZERO,
        );
    }

    /// Invalidate the running sequence and show the base frame
    pub fn stop(&self) {
        let generation = self.shared.advance();
        self.shared.current.borrow_mut().take();
        tracing::debug!("Animation stopped (generation {})", generation);
        self.shared.render(&FramePatch::new());
    }
}

fn schedule_tick(
    shared: Rc<AnimatorShared>,
    generation: u64,
    sequence: Rc<FrameSequence>,
    index: usize,
    delay: Duration,
) {
    tokio::task::spawn_local(async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        tick(shared, generation, sequence, index);
    });
}

fn tick(shared: Rc<AnimatorShared>, generation: u64, sequence: Rc<FrameSequence>, index: usize) {
    if shared.generation.get() != generation {
        tracing::trace!(
            "Dropping stale tick (generation {}, now {})",
            generation,
            shared.generation.get()
        );
        return;
    }

    let frame = sequence.frame(index);
    shared.render(&frame.patch);

    let delay = frame.duration.max(MIN_FRAME_DURATION);
    let next = (index + 1) % sequence.len();
    schedule_tick(shared, generation, sequence, next, delay);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::animation::frames::Frame;
    use crate::sink::{LineBuffer, LineSink};
    use tokio::task::LocalSet;
    use tokio::time::sleep;

    /// Records every render instead of storing lines
    #[derive(Default)]
    struct RenderLog {
        renders: Vec<(usize, Vec<String>)>,
    }

    impl LineSink for RenderLog {
        fn set_lines(&mut self, start: usize, _end: usize, lines: &[String]) {
            self.renders.push((start, lines.to_vec()));
        }

        fn append_lines(&mut self, _lines: &[String]) {}

        fn line_count(&self) -> usize {
            0
        }
    }

    fn first_lines(log: &RenderLog) -> Vec<String> {
        log.renders.iter().map(|(_, lines)| lines[0].clone()).collect()
    }

    fn sequence(frames: &[(&str, u64)]) -> FrameSequence {
        FrameSequence::new(
            frames
                .iter()
                .map(|(text, ms)| {
                    Frame::new(FramePatch::new().line(1, *text), Duration::from_millis(*ms))
                })
                .collect(),
        )
    }

    fn animator() -> (Animator, Rc<RefCell<RenderLog>>) {
        let library = FrameLibrary::new(vec!["a".into(), "b".into(), "c".into()])
            .with_sequence("A", sequence(&[("A1", 20), ("A2", 20)]))
            .with_sequence("B", sequence(&[("B1", 5_000), ("B2", 20)]))
            .with_sequence("loop", sequence(&[("1", 20), ("2", 20)]));

        let log = Rc::new(RefCell::new(RenderLog::default()));
        let animator = Animator::new(library);
        animator.bind(log.clone(), 2);
        (animator, log)
    }

    #[tokio::test]
    async fn test_superseded_state_never_renders() {
        LocalSet::new()
            .run_until(async {
                let (animator, log) = animator();

                animator.start_state("A");
                animator.start_state("B");
                sleep(Duration::from_millis(150)).await;

                let log = log.borrow();
                assert_eq!(log.renders.len(), 1);
                assert_eq!(log.renders[0], (2, vec!["B1".into(), "b".into(), "c".into()]));
                assert_eq!(animator.generation(), 2);
                assert_eq!(animator.current_state().as_deref(), Some("B"));
            })
            .await;
    }

    #[tokio::test]
    async fn test_sequence_loops_until_stopped() {
        LocalSet::new()
            .run_until(async {
                let (animator, log) = animator();

                animator.start_state("loop");
                sleep(Duration::from_millis(150)).await;

                let rendered = first_lines(&log.borrow());
                assert!(rendered.len() >= 3, "{rendered:?}");
                for (i, line) in rendered.iter().enumerate() {
                    assert_eq!(line, if i % 2 == 0 { "1" } else { "2" });
                }

                animator.stop();
                let after_stop = log.borrow().renders.len();
                assert_eq!(first_lines(&log.borrow()).last().map(String::as_str), Some("a"));

                sleep(Duration::from_millis(100)).await;
                assert_eq!(log.borrow().renders.len(), after_stop);
                assert!(animator.current_state().is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn test_unknown_state_renders_base_once() {
        LocalSet::new()
            .run_until(async {
                let (animator, log) = animator();

                animator.start_state("missing");
                sleep(Duration::from_millis(50)).await;

                assert_eq!(first_lines(&log.borrow()), vec!["a"]);
            })
            .await;
    }

    #[tokio::test]
    async fn test_renders_into_line_buffer_at_offset() {
        LocalSet::new()
            .run_until(async {
                let buffer = Rc::new(RefCell::new(LineBuffer::new()));
                buffer
                    .borrow_mut()
                    .append_lines(&["title".to_string(), String::new()]);

                let animator = Animator::new(FrameLibrary::builtin());
                animator.bind(buffer.clone(), 2);
                animator.stop();
                buffer.borrow_mut().append_lines(&["transcript".to_string()]);

                animator.start_state("talking");
                sleep(Duration::from_millis(30)).await;

                let buffer = buffer.borrow();
                let lines = buffer.lines();
                assert_eq!(lines.len(), 2 + animator.height() + 1);
                assert_eq!(lines[0], "title");
                assert_eq!(lines[4], " (   o   ) ");
                assert_eq!(lines.last().map(String::as_str), Some("transcript"));
            })
            .await;
    }
}
