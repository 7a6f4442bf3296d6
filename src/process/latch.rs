use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// One-shot guard: the first `try_fire` wins, every later call is a no-op.
///
/// Backed by an atomic so triggers raised before marshaling onto the local
/// thread are still safe to check.
#[derive(Debug, Clone, Default)]
pub struct Latch {
    fired: Arc<AtomicBool>,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` exactly once across all clones.
    pub fn try_fire(&self) -> bool {
        !self.fired.swap(true, Ordering::AcqRel)
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fire_wins() {
        let latch = Latch::new();
        let other = latch.clone();

        assert!(!latch.is_fired());
        assert!(other.try_fire());
        assert!(!latch.try_fire());
        assert!(!other.try_fire());
        assert!(latch.is_fired());
    }

    #[test]
    fn test_fire_across_threads_happens_once() {
        let latch = Latch::new();
        let winners: usize = (0..8)
            .map(|_| {
                let latch = latch.clone();
                std::thread::spawn(move || latch.try_fire())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap_or(false) as usize)
            .sum();

        assert_eq!(winners, 1);
    }
}
