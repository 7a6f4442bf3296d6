pub mod animator;
pub mod frames;

pub use animator::Animator;
pub use frames::FrameLibrary;
