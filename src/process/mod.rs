pub mod job;
pub mod latch;

pub use job::{CommandSpec, JobCallbacks, JobExit, JobHandle, JobId, JobState, spawn};
pub use latch::Latch;
