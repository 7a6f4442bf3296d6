pub mod chat;
pub mod recorder;

pub use chat::ChatClient;
pub use recorder::RecordingPipeline;
