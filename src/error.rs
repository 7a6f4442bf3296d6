use std::io;

/// Errors produced by the process, streaming and recording layers.
///
/// Terminal errors are delivered once through the completion callback of the
/// operation that produced them. `MalformedEvent` is the one local-recovery
/// case: the decoder logs it and skips the offending line.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Missing credential or otherwise unusable request setup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A network-facing job exited non-zero or answered with something unusable.
    #[error("transport error: {0}")]
    Transport(String),

    /// The executable could not be started at all.
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// A single streamed line that could not be parsed.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// Temp artifact creation or cleanup failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CoreError {
    pub fn missing_credential(env_var: &str) -> Self {
        Self::Configuration(format!(
            "no API key found (set api_key in config, export {env_var}, or add it to the credentials file)"
        ))
    }
}
