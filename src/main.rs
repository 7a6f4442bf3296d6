mod animation;
mod app;
mod config;
mod controller;
mod credentials;
mod decoder;
mod error;
mod messages;
mod process;
mod services;
mod sink;
mod text_processing;
mod transcript;
mod transcription;
mod transport;

#[cfg(test)]
mod testing;

use app::App;
use config::Config;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Logs go to stderr so they never land in the chat screen
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    tracing::info!("Starting parley");

    let config = Config::load()?;
    config.validate()?;

    // Process callbacks, the animator and the controller are !Send and share
    // this thread, so everything runs on one LocalSet
    let local = tokio::task::LocalSet::new();

    local
        .run_until(async move { App::new(config)?.run().await })
        .await
}
