//! wlgrab: capture a Wayland output through the compositor's screencopy
//! protocol and report live frame statistics.
//!
//! ```text
//! wlgrab [config.json]        (or WLGRAB_CONFIG=config.json wlgrab)
//!
//! compositor ──screencopy──► wlgrab-capture thread ──frames──► recorder
//!                                                              └─ status log (1 Hz)
//! ```
//!
//! Ctrl-C stops the session cleanly; `maxFrames` in the config stops it
//! after that many frames.

mod config;
#[cfg(target_os = "linux")]
mod pipeline;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::RecorderConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("wlgrab v{}", env!("CARGO_PKG_VERSION"));

    let config = RecorderConfig::from_args_or_env(std::env::args().nth(1))?;
    info!(
        "Output {} at {} fps, {} buffers, backend {}",
        config.capture.output_index,
        config.capture.target_fps,
        config.capture.buffer_count,
        config.capture.backend.map_or_else(|| "auto".to_owned(), |b| b.to_string()),
    );

    run(config).await
}

#[cfg(target_os = "linux")]
async fn run(config: RecorderConfig) -> Result<()> {
    let status = pipeline::Recorder::new(config).run().await?;
    info!("Captured {} frame(s), dropped {}", status.frames, status.dropped);
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn run(_config: RecorderConfig) -> Result<()> {
    anyhow::bail!("wlgrab needs a Wayland compositor and only runs on Linux")
}
