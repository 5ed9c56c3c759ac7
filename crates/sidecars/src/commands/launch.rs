//! Launch command: supervise sidecars and the application

use anyhow::Result;
use sidecars_core::launcher::Launcher;
use tracing::{info, instrument};

#[instrument(skip(launcher))]
pub async fn execute_launch(launcher: Launcher) -> Result<()> {
    info!(app_port = launcher.app_port(), "Launching sidecars");
    launcher.launch().await?;
    info!("All processes stopped");
    Ok(())
}
