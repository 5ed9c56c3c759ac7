use anyhow::Result;
use sidecars_core::launcher::Launcher;
use tracing::instrument;

/// Print artifact hashes so they can be pinned in the configuration
#[instrument(skip(launcher))]
pub async fn execute_sha1(launcher: Launcher) -> Result<()> {
    launcher.show_artifact_hashes().await?;
    Ok(())
}
