//! Vendor command: download artifacts without touching profile scripts

use anyhow::Result;
use sidecars_core::launcher::Launcher;
use tracing::instrument;

#[instrument(skip(launcher))]
pub async fn execute_vendor(mut launcher: Launcher, force: bool) -> Result<()> {
    launcher.download_artifacts(force).await?;
    Ok(())
}
