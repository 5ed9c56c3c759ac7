//! Setup command, run at staging time

use anyhow::Result;
use sidecars_core::launcher::Launcher;
use tracing::{debug, instrument};

#[instrument(skip(launcher))]
pub async fn execute_setup(mut launcher: Launcher, force: bool) -> Result<()> {
    debug!(profile_dir = %launcher.profile_dir().display(), "Running setup");
    launcher.setup(force).await?;
    Ok(())
}
