//! Shared command plumbing: configuration discovery, logging and launcher construction

use anyhow::{Context, Result};
use sidecars_core::config::{discover_config, LaunchConfig};
use sidecars_core::launcher::Launcher;
use sidecars_core::logging::{self, LogFormat, LogSettings};
use sidecars_core::starter;
use sidecars_core::variable::os_env;
use std::path::PathBuf;
use tracing::debug;

/// Flags accepted by every subcommand
#[derive(Debug, Clone)]
pub struct GlobalArgs {
    pub config_path: PathBuf,
    pub dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub cloud_env: Option<String>,
    pub log_json: bool,
    pub no_color: bool,
    pub profile_dir: Option<PathBuf>,
    pub app_port: u16,
}

/// Command line flags win over the configuration file
fn log_settings(global: &GlobalArgs, config: &LaunchConfig) -> LogSettings {
    let json = global.log_json || config.log_json;
    LogSettings {
        format: json.then_some(LogFormat::Json),
        level: global.log_level.clone().or_else(|| config.log_level.clone()),
        no_color: global.no_color || config.no_color,
    }
}

/// Load configuration, initialize logging and build the launcher
pub fn build_launcher(global: &GlobalArgs, no_starter: bool) -> Result<Launcher> {
    let dir = match &global.dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Failed to determine current directory")?,
    };
    let location = discover_config(&dir, &global.config_path)?;
    let mut config = LaunchConfig::load(&location.path)?;
    config.dir = Some(location.base_dir.clone());
    config.no_starter = config.no_starter || no_starter;

    logging::init(&log_settings(global, &config))?;
    debug!(
        config = %location.path.display(),
        base_dir = %location.base_dir.display(),
        sidecars = config.sidecars.len(),
        "Loaded configuration"
    );

    let starter = if config.no_starter {
        None
    } else {
        Some(starter::select(
            global.cloud_env.as_deref(),
            &location.base_dir,
            &os_env(),
        )?)
    };
    let profile_dir = global
        .profile_dir
        .clone()
        .unwrap_or_else(|| location.base_dir.join("profile.d"));

    Ok(Launcher::new(config, starter, profile_dir, global.app_port)?)
}
