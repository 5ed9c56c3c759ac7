use crate::commands::shared::{build_launcher, GlobalArgs};
use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Log level options
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    /// Error messages only
    Error,
    /// Warning and error messages
    Warn,
    /// Informational messages and above
    Info,
    /// Debug messages and above
    Debug,
    /// All messages including trace
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Sidecar supervisor subcommands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start sidecars and the application, stopping all of them when one fails
    Launch {
        /// Do not start the application, only the sidecars
        #[arg(long)]
        no_starter: bool,
    },

    /// Download artifacts and write profile scripts (staging)
    Setup {
        /// Download artifacts even if their directory is not empty
        #[arg(long)]
        force: bool,
    },

    /// Download sidecar artifacts only
    Vendor {
        /// Download artifacts even if their directory is not empty
        #[arg(long)]
        force: bool,
    },

    /// Print the sha1 of every sidecar artifact
    Sha1,
}

#[derive(Debug, Parser)]
#[command(
    name = "cloud-sidecars",
    version,
    about = "Run sidecars alongside an application in buildpack-style clouds",
    color = clap::ColorChoice::Auto
)]
pub struct Cli {
    /// Path to the configuration file, relative to the base directory
    #[arg(
        short = 'c',
        long,
        global = true,
        value_name = "PATH",
        default_value = sidecars_core::config::CONFIG_FILE_NAME
    )]
    pub config_path: PathBuf,

    /// Base directory of the application (defaults to the current directory)
    #[arg(short = 'd', long, global = true, value_name = "PATH")]
    pub dir: Option<PathBuf>,

    /// Log level (overrides the configuration file)
    #[arg(short = 'l', long, global = true, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Force a cloud environment instead of detecting it
    #[arg(long, global = true, value_name = "NAME")]
    pub cloud_env: Option<String>,

    /// Write logs as JSON
    #[arg(short = 'j', long, global = true)]
    pub log_json: bool,

    /// Disable colored logs
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Directory receiving generated profile scripts (defaults to <dir>/profile.d)
    #[arg(long, global = true, value_name = "PATH")]
    pub profile_dir: Option<PathBuf>,

    /// Application port used when the platform does not provide one
    #[arg(long, global = true, default_value_t = sidecars_core::launcher::DEFAULT_APP_PORT)]
    pub app_port: u16,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    fn global_args(&self) -> GlobalArgs {
        GlobalArgs {
            config_path: self.config_path.clone(),
            dir: self.dir.clone(),
            log_level: self.log_level.map(|l| l.as_str().to_string()),
            cloud_env: self.cloud_env.clone(),
            log_json: self.log_json,
            no_color: self.no_color,
            profile_dir: self.profile_dir.clone(),
            app_port: self.app_port,
        }
    }

    /// Dispatch the parsed command
    pub async fn dispatch(self) -> Result<()> {
        let global = self.global_args();
        match self.command {
            Commands::Launch { no_starter } => {
                let launcher = build_launcher(&global, no_starter)?;
                crate::commands::launch::execute_launch(launcher).await
            }
            Commands::Setup { force } => {
                let launcher = build_launcher(&global, false)?;
                crate::commands::setup::execute_setup(launcher, force).await
            }
            Commands::Vendor { force } => {
                let launcher = build_launcher(&global, false)?;
                crate::commands::vendor::execute_vendor(launcher, force).await
            }
            Commands::Sha1 => {
                let launcher = build_launcher(&global, false)?;
                crate::commands::sha1::execute_sha1(launcher).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "cloud-sidecars",
            "launch",
            "--no-starter",
            "-d",
            "/srv/app",
            "-l",
            "debug",
            "--app-port",
            "9000",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Launch { no_starter: true }));
        assert_eq!(cli.dir, Some(PathBuf::from("/srv/app")));
        assert_eq!(cli.app_port, 9000);
        assert_eq!(cli.config_path, PathBuf::from("sidecars-config.yml"));
        let global = cli.global_args();
        assert_eq!(global.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_setup_force() {
        let cli = Cli::try_parse_from(["cloud-sidecars", "setup", "--force"]).unwrap();
        assert!(matches!(cli.command, Commands::Setup { force: true }));
    }
}
