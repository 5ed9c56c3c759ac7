//! Platform collaborators ("starters")
//!
//! A starter knows how the main application is launched on one hosting
//! environment. Exactly one is selected per run, either by name or by the
//! first one whose detection fires.

use crate::errors::{Result, SidecarsError};
use crate::variable::EnvMap;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, warn};

/// File holding the application start command (`start:` key)
pub const PROCFILE: &str = "Procfile";

/// Variable set on Cloud Foundry containers
pub const CF_DETECT_ENV_KEY: &str = "VCAP_APPLICATION";

/// Launcher path exported on buildpacks.io images
pub const BUILDPACKS_IO_LAUNCHER_ENV_KEY: &str = "BUILDPACKS_IO_LAUNCHER_PATH";

const CF_LIFECYCLE_LAUNCHER: &str = "/tmp/lifecycle/launcher";

const DEFAULT_LOCAL_PORT: u16 = 8080;

/// Sources the profile scripts then runs the start command
const LOCAL_LAUNCHER_SCRIPT: &str = r#"
set -e
cd "$1"
if [ -n "$(ls $2/* 2> /dev/null)" ]; then
  for env_file in $2/*; do
    source $env_file
  done
fi
if [ -n "$(ls .profile.d/* 2> /dev/null)" ]; then
  for env_file in .profile.d/*; do
    source $env_file
  done
fi
if [ -f .profile ]; then
  source .profile
fi
shift
shift
bash -c "$@"
"#;

/// Capability set of a hosting environment
pub trait Starter: Send + Sync + fmt::Debug {
    /// Environment name, as accepted by `--cloud-env`
    fn name(&self) -> &'static str;

    /// Whether the environment described by `env` is this platform
    fn detect(&self, env: &EnvMap) -> bool;

    /// Port the platform advertises for the application
    fn app_port(&self, env: &EnvMap) -> Option<u16>;

    /// Variables telling a process to listen on `port`
    fn proxy_env(&self, port: u16) -> EnvMap;

    /// Command running the main application with `env`
    fn start_cmd(&self, env: &EnvMap, profile_dir: &Path) -> Result<Command>;
}

#[derive(Deserialize)]
struct Procfile {
    #[serde(default)]
    start: String,
}

/// Start command declared in `<dir>/Procfile`; empty when absent or unreadable
pub fn read_start_command(dir: &Path) -> String {
    let path = dir.join(PROCFILE);
    let Ok(content) = fs::read_to_string(&path) else {
        debug!(path = %path.display(), "No Procfile");
        return String::new();
    };
    match serde_yaml::from_str::<Procfile>(&content) {
        Ok(procfile) => procfile.start,
        Err(e) => {
            warn!(path = %path.display(), "Ignoring unparsable Procfile: {}", e);
            String::new()
        }
    }
}

fn port_from_env(env: &EnvMap) -> Option<u16> {
    env.get("PORT").and_then(|p| p.trim().parse().ok())
}

fn port_env(port: u16) -> EnvMap {
    let port = port.to_string();
    EnvMap::from([
        ("PORT".to_string(), port.clone()),
        ("VCAP_APP_PORT".to_string(), port),
    ])
}

fn command_with_env(program: impl AsRef<std::ffi::OsStr>, env: &EnvMap) -> Command {
    let mut cmd = Command::new(program);
    cmd.env_clear().envs(env);
    cmd
}

fn parent_or_self(dir: &Path) -> PathBuf {
    dir.parent().unwrap_or(dir).to_path_buf()
}

/// Cloud Foundry, through the lifecycle launcher
#[derive(Debug, Clone)]
pub struct CloudFoundry {
    cwd: PathBuf,
}

impl CloudFoundry {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self { cwd: cwd.into() }
    }

    fn launcher_path(&self) -> PathBuf {
        let lifecycle = Path::new(CF_LIFECYCLE_LAUNCHER);
        if lifecycle.exists() {
            lifecycle.to_path_buf()
        } else {
            self.cwd.join("launcher")
        }
    }
}

impl Starter for CloudFoundry {
    fn name(&self) -> &'static str {
        "cloudfoundry"
    }

    fn detect(&self, env: &EnvMap) -> bool {
        env.get(CF_DETECT_ENV_KEY).is_some_and(|v| !v.is_empty())
    }

    fn app_port(&self, env: &EnvMap) -> Option<u16> {
        port_from_env(env)
    }

    fn proxy_env(&self, port: u16) -> EnvMap {
        port_env(port)
    }

    fn start_cmd(&self, env: &EnvMap, _profile_dir: &Path) -> Result<Command> {
        let mut cmd = command_with_env(self.launcher_path(), env);
        cmd.arg(&self.cwd)
            .arg(read_start_command(&self.cwd))
            .arg("")
            .current_dir(parent_or_self(&self.cwd));
        Ok(cmd)
    }
}

/// buildpacks.io images, through their exported launcher
#[derive(Debug, Clone)]
pub struct BuildpacksIo {
    cwd: PathBuf,
}

impl BuildpacksIo {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self { cwd: cwd.into() }
    }
}

impl Starter for BuildpacksIo {
    fn name(&self) -> &'static str {
        "buildpacksio"
    }

    fn detect(&self, env: &EnvMap) -> bool {
        env.get(BUILDPACKS_IO_LAUNCHER_ENV_KEY)
            .is_some_and(|v| !v.is_empty())
    }

    fn app_port(&self, env: &EnvMap) -> Option<u16> {
        port_from_env(env)
    }

    fn proxy_env(&self, port: u16) -> EnvMap {
        port_env(port)
    }

    fn start_cmd(&self, env: &EnvMap, _profile_dir: &Path) -> Result<Command> {
        let launcher = env
            .get(BUILDPACKS_IO_LAUNCHER_ENV_KEY)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| SidecarsError::NoStarter {
                env: self.name().to_string(),
            })?;
        let mut cmd = command_with_env(launcher, env);
        cmd.arg(read_start_command(&self.cwd))
            .current_dir(parent_or_self(&self.cwd));
        Ok(cmd)
    }
}

/// Plain host, through an embedded bash launcher
#[derive(Debug, Clone)]
pub struct Local {
    cwd: PathBuf,
}

impl Local {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self { cwd: cwd.into() }
    }
}

impl Starter for Local {
    fn name(&self) -> &'static str {
        "localcloud"
    }

    fn detect(&self, _env: &EnvMap) -> bool {
        true
    }

    fn app_port(&self, env: &EnvMap) -> Option<u16> {
        Some(port_from_env(env).unwrap_or(DEFAULT_LOCAL_PORT))
    }

    fn proxy_env(&self, port: u16) -> EnvMap {
        let mut env = EnvMap::from([(
            crate::launcher::PROXY_APP_PORT_ENV_KEY.to_string(),
            port.to_string(),
        )]);
        env.extend(port_env(port));
        env
    }

    fn start_cmd(&self, env: &EnvMap, profile_dir: &Path) -> Result<Command> {
        let argv0 = std::env::args()
            .next()
            .unwrap_or_else(|| "cloud-sidecars".to_string());
        let mut cmd = command_with_env("bash", env);
        cmd.arg("-c")
            .arg(LOCAL_LAUNCHER_SCRIPT)
            .arg(argv0)
            .arg(&self.cwd)
            .arg(profile_dir)
            .arg(read_start_command(&self.cwd))
            .current_dir(&self.cwd);
        Ok(cmd)
    }
}

/// Every known starter, in detection order
pub fn retrieve(cwd: &Path) -> Vec<Arc<dyn Starter>> {
    vec![
        Arc::new(CloudFoundry::new(cwd)),
        Arc::new(BuildpacksIo::new(cwd)),
        Arc::new(Local::new(cwd)),
    ]
}

/// Pick the starter named `name`, or the first one detecting `env`
pub fn select(name: Option<&str>, cwd: &Path, env: &EnvMap) -> Result<Arc<dyn Starter>> {
    let starters = retrieve(cwd);
    let found = match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(wanted) => starters
            .into_iter()
            .find(|s| s.name().eq_ignore_ascii_case(wanted)),
        None => starters.into_iter().find(|s| s.detect(env)),
    };
    found.ok_or_else(|| SidecarsError::NoStarter {
        env: name.unwrap_or("auto").to_string(),
    })
}
