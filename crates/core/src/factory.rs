//! Process factory
//!
//! Turns sidecar declarations and the active starter into ready-to-start
//! [`ProcessDescriptor`]s with resolved working directory, executable,
//! arguments and environment.

use crate::config::{SidecarSpec, SIDECARS_DIR};
use crate::errors::{ConfigError, Result, SidecarsError};
use crate::output::OutputSinks;
use crate::process::{ProcessDescriptor, ProcessRole};
use crate::starter::Starter;
use crate::variable::{template_args, EnvMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

/// Directory holding the extracted artifact of sidecar `name`
pub fn sidecar_dir(base_dir: &Path, name: &str) -> PathBuf {
    base_dir.join(SIDECARS_DIR).join(name)
}

/// Executable path: inside the sidecar directory for artifacts, as given otherwise
pub fn sidecar_exec_path(base_dir: &Path, spec: &SidecarSpec) -> PathBuf {
    if spec.has_artifact() {
        sidecar_dir(base_dir, spec.name()).join(spec.executable())
    } else {
        PathBuf::from(spec.executable())
    }
}

/// Log prefix of a sidecar
pub fn sidecar_prefix(name: &str) -> String {
    format!("[sidecar:{}]", name)
}

#[derive(Debug, Clone)]
pub struct ProcessFactory {
    base_dir: PathBuf,
    sinks: OutputSinks,
    starter: Option<Arc<dyn Starter>>,
}

impl ProcessFactory {
    pub fn new(base_dir: impl Into<PathBuf>, starter: Option<Arc<dyn Starter>>) -> Self {
        Self {
            base_dir: base_dir.into(),
            sinks: OutputSinks::default(),
            starter,
        }
    }

    pub fn with_sinks(mut self, sinks: OutputSinks) -> Self {
        self.sinks = sinks;
        self
    }

    /// Working directory: spec override, then base dir, then current dir
    fn work_dir(&self, spec: &SidecarSpec) -> Result<PathBuf> {
        let dir = match spec.work_dir() {
            Some(dir) => dir.to_path_buf(),
            None if !self.base_dir.as_os_str().is_empty() => self.base_dir.clone(),
            None => std::env::current_dir().map_err(ConfigError::Io)?,
        };
        if !dir.is_dir() {
            return Err(ConfigError::WorkDirMissing {
                path: dir.display().to_string(),
            }
            .into());
        }
        Ok(dir)
    }

    /// Build the descriptor of a sidecar running with `env`
    pub fn from_sidecar(&self, spec: &SidecarSpec, env: &EnvMap) -> Result<ProcessDescriptor> {
        let work_dir = self.work_dir(spec)?;
        let args = template_args(env, spec.args())?;
        let program = sidecar_exec_path(&self.base_dir, spec);
        debug!(
            sidecar = %spec.name(),
            program = %program.display(),
            work_dir = %work_dir.display(),
            "Building sidecar command"
        );

        let mut command = Command::new(&program);
        command
            .args(&args)
            .env_clear()
            .envs(env)
            .current_dir(&work_dir);
        isolate(&mut command);

        let prefix = (!spec.no_log_prefix()).then(|| sidecar_prefix(spec.name()));
        Ok(
            ProcessDescriptor::new(spec.name(), ProcessRole::Sidecar, command)
                .with_prefix(prefix)
                .with_sinks(self.sinks.clone())
                .with_no_interrupt(spec.no_interrupt_when_stop()),
        )
    }

    /// Build the descriptor of the main application
    ///
    /// Its exit always ends the run and is never reported as a failure.
    pub fn from_application(&self, env: &EnvMap, profile_dir: &Path) -> Result<ProcessDescriptor> {
        let starter = self
            .starter
            .as_ref()
            .ok_or_else(|| SidecarsError::NoStarter {
                env: "none".to_string(),
            })?;
        let mut command = starter.start_cmd(env, profile_dir)?;
        isolate(&mut command);

        Ok(
            ProcessDescriptor::new(starter.name(), ProcessRole::Application, command)
                .with_sinks(self.sinks.clone())
                .with_no_interrupt(true)
                .with_always_interrupt(true),
        )
    }
}

/// Own process group, and no orphan if the supervisor drops the child
fn isolate(command: &mut Command) {
    #[cfg(unix)]
    command.process_group(0);
    command.kill_on_drop(true);
}
