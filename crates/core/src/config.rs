//! Sidecar configuration model and loading
//!
//! A configuration file (`sidecars-config.yml`) declares the ordered list of
//! sidecars plus a few supervisor-wide settings. [`SidecarSpec`] values can
//! only be obtained through validation, so a spec without a name or an
//! executable never exists past load time.

use crate::errors::{ConfigError, Result};
use indexmap::IndexMap;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Default configuration file name
pub const CONFIG_FILE_NAME: &str = "sidecars-config.yml";

/// Directory (relative to the base dir) holding extracted sidecars and the index
pub const SIDECARS_DIR: &str = ".sidecars";

/// Default delay between the graceful signal and the forced kill
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(20);

/// Raw, unvalidated shape of a sidecar entry
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct SidecarSpecDef {
    name: String,
    executable: String,
    artifact_uri: String,
    artifact_type: String,
    artifact_sha1: String,
    #[serde(alias = "after_download")]
    after_install: String,
    args: Vec<String>,
    env: IndexMap<String, String>,
    app_env: IndexMap<String, String>,
    profiled: String,
    work_dir: String,
    no_log_prefix: bool,
    is_rproxy: bool,
    no_interrupt_when_stop: bool,
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Sidecar names become directory and file names under the sidecars and profile dirs
pub fn check_sidecar_name(name: &str) -> std::result::Result<(), ConfigError> {
    if name.starts_with('.') || name.contains(['/', '\\']) || name.contains("..") {
        return Err(ConfigError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// One auxiliary process declaration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "SidecarSpecDef")]
pub struct SidecarSpec {
    name: String,
    executable: String,
    artifact_uri: Option<String>,
    artifact_type: Option<String>,
    artifact_sha1: Option<String>,
    after_install: Option<String>,
    args: Vec<String>,
    env: IndexMap<String, String>,
    app_env: IndexMap<String, String>,
    profiled: Option<String>,
    work_dir: Option<PathBuf>,
    no_log_prefix: bool,
    is_rproxy: bool,
    no_interrupt_when_stop: bool,
}

impl TryFrom<SidecarSpecDef> for SidecarSpec {
    type Error = ConfigError;

    fn try_from(def: SidecarSpecDef) -> std::result::Result<Self, Self::Error> {
        let mut spec = SidecarSpec::new(def.name, def.executable)?;
        spec.artifact_uri = non_empty(def.artifact_uri);
        spec.artifact_type = non_empty(def.artifact_type);
        spec.artifact_sha1 = non_empty(def.artifact_sha1);
        spec.after_install = non_empty(def.after_install);
        spec.args = def.args;
        spec.env = def.env;
        spec.app_env = def.app_env;
        spec.profiled = non_empty(def.profiled);
        spec.work_dir = non_empty(def.work_dir).map(PathBuf::from);
        spec.no_log_prefix = def.no_log_prefix;
        spec.is_rproxy = def.is_rproxy;
        spec.no_interrupt_when_stop = def.no_interrupt_when_stop;
        Ok(spec)
    }
}

impl SidecarSpec {
    /// Create a spec, failing when name or executable is empty
    pub fn new(
        name: impl Into<String>,
        executable: impl Into<String>,
    ) -> std::result::Result<Self, ConfigError> {
        let name = name.into();
        let executable = executable.into();
        if name.trim().is_empty() {
            return Err(ConfigError::MissingName);
        }
        check_sidecar_name(&name)?;
        if executable.trim().is_empty() {
            return Err(ConfigError::MissingExecutable { name });
        }
        Ok(Self {
            name,
            executable,
            artifact_uri: None,
            artifact_type: None,
            artifact_sha1: None,
            after_install: None,
            args: Vec::new(),
            env: IndexMap::new(),
            app_env: IndexMap::new(),
            profiled: None,
            work_dir: None,
            no_log_prefix: false,
            is_rproxy: false,
            no_interrupt_when_stop: false,
        })
    }

    /// Set the artifact source (URI, optional type hint, optional sha1)
    pub fn with_artifact(
        mut self,
        uri: impl Into<String>,
        artifact_type: Option<&str>,
        sha1: Option<&str>,
    ) -> Self {
        self.artifact_uri = non_empty(uri.into());
        self.artifact_type = artifact_type.map(str::to_string).and_then(non_empty);
        self.artifact_sha1 = sha1.map(str::to_string).and_then(non_empty);
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env<I, K, V>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = env.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    pub fn with_app_env<I, K, V>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.app_env = env.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    pub fn with_after_install(mut self, script: impl Into<String>) -> Self {
        self.after_install = non_empty(script.into());
        self
    }

    pub fn with_profiled(mut self, body: impl Into<String>) -> Self {
        self.profiled = non_empty(body.into());
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn with_no_log_prefix(mut self, value: bool) -> Self {
        self.no_log_prefix = value;
        self
    }

    pub fn with_rproxy(mut self, value: bool) -> Self {
        self.is_rproxy = value;
        self
    }

    pub fn with_no_interrupt_when_stop(mut self, value: bool) -> Self {
        self.no_interrupt_when_stop = value;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    pub fn artifact_uri(&self) -> Option<&str> {
        self.artifact_uri.as_deref()
    }

    pub fn artifact_type(&self) -> Option<&str> {
        self.artifact_type.as_deref()
    }

    pub fn artifact_sha1(&self) -> Option<&str> {
        self.artifact_sha1.as_deref()
    }

    /// Whether this sidecar is delivered as a downloadable artifact
    pub fn has_artifact(&self) -> bool {
        self.artifact_uri.is_some()
    }

    pub fn after_install(&self) -> Option<&str> {
        self.after_install.as_deref()
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Process-level environment overrides
    pub fn env(&self) -> &IndexMap<String, String> {
        &self.env
    }

    /// Contributions to the application-wide environment
    pub fn app_env(&self) -> &IndexMap<String, String> {
        &self.app_env
    }

    pub fn profiled(&self) -> Option<&str> {
        self.profiled.as_deref()
    }

    pub fn work_dir(&self) -> Option<&Path> {
        self.work_dir.as_deref()
    }

    pub fn no_log_prefix(&self) -> bool {
        self.no_log_prefix
    }

    pub fn is_rproxy(&self) -> bool {
        self.is_rproxy
    }

    pub fn no_interrupt_when_stop(&self) -> bool {
        self.no_interrupt_when_stop
    }
}

/// Supervisor-wide configuration for one run
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Sidecars in declared order
    pub sidecars: Vec<SidecarSpec>,
    /// Do not start the main application process
    pub no_starter: bool,
    /// Log level name
    pub log_level: Option<String>,
    /// Emit JSON logs
    pub log_json: bool,
    /// Disable colored logs
    pub no_color: bool,
    /// Base directory (overwritten by discovery)
    pub dir: Option<PathBuf>,
    /// Explicit application port
    pub app_port: Option<u16>,
    /// Seconds between graceful signal and forced kill
    pub grace_period: Option<u64>,
}

impl LaunchConfig {
    /// Build a config from a list of sidecars
    pub fn new(sidecars: Vec<SidecarSpec>) -> Self {
        Self {
            sidecars,
            ..Default::default()
        }
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(content: &str, origin: &str) -> Result<Self> {
        let config: LaunchConfig =
            serde_yaml::from_str(content).map_err(|e| ConfigError::Parsing {
                path: origin.to_string(),
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading configuration");
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.display().to_string(),
            }
            .into());
        }
        let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_yaml_str(&content, &path.display().to_string())
    }

    /// Reject configurations declaring the same sidecar twice
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for sidecar in &self.sidecars {
            if !seen.insert(sidecar.name()) {
                return Err(ConfigError::DuplicateName {
                    name: sidecar.name().to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Grace period before processes are forcibly killed
    pub fn grace_period(&self) -> Duration {
        self.grace_period
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_GRACE_PERIOD)
    }

    /// Base directory, falling back to the current directory
    pub fn base_dir(&self) -> PathBuf {
        match &self.dir {
            Some(dir) if !dir.as_os_str().is_empty() => dir.clone(),
            _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

/// Result of configuration discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigLocation {
    /// Configuration file to load
    pub path: PathBuf,
    /// Base directory the sidecars live in
    pub base_dir: PathBuf,
}

/// Locate the configuration file for a base directory
///
/// Lookup order: `<dir>/<config_path>`, `<dir>/.sidecars/sidecars-config.yml`,
/// then the first sub-directory `S` of `<dir>` holding
/// `S/.sidecars/sidecars-config.yml` (the base dir then becomes `S`).
#[instrument(skip_all, fields(dir = %dir.display()))]
pub fn discover_config(dir: &Path, config_path: &Path) -> Result<ConfigLocation> {
    let direct = dir.join(config_path);
    if direct.is_file() {
        return Ok(ConfigLocation {
            path: direct,
            base_dir: dir.to_path_buf(),
        });
    }

    let nested = dir.join(SIDECARS_DIR).join(CONFIG_FILE_NAME);
    warn!(
        "Config file not found on {}, trying to find config file at {}",
        direct.display(),
        nested.display()
    );
    if nested.is_file() {
        return Ok(ConfigLocation {
            path: nested,
            base_dir: dir.to_path_buf(),
        });
    }

    warn!(
        "Config file not found on {}, trying to auto-find on first sub folder",
        nested.display()
    );
    let mut subdirs: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(ConfigError::Io)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    subdirs.sort();
    for sub in subdirs {
        let candidate = sub.join(SIDECARS_DIR).join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            warn!("Config file found at {}", candidate.display());
            return Ok(ConfigLocation {
                path: candidate,
                base_dir: sub,
            });
        }
    }

    Err(ConfigError::NotFound {
        path: direct.display().to_string(),
    }
    .into())
}
