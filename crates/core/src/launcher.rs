//! Launcher: setup, artifact download and supervised launch
//!
//! The launcher owns the artifact index for the duration of a command. Index
//! mutations only happen sequentially inside [`Launcher::setup`] and
//! [`Launcher::download_artifacts`]; [`Launcher::launch`] never touches it.

use crate::config::{LaunchConfig, SidecarSpec, SIDECARS_DIR};
use crate::errors::{ConfigError, ProcessError, Result, SidecarsError};
use crate::factory::{sidecar_dir, sidecar_exec_path, ProcessFactory};
use crate::fetcher::{extract, ArchiveKind, ArtifactFetcher};
use crate::index::{ArtifactIndex, DownloadDecision, INDEX_FILE_NAME};
use crate::output::{spawn_line_drain, OutputSinks};
use crate::process::{ProcessDescriptor, Supervisor};
use crate::profile::{write_sidecar_profile, write_starter_profile};
use crate::starter::Starter;
use crate::variable::{merge_env, os_env, override_env, template_env_set, EnvMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

/// Port a reverse proxy forwards to
pub const PROXY_APP_PORT_ENV_KEY: &str = "PROXY_APP_PORT";

/// Application port before reverse-proxy shifting, exported by setup
pub const APP_PORT_ENV_KEY: &str = "SIDECAR_APP_PORT";

/// Application port when nothing else provides one
pub const DEFAULT_APP_PORT: u16 = 8080;

/// Download cache, relative to the sidecars directory
pub const CACHE_DIR: &str = ".cache";

pub struct Launcher {
    config: LaunchConfig,
    base_dir: PathBuf,
    profile_dir: PathBuf,
    starter: Option<Arc<dyn Starter>>,
    index: ArtifactIndex,
    fetcher: ArtifactFetcher,
    sinks: OutputSinks,
    app_port: u16,
    forward_os_signals: bool,
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launcher")
            .field("base_dir", &self.base_dir)
            .field("profile_dir", &self.profile_dir)
            .field("starter", &self.starter.as_ref().map(|s| s.name()))
            .field("app_port", &self.app_port)
            .finish()
    }
}

impl Launcher {
    /// Build a launcher; a corrupt index is fatal here
    pub fn new(
        config: LaunchConfig,
        starter: Option<Arc<dyn Starter>>,
        profile_dir: impl Into<PathBuf>,
        default_app_port: u16,
    ) -> Result<Self> {
        let base_dir = config.base_dir();
        let index = ArtifactIndex::load(base_dir.join(SIDECARS_DIR).join(INDEX_FILE_NAME))?;

        let platform_port = match (&starter, config.no_starter) {
            (Some(starter), false) => starter.app_port(&os_env()),
            _ => None,
        };
        let app_port = platform_port
            .filter(|p| *p != 0)
            .or(config.app_port.filter(|p| *p != 0))
            .unwrap_or(default_app_port);

        Ok(Self {
            config,
            base_dir,
            profile_dir: profile_dir.into(),
            starter,
            index,
            fetcher: ArtifactFetcher::new()?,
            sinks: OutputSinks::default(),
            app_port,
            forward_os_signals: true,
        })
    }

    /// Send process and script output to custom writers
    pub fn with_output(mut self, sinks: OutputSinks) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn with_fetcher(mut self, fetcher: ArtifactFetcher) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Whether SIGINT/SIGTERM sent to the supervisor stop the processes
    pub fn with_os_signals(mut self, value: bool) -> Self {
        self.forward_os_signals = value;
        self
    }

    pub fn app_port(&self) -> u16 {
        self.app_port
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn profile_dir(&self) -> &Path {
        &self.profile_dir
    }

    pub fn index(&self) -> &ArtifactIndex {
        &self.index
    }

    /// Starter used for the main application, if it runs at all
    fn active_starter(&self) -> Option<&Arc<dyn Starter>> {
        if self.config.no_starter {
            None
        } else {
            self.starter.as_ref()
        }
    }

    fn cache_dir(&self) -> PathBuf {
        self.base_dir.join(SIDECARS_DIR).join(CACHE_DIR)
    }

    /// Prepare profile scripts and artifacts for a later launch
    #[instrument(skip_all, fields(command = "setup", force))]
    pub async fn setup(&mut self, force: bool) -> Result<()> {
        info!("Setup sidecars ...");
        fs::create_dir_all(&self.profile_dir)?;

        let mut lookup = os_env();
        let mut exports = EnvMap::new();
        for spec in &self.config.sidecars {
            let resolved = template_env_set(&lookup, spec.app_env())
                .map_err(|e| SidecarsError::for_sidecar(spec.name(), e))?;
            merge_env(&mut lookup, &resolved);
            merge_env(&mut exports, &resolved);
        }

        self.download_artifacts(force).await?;

        for spec in &self.config.sidecars {
            if let Some(body) = spec.profiled() {
                info!(sidecar = %spec.name(), "Writing profiled file");
                write_sidecar_profile(&self.profile_dir, spec.name(), body)
                    .map_err(|e| SidecarsError::for_sidecar(spec.name(), e))?;
            }
        }

        if let Some(starter) = self.active_starter() {
            let mut port = self.app_port;
            for _ in self.config.sidecars.iter().filter(|s| s.is_rproxy()) {
                port = next_port(port)?;
            }
            if port != self.app_port {
                merge_env(&mut exports, &starter.proxy_env(port));
                exports.insert(APP_PORT_ENV_KEY.to_string(), self.app_port.to_string());
            }
            info!(starter = starter.name(), "Adding starter.sh profile");
            write_starter_profile(&self.profile_dir, &exports)?;
        }

        info!("Finished setup sidecars");
        Ok(())
    }

    /// Fetch and extract every sidecar artifact
    #[instrument(skip_all, fields(command = "download_artifacts", force))]
    pub async fn download_artifacts(&mut self, force: bool) -> Result<()> {
        info!("Start downloading artifacts from sidecars ...");
        self.remove_stale_entries()?;

        let sidecars = self.config.sidecars.clone();
        for spec in sidecars.iter().filter(|s| s.has_artifact()) {
            self.download_sidecar(spec, force)
                .await
                .map_err(|e| SidecarsError::for_sidecar(spec.name(), e))?;
        }

        info!("Finished downloading artifacts from sidecars");
        Ok(())
    }

    /// Drop cached entries (and their files) of sidecars no longer configured
    fn remove_stale_entries(&mut self) -> Result<()> {
        let stale = self.index.reconcile(&self.config.sidecars);
        if stale.is_empty() {
            return Ok(());
        }
        for entry in stale {
            info!(sidecar = %entry.name, "Removing stale cached artifact");
            let archive = self.index.root().join(&entry.archive_path);
            remove_if_exists(&archive)
                .map_err(|e| SidecarsError::for_sidecar(&entry.name, e))?;
            remove_if_exists(&sidecar_dir(&self.base_dir, &entry.name))
                .map_err(|e| SidecarsError::for_sidecar(&entry.name, e))?;
            self.index.remove(&entry.name);
        }
        self.index.persist()
    }

    async fn download_sidecar(&mut self, spec: &SidecarSpec, force: bool) -> Result<()> {
        let Some(uri) = spec.artifact_uri() else {
            return Ok(());
        };
        let dir = sidecar_dir(&self.base_dir, spec.name());
        fs::create_dir_all(&dir)?;
        if !is_empty_dir(&dir)? {
            if !force {
                info!(
                    sidecar = %spec.name(),
                    "Skipping downloading from {} (directory not empty, sidecar must be already downloaded)",
                    uri
                );
                return Ok(());
            }
            fs::remove_dir_all(&dir)?;
            fs::create_dir_all(&dir)?;
        }

        let decision = self.index.should_download(spec);
        if let Some(reason) = decision.reason() {
            return Err(SidecarsError::Verification {
                reason: reason.to_string(),
            });
        }

        let kind = ArchiveKind::resolve(uri, spec.artifact_type())?;
        let cached = self
            .index
            .lookup(spec.name())
            .map(|entry| self.index.root().join(&entry.archive_path))
            .filter(|path| path.is_file());
        let archive = match (decision, cached) {
            (DownloadDecision::UpToDate, Some(path)) => {
                debug!(sidecar = %spec.name(), archive = %path.display(), "Reusing cached archive");
                path
            }
            _ => {
                let relative = PathBuf::from(CACHE_DIR)
                    .join(format!("{}.{}", spec.name(), kind.extension()));
                let target = self.cache_dir().join(format!("{}.{}", spec.name(), kind.extension()));
                self.fetcher
                    .fetch(&target, uri, spec.artifact_type(), spec.artifact_sha1())
                    .await?;
                self.index.record(spec, relative);
                self.index.persist()?;
                target
            }
        };

        let extracted = extract(&archive, kind, &dir);
        self.index.remove(spec.name());
        remove_if_exists(&archive)?;
        self.index.persist()?;
        if let Err(e) = extracted {
            warn!(sidecar = %spec.name(), "Extraction failed, dropping cached archive");
            remove_if_exists(&dir)?;
            return Err(e.into());
        }

        self.run_after_install(spec).await
    }

    async fn run_after_install(&self, spec: &SidecarSpec) -> Result<()> {
        let Some(script) = spec.after_install() else {
            return Ok(());
        };
        if cfg!(windows) {
            warn!(sidecar = %spec.name(), "After install scripts are not supported on this platform");
            return Ok(());
        }

        info!(sidecar = %spec.name(), "Run after install script ...");
        let exec_path = sidecar_exec_path(&self.base_dir, spec);
        let work_dir = exec_path
            .parent()
            .filter(|p| p.is_dir())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| sidecar_dir(&self.base_dir, spec.name()));
        let env = override_env(&os_env(), spec.env())?;

        let mut command = Command::new("bash");
        command
            .arg("-c")
            .arg(script)
            .env_clear()
            .envs(&env)
            .current_dir(&work_dir)
            .stdin(Stdio::null());

        let inherit = self.sinks.inherits_stdio();
        if inherit {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            name: spec.name().to_string(),
            role: "after install script of".to_string(),
            source,
        })?;
        let mut drains = Vec::new();
        if !inherit {
            if let Some(out) = child.stdout.take() {
                drains.push(spawn_line_drain(out, self.sinks.stdout(), None));
            }
            if let Some(err) = child.stderr.take() {
                drains.push(spawn_line_drain(err, self.sinks.stderr(), None));
            }
        }

        let status = child.wait().await?;
        for drain in drains {
            let _ = drain.await;
        }
        if !status.success() {
            return Err(ProcessError::Script {
                script: script.to_string(),
                status: status.to_string(),
            }
            .into());
        }
        info!(sidecar = %spec.name(), "Finished running after install script");
        Ok(())
    }

    /// Start every sidecar and the application, then supervise them until the run ends
    #[instrument(skip_all, fields(command = "launch"))]
    pub async fn launch(&self) -> Result<()> {
        let mut app_env = os_env();
        let mut port = self.app_port;
        if let Some(raw) = app_env.get(APP_PORT_ENV_KEY).filter(|v| !v.is_empty()) {
            port = raw.trim().parse().map_err(|_| ConfigError::InvalidPort {
                value: raw.clone(),
                source_name: APP_PORT_ENV_KEY.to_string(),
            })?;
        }

        let factory = ProcessFactory::new(&self.base_dir, self.active_starter().cloned())
            .with_sinks(self.sinks.clone());

        let mut descriptors = Vec::with_capacity(self.config.sidecars.len() + 1);
        for spec in &self.config.sidecars {
            let descriptor = self
                .sidecar_descriptor(&factory, spec, &mut app_env, &mut port)
                .map_err(|e| SidecarsError::for_sidecar(spec.name(), e))?;
            info!(sidecar = %spec.name(), "Sidecar ready to start");
            descriptors.push(descriptor);
        }

        if !self.config.no_starter {
            if let Some(starter) = self.active_starter() {
                if port != self.app_port {
                    merge_env(&mut app_env, &starter.proxy_env(port));
                }
                info!(starter = starter.name(), "Running cloud starter ...");
            }
            descriptors.push(factory.from_application(&app_env, &self.profile_dir)?);
        }

        Supervisor::new(self.config.grace_period())
            .with_os_signals(self.forward_os_signals)
            .run(descriptors)
            .await
    }

    /// Environment and descriptor of one sidecar; folds its app env into `app_env`
    fn sidecar_descriptor(
        &self,
        factory: &ProcessFactory,
        spec: &SidecarSpec,
        app_env: &mut EnvMap,
        port: &mut u16,
    ) -> Result<ProcessDescriptor> {
        let mut env = override_env(app_env, spec.env())?;
        if spec.is_rproxy() {
            if let Some(starter) = self.active_starter() {
                merge_env(&mut env, &starter.proxy_env(*port));
            }
            *port = next_port(*port)?;
            env.insert(PROXY_APP_PORT_ENV_KEY.to_string(), port.to_string());
        }

        let contributions = template_env_set(app_env, spec.app_env())?;
        let descriptor = factory.from_sidecar(spec, &env)?;
        merge_env(app_env, &contributions);
        Ok(descriptor)
    }

    /// Print the SHA-1 of every sidecar artifact as a table
    #[instrument(skip_all, fields(command = "sha1"))]
    pub async fn show_artifact_hashes(&self) -> Result<()> {
        let mut rows = Vec::with_capacity(self.config.sidecars.len());
        for spec in &self.config.sidecars {
            let hash = match spec.artifact_uri() {
                Some(uri) => self
                    .fetcher
                    .sha1(uri, spec.artifact_type())
                    .await
                    .map_err(|e| SidecarsError::for_sidecar(spec.name(), e))?,
                None => "-".to_string(),
            };
            rows.push([spec.name().to_string(), hash]);
        }

        let table = render_table(["Sidecar Name", "Sha1"], &rows);
        let sink = self.sinks.stdout();
        let mut out = sink.lock().map_err(|_| {
            SidecarsError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "stdout sink poisoned",
            ))
        })?;
        out.write_all(table.as_bytes())?;
        out.flush()?;
        Ok(())
    }
}

fn next_port(port: u16) -> Result<u16> {
    port.checked_add(1).ok_or_else(|| {
        ConfigError::InvalidPort {
            value: port.to_string(),
            source_name: "reverse proxy port shift".to_string(),
        }
        .into()
    })
}

fn is_empty_dir(dir: &Path) -> std::io::Result<bool> {
    Ok(fs::read_dir(dir)?.next().is_none())
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Two-column text table, columns padded to the widest cell
fn render_table(headers: [&str; 2], rows: &[[String; 2]]) -> String {
    let width = |col: usize| {
        rows.iter()
            .map(|r| r[col].len())
            .chain(std::iter::once(headers[col].len()))
            .max()
            .unwrap_or(0)
    };
    let (w0, w1) = (width(0), width(1));
    let mut out = format!("{:<w0$} | {:<w1$}\n", headers[0], headers[1]);
    out.push_str(&format!("{}-+-{}\n", "-".repeat(w0), "-".repeat(w1)));
    for [name, hash] in rows {
        out.push_str(&format!("{:<w0$} | {:<w1$}\n", name, hash));
    }
    out
}
