//! Supervised processes and group shutdown
//!
//! Every [`ProcessDescriptor`] runs on its own task. Completion is reported
//! through a shared [`Shutdown`] handle: failures go to a bounded error
//! channel, and shutdown requests go to a signal channel read by the
//! [`ShutdownCoordinator`].
//!
//! The coordinator cancels the shared token *before* it delivers any signal,
//! so a process that dies because of the shutdown sees the cancelled token and
//! does not report its exit as a failure.
//!
//! ```text
//! Pending -> Running -> ExitedClean | ExitedError | Killed
//! ```

use crate::errors::{ProcessError, Result, SidecarsError};
use crate::output::{spawn_line_drain, OutputSinks};
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long output drains may run after their process exited
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Kind of supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Sidecar,
    Application,
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessRole::Sidecar => write!(f, "sidecar"),
            ProcessRole::Application => write!(f, "application"),
        }
    }
}

/// Lifecycle state of a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Pending,
    Running,
    ExitedClean,
    ExitedError,
    Killed,
}

/// Shutdown request carried on the signal channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Interrupt => write!(f, "interrupt"),
            ShutdownSignal::Terminate => write!(f, "terminated"),
        }
    }
}

/// Handle shared by every process task and the coordinator
#[derive(Debug, Clone)]
pub struct Shutdown {
    token: CancellationToken,
    signals: mpsc::UnboundedSender<ShutdownSignal>,
    errors: mpsc::Sender<SidecarsError>,
}

impl Shutdown {
    /// Ask the coordinator to stop every process
    pub fn request(&self, signal: ShutdownSignal) {
        if self.signals.send(signal).is_err() {
            debug!("Shutdown coordinator already gone, dropping {}", signal);
        }
    }

    /// Record a failure; only the first few fit, later ones are logged
    pub fn report(&self, err: SidecarsError) {
        if let Err(e) = self.errors.try_send(err) {
            debug!("Error channel full or closed: {}", e);
        }
    }

    /// Whether group shutdown has begun
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Receiving ends paired with a [`Shutdown`] handle
#[derive(Debug)]
pub struct ShutdownChannels {
    pub shutdown: Shutdown,
    pub signals: mpsc::UnboundedReceiver<ShutdownSignal>,
    pub errors: mpsc::Receiver<SidecarsError>,
}

impl ShutdownChannels {
    /// Channels for `process_count` processes
    pub fn new(process_count: usize) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::channel(process_count.max(1));
        Self {
            shutdown: Shutdown {
                token: CancellationToken::new(),
                signals: signal_tx,
                errors: error_tx,
            },
            signals: signal_rx,
            errors: error_rx,
        }
    }
}

/// Final state of one process task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub name: String,
    pub role: ProcessRole,
    pub state: ProcessState,
}

/// Reference the coordinator keeps to a running process
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    name: String,
    pid: Option<u32>,
    kill: CancellationToken,
}

impl ProcessHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// A single supervised OS process, not yet started
#[derive(Debug)]
pub struct ProcessDescriptor {
    name: String,
    role: ProcessRole,
    command: Command,
    prefix: Option<String>,
    sinks: OutputSinks,
    no_interrupt: bool,
    always_interrupt: bool,
    state: ProcessState,
}

impl ProcessDescriptor {
    pub fn new(name: impl Into<String>, role: ProcessRole, command: Command) -> Self {
        Self {
            name: name.into(),
            role,
            command,
            prefix: None,
            sinks: OutputSinks::default(),
            no_interrupt: false,
            always_interrupt: false,
            state: ProcessState::Pending,
        }
    }

    /// Prefix each output line with `prefix`
    pub fn with_prefix(mut self, prefix: Option<String>) -> Self {
        self.prefix = prefix;
        self
    }

    pub fn with_sinks(mut self, sinks: OutputSinks) -> Self {
        self.sinks = sinks;
        self
    }

    /// Do not turn a failure of this process into a group shutdown
    pub fn with_no_interrupt(mut self, value: bool) -> Self {
        self.no_interrupt = value;
        self
    }

    /// Request a group shutdown whenever this process exits
    pub fn with_always_interrupt(mut self, value: bool) -> Self {
        self.always_interrupt = value;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn no_interrupt(&self) -> bool {
        self.no_interrupt
    }

    pub fn always_interrupt(&self) -> bool {
        self.always_interrupt
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Underlying command, for inspection
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Spawn the process and its completion task into `tasks`
    ///
    /// A spawn failure is handled like any other process failure and yields
    /// no handle.
    pub fn start(
        mut self,
        shutdown: &Shutdown,
        tasks: &mut JoinSet<ProcessOutcome>,
    ) -> Option<ProcessHandle> {
        let piped = self.prefix.is_some() || !self.sinks.inherits_stdio();
        if piped {
            self.command.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            self.command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }
        self.command.stdin(Stdio::null());

        let mut child = match self.command.spawn() {
            Ok(child) => child,
            Err(source) => {
                let err = ProcessError::Spawn {
                    name: self.name.clone(),
                    role: self.role.to_string(),
                    source,
                };
                self.on_exit(Err(err.into()), shutdown);
                return None;
            }
        };

        self.state = ProcessState::Running;
        let pid = child.id();
        info!(process = %self.name, role = %self.role, pid, "Started");

        let drains = if piped {
            self.attach_drains(&mut child)
        } else {
            Vec::new()
        };

        let kill = CancellationToken::new();
        let handle = ProcessHandle {
            name: self.name.clone(),
            pid,
            kill: kill.clone(),
        };

        let shutdown = shutdown.clone();
        tasks.spawn(async move { self.supervise(child, drains, kill, shutdown).await });
        Some(handle)
    }

    fn attach_drains(&self, child: &mut Child) -> Vec<JoinHandle<()>> {
        let mut drains = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            drains.push(spawn_line_drain(
                stdout,
                self.sinks.stdout(),
                self.prefix.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(spawn_line_drain(
                stderr,
                self.sinks.stderr(),
                self.prefix.clone(),
            ));
        }
        drains
    }

    async fn supervise(
        mut self,
        mut child: Child,
        drains: Vec<JoinHandle<()>>,
        kill: CancellationToken,
        shutdown: Shutdown,
    ) -> ProcessOutcome {
        let waited = tokio::select! {
            status = child.wait() => status,
            _ = kill.cancelled() => {
                if let Err(e) = child.start_kill() {
                    debug!(process = %self.name, "Kill failed: {}", e);
                }
                child.wait().await
            }
        };

        for mut drain in drains {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut drain).await.is_err() {
                debug!(process = %self.name, "Output still open after exit, detaching");
                drain.abort();
            }
        }

        let result = self.classify(waited, &shutdown);
        self.on_exit(result, &shutdown);
        ProcessOutcome {
            name: self.name,
            role: self.role,
            state: self.state,
        }
    }

    fn classify(
        &mut self,
        waited: std::io::Result<ExitStatus>,
        shutdown: &Shutdown,
    ) -> Result<()> {
        match waited {
            Ok(status) if status.success() => {
                self.state = ProcessState::ExitedClean;
                Ok(())
            }
            Ok(status) => {
                self.state = if shutdown.is_shutting_down() {
                    ProcessState::Killed
                } else {
                    ProcessState::ExitedError
                };
                Err(ProcessError::Exited {
                    name: self.name.clone(),
                    role: self.role.to_string(),
                    status: status.to_string(),
                }
                .into())
            }
            Err(source) => {
                self.state = ProcessState::ExitedError;
                Err(ProcessError::Wait {
                    name: self.name.clone(),
                    role: self.role.to_string(),
                    source,
                }
                .into())
            }
        }
    }

    /// Completion handler shared by spawn failures and exits
    fn on_exit(&self, result: Result<()>, shutdown: &Shutdown) {
        match result {
            Ok(()) => info!(process = %self.name, role = %self.role, "Exited"),
            Err(err) if shutdown.is_shutting_down() => {
                debug!(process = %self.name, "Exit during shutdown ignored: {}", err);
            }
            Err(err) if self.no_interrupt => {
                warn!(process = %self.name, "{}", err);
            }
            Err(err) => {
                error!(process = %self.name, "{}", err);
                shutdown.report(err);
                shutdown.request(ShutdownSignal::Interrupt);
            }
        }
        if self.always_interrupt {
            shutdown.request(ShutdownSignal::Interrupt);
        }
    }
}

/// Fans a shutdown request out to every process, then escalates
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    grace_period: Duration,
}

impl ShutdownCoordinator {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    /// Wait for the first request (or for every process to finish), then stop the group
    pub async fn run(
        self,
        mut signals: mpsc::UnboundedReceiver<ShutdownSignal>,
        token: CancellationToken,
        all_done: CancellationToken,
        processes: Vec<ProcessHandle>,
    ) {
        let signal = tokio::select! {
            signal = signals.recv() => signal,
            _ = all_done.cancelled() => None,
        };
        let Some(signal) = signal else {
            return;
        };

        info!(%signal, "Stopping all processes");
        token.cancel();
        for process in &processes {
            if let Some(pid) = process.pid {
                debug!(process = %process.name, pid, "Sending {}", signal);
                signal_group(pid, signal);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(self.grace_period) => {
                debug!("Grace period elapsed");
            }
            _ = all_done.cancelled() => {}
        }

        for process in &processes {
            if let Some(pid) = process.pid {
                force_kill_group(pid);
            }
            process.kill.cancel();
        }
    }
}

#[cfg(unix)]
fn to_nix(signal: ShutdownSignal) -> nix::sys::signal::Signal {
    match signal {
        ShutdownSignal::Interrupt => nix::sys::signal::Signal::SIGINT,
        ShutdownSignal::Terminate => nix::sys::signal::Signal::SIGTERM,
    }
}

/// Deliver `signal` to the group led by `pid`, or to `pid` alone if that fails
#[cfg(unix)]
fn signal_group(pid: u32, signal: ShutdownSignal) {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    let target = Pid::from_raw(raw);
    let sig = to_nix(signal);
    if let Err(group_err) = killpg(target, sig) {
        debug!(pid, "Group signal failed ({}), signalling process", group_err);
        match kill(target, sig) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(pid, "Failed to send {}: {}", signal, e),
        }
    }
}

#[cfg(not(unix))]
fn signal_group(pid: u32, signal: ShutdownSignal) {
    debug!(pid, "Graceful {} not supported on this platform", signal);
}

/// SIGKILL the whole group; already-gone groups are fine
#[cfg(unix)]
fn force_kill_group(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => debug!(pid, "Failed to kill process group: {}", e),
    }
}

#[cfg(not(unix))]
fn force_kill_group(_pid: u32) {}

/// Forward SIGINT/SIGTERM received by the supervisor into `shutdown`
fn spawn_signal_listener(shutdown: Shutdown) -> JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let (mut int, mut term) =
                match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                    (Ok(int), Ok(term)) => (int, term),
                    (Err(e), _) | (_, Err(e)) => {
                        warn!("Cannot listen for OS signals: {}", e);
                        return;
                    }
                };
            loop {
                let received = tokio::select! {
                    Some(()) = int.recv() => ShutdownSignal::Interrupt,
                    Some(()) = term.recv() => ShutdownSignal::Terminate,
                    else => return,
                };
                info!(signal = %received, "Received OS signal");
                shutdown.request(received);
            }
        }
        #[cfg(not(unix))]
        {
            while tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C");
                shutdown.request(ShutdownSignal::Interrupt);
            }
        }
    })
}

/// Runs a set of descriptors to completion
#[derive(Debug, Clone)]
pub struct Supervisor {
    grace_period: Duration,
    forward_os_signals: bool,
}

impl Supervisor {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            grace_period,
            forward_os_signals: true,
        }
    }

    /// Whether SIGINT/SIGTERM sent to the supervisor are forwarded
    pub fn with_os_signals(mut self, value: bool) -> Self {
        self.forward_os_signals = value;
        self
    }

    /// Start every descriptor, wait for all of them, return the first failure
    pub async fn run(&self, descriptors: Vec<ProcessDescriptor>) -> Result<()> {
        if descriptors.is_empty() {
            info!("Nothing to run");
            return Ok(());
        }

        let ShutdownChannels {
            shutdown,
            signals,
            mut errors,
        } = ShutdownChannels::new(descriptors.len());

        let mut tasks = JoinSet::new();
        let handles: Vec<ProcessHandle> = descriptors
            .into_iter()
            .filter_map(|descriptor| descriptor.start(&shutdown, &mut tasks))
            .collect();

        let all_done = CancellationToken::new();
        let coordinator = tokio::spawn(ShutdownCoordinator::new(self.grace_period).run(
            signals,
            shutdown.token(),
            all_done.clone(),
            handles,
        ));
        let listener = self
            .forward_os_signals
            .then(|| spawn_signal_listener(shutdown.clone()));

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => debug!(
                    process = %outcome.name,
                    role = %outcome.role,
                    state = ?outcome.state,
                    "Process finished"
                ),
                Err(e) => warn!("Process task failed: {}", e),
            }
        }

        all_done.cancel();
        if let Err(e) = coordinator.await {
            warn!("Shutdown coordinator failed: {}", e);
        }
        if let Some(listener) = listener {
            listener.abort();
        }
        drop(shutdown);

        match errors.try_recv() {
            Ok(err) => Err(err),
            Err(_) => Ok(()),
        }
    }
}
