use nomad_types::{
    ErrorPayload, LogEntry, LogStream, ProcessState, ProcessStatus, ShellEvent, UserEnv,
};
use std::io::{self, Read};
use std::process::{Child, ExitStatus};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::events::EventBus;
use crate::launch::LaunchSettings;
use crate::lines::LineSplitter;
use crate::lock;
use crate::readiness::{backend_url, LogAnnouncementProbe, ReadinessProbe};

pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
pub const STARTUP_TIMEOUT_ENV: &str = "NOMAD_STARTUP_TIMEOUT_MS";
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(4);
const KILL_WAIT: Duration = Duration::from_secs(5);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const READ_BUFFER_BYTES: usize = 8192;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn backend `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("backend did not become ready within {0:?}")]
    StartupTimeout(Duration),
    #[error("{0}")]
    RuntimeCrash(String),
    #[error("backend was stopped before it became ready")]
    Stopped,
}

/// `NOMAD_STARTUP_TIMEOUT_MS` when set to a number, else the 60s default.
pub fn startup_timeout_from_env() -> Duration {
    if let Ok(raw) = std::env::var(STARTUP_TIMEOUT_ENV) {
        if let Ok(parsed) = raw.trim().parse::<u64>() {
            return Duration::from_millis(parsed);
        }
    }
    STARTUP_TIMEOUT
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartOptions {
    pub dev: bool,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub launch: LaunchSettings,
    pub startup_timeout: Duration,
    pub stop_grace_period: Duration,
}

impl SupervisorSettings {
    pub fn new(launch: LaunchSettings) -> Self {
        Self {
            launch,
            startup_timeout: STARTUP_TIMEOUT,
            stop_grace_period: STOP_GRACE_PERIOD,
        }
    }
}

#[derive(Debug)]
enum StartupSignal {
    Ready(ProcessStatus),
    Failed(String),
    Stopped,
}

#[derive(Debug, Clone, Copy)]
enum ChildControl {
    Terminate,
    Kill,
}

struct TrackedChild {
    generation: u64,
    pid: u32,
    control: Sender<ChildControl>,
    exited: Receiver<()>,
    stop_requested: Arc<AtomicBool>,
}

struct Shared {
    status: Mutex<ProcessStatus>,
    generation: AtomicU64,
    events: EventBus,
    probe: Arc<dyn ReadinessProbe>,
}

pub struct Supervisor {
    shared: Arc<Shared>,
    child: Mutex<Option<TrackedChild>>,
    lifecycle: Mutex<()>,
    closed: AtomicBool,
    user_env: Mutex<Option<UserEnv>>,
    settings: SupervisorSettings,
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings, probe: Arc<dyn ReadinessProbe>) -> Self {
        Self {
            shared: Arc::new(Shared {
                status: Mutex::new(ProcessStatus::stopped()),
                generation: AtomicU64::new(0),
                events: EventBus::new(),
                probe,
            }),
            child: Mutex::new(None),
            lifecycle: Mutex::new(()),
            closed: AtomicBool::new(false),
            user_env: Mutex::new(None),
            settings,
        }
    }

    pub fn with_log_probe(settings: SupervisorSettings) -> anyhow::Result<Self> {
        Ok(Self::new(settings, Arc::new(LogAnnouncementProbe::new()?)))
    }

    pub fn subscribe(&self) -> Receiver<ShellEvent> {
        self.shared.events.subscribe()
    }

    pub fn status(&self) -> ProcessStatus {
        lock(&self.shared.status).clone()
    }

    /// Takes effect on the next [`Supervisor::start`].
    pub fn set_user_env(&self, env: UserEnv) {
        *lock(&self.user_env) = Some(env);
    }

    pub fn user_env(&self) -> Option<UserEnv> {
        lock(&self.user_env).clone()
    }

    /// Starts a fresh backend, stopping any previous one first, and blocks until
    /// it is ready, fails, or the startup deadline passes.
    pub fn start(&self, options: StartOptions) -> Result<ProcessStatus, SupervisorError> {
        let (generation, signals) = {
            let _lifecycle = lock(&self.lifecycle);
            if self.closed.load(Ordering::SeqCst) {
                return Err(SupervisorError::Stopped);
            }
            info!("backend start requested (dev={})", options.dev);
            self.stop_tracked();
            self.spawn_tracked(options)?
        };

        let outcome = match signals.recv_timeout(self.settings.startup_timeout) {
            Ok(StartupSignal::Ready(status)) => Ok(status),
            Ok(StartupSignal::Failed(message)) => Err(SupervisorError::RuntimeCrash(message)),
            Ok(StartupSignal::Stopped) => Err(SupervisorError::Stopped),
            Err(RecvTimeoutError::Timeout) => self.startup_timed_out(generation),
            Err(RecvTimeoutError::Disconnected) => Err(SupervisorError::RuntimeCrash(
                "backend helpers exited without reporting".to_string(),
            )),
        };
        match &outcome {
            Ok(status) => info!(
                "backend ready on {}",
                status.url.as_deref().unwrap_or_default()
            ),
            Err(err) => warn!("backend start failed: {err}"),
        }
        outcome
    }

    /// Stops the tracked child, if any, and returns once its exit was observed.
    ///
    /// Sends a graceful terminate and escalates to a kill after the grace
    /// period. Calling it with nothing running is a no-op.
    pub fn stop(&self) {
        let _lifecycle = lock(&self.lifecycle);
        self.stop_tracked();
    }

    /// Stops the child and refuses every later start.
    pub fn shutdown(&self) {
        let _lifecycle = lock(&self.lifecycle);
        self.closed.store(true, Ordering::SeqCst);
        self.stop_tracked();
    }

    fn spawn_tracked(
        &self,
        options: StartOptions,
    ) -> Result<(u64, Receiver<StartupSignal>), SupervisorError> {
        let generation = self.shared.begin_generation();
        let user_env = self.user_env();
        let plan = self.settings.launch.plan(options.dev, user_env.as_ref());
        let command_line = plan.display();
        info!("spawning backend: {command_line}");

        let mut child = match plan.command().spawn() {
            Ok(child) => child,
            Err(source) => {
                let err = SupervisorError::Spawn {
                    command: command_line,
                    source,
                };
                error!("{err}");
                self.shared.fail_if_starting(generation, err.to_string());
                return Err(err);
            }
        };

        let pid = child.id();
        if pid == 0 {
            warn!("backend spawned without a usable pid");
        } else {
            info!("backend spawned pid={pid}");
        }
        self.shared.transition(generation, |current| {
            (current.state == ProcessState::Starting).then(|| ProcessStatus::starting(Some(pid)))
        });

        let (signal_tx, signal_rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(
                self.shared.clone(),
                generation,
                LogStream::Stdout,
                stdout,
                signal_tx.clone(),
            );
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(
                self.shared.clone(),
                generation,
                LogStream::Stderr,
                stderr,
                signal_tx.clone(),
            );
        }

        let (control_tx, control_rx) = mpsc::channel();
        let (exited_tx, exited_rx) = mpsc::channel();
        let stop_requested = Arc::new(AtomicBool::new(false));
        spawn_monitor(MonitorContext {
            shared: self.shared.clone(),
            generation,
            child,
            control: control_rx,
            exited: exited_tx,
            stop_requested: stop_requested.clone(),
            signal: signal_tx,
        });

        *lock(&self.child) = Some(TrackedChild {
            generation,
            pid,
            control: control_tx,
            exited: exited_rx,
            stop_requested,
        });
        Ok((generation, signal_rx))
    }

    fn startup_timed_out(&self, generation: u64) -> Result<ProcessStatus, SupervisorError> {
        let timeout = self.settings.startup_timeout;
        let message = format!("backend did not start within {timeout:?}");
        if !self.shared.fail_if_starting(generation, message) {
            // Readiness or a failure settled right at the deadline.
            let status = self.status();
            return match status.state {
                ProcessState::Ready => Ok(status),
                ProcessState::Stopped => Err(SupervisorError::Stopped),
                _ => Err(SupervisorError::RuntimeCrash(
                    status
                        .error
                        .unwrap_or_else(|| "backend failed during startup".to_string()),
                )),
            };
        }

        warn!("timed out waiting for backend readiness, killing it");
        let _lifecycle = lock(&self.lifecycle);
        let tracked = {
            let mut slot = lock(&self.child);
            match slot.as_ref() {
                Some(tracked) if tracked.generation == generation => slot.take(),
                _ => None,
            }
        };
        if let Some(tracked) = tracked {
            let _ = tracked.control.send(ChildControl::Kill);
            if tracked.exited.recv_timeout(KILL_WAIT).is_err() {
                error!("backend pid={} did not exit after kill", tracked.pid);
            }
        }
        Err(SupervisorError::StartupTimeout(timeout))
    }

    fn stop_tracked(&self) {
        let Some(tracked) = lock(&self.child).take() else {
            return;
        };
        tracked.stop_requested.store(true, Ordering::SeqCst);
        if tracked.control.send(ChildControl::Terminate).is_err() {
            // Monitor already finished: the child exited on its own.
            let _ = tracked.exited.recv_timeout(EXIT_POLL_INTERVAL);
            return;
        }
        info!("stopping backend pid={}", tracked.pid);

        match tracked.exited.recv_timeout(self.settings.stop_grace_period) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {}
        }

        warn!(
            "backend pid={} still running after {}ms, killing",
            tracked.pid,
            self.settings.stop_grace_period.as_millis()
        );
        let _ = tracked.control.send(ChildControl::Kill);
        if tracked.exited.recv_timeout(KILL_WAIT).is_err() {
            error!("backend pid={} did not exit after kill", tracked.pid);
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop_tracked();
    }
}

impl Shared {
    fn begin_generation(&self) -> u64 {
        let mut status = lock(&self.status);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let updated = ProcessStatus::starting(None);
        let previous = std::mem::replace(&mut *status, updated.clone());
        self.emit_transition(&previous, &updated);
        generation
    }

    /// Applies `next` to the current status if `generation` is still current.
    fn transition<F>(&self, generation: u64, next: F) -> Option<ProcessStatus>
    where
        F: FnOnce(&ProcessStatus) -> Option<ProcessStatus>,
    {
        let mut status = lock(&self.status);
        if self.generation.load(Ordering::SeqCst) != generation {
            return None;
        }
        let updated = next(&status)?;
        let previous = std::mem::replace(&mut *status, updated.clone());
        self.emit_transition(&previous, &updated);
        Some(updated)
    }

    fn fail_if_starting(&self, generation: u64, message: String) -> bool {
        self.transition(generation, |current| {
            (current.state == ProcessState::Starting)
                .then(|| ProcessStatus::failed(current.pid, message))
        })
        .is_some()
    }

    fn emit_transition(&self, previous: &ProcessStatus, updated: &ProcessStatus) {
        debug!("backend status {:?} -> {:?}", previous.state, updated.state);
        self.events.broadcast(ShellEvent::Status(updated.clone()));
        match updated.state {
            ProcessState::Ready if previous.state != ProcessState::Ready => {
                self.events.broadcast(ShellEvent::Ready(updated.clone()));
            }
            ProcessState::Error if previous.state != ProcessState::Error => {
                self.events.broadcast(ShellEvent::Error(ErrorPayload {
                    message: updated.error.clone().unwrap_or_default(),
                }));
            }
            _ => {}
        }
    }

    fn is_starting(&self, generation: u64) -> bool {
        let status = lock(&self.status);
        self.generation.load(Ordering::SeqCst) == generation
            && status.state == ProcessState::Starting
    }

    fn handle_line(
        &self,
        generation: u64,
        stream: LogStream,
        line: &str,
        signal: &Sender<StartupSignal>,
    ) {
        let message = line.trim_end();
        if message.trim().is_empty() {
            return;
        }
        debug!("[backend][{}] {}", stream.as_str(), message);
        self.events.broadcast(ShellEvent::Log(LogEntry {
            stream,
            message: message.to_string(),
        }));

        if !self.is_starting(generation) {
            return;
        }
        let Some(port) = self.probe.detect(message) else {
            return;
        };
        let url = backend_url(port);
        let ready = self.transition(generation, |current| {
            (current.state == ProcessState::Starting)
                .then(|| ProcessStatus::ready(current.pid, port, url))
        });
        if let Some(status) = ready {
            let _ = signal.send(StartupSignal::Ready(status));
        }
    }

    fn handle_exit(
        &self,
        generation: u64,
        exit: Option<ExitStatus>,
        stop_requested: bool,
        signal: &Sender<StartupSignal>,
    ) {
        let description = format!("backend {}", describe_exit(exit));
        let updated = self.transition(generation, |current| {
            if stop_requested {
                return Some(ProcessStatus::stopped());
            }
            match current.state {
                ProcessState::Stopped => None,
                ProcessState::Starting | ProcessState::Ready | ProcessState::Error => {
                    let message = current
                        .error
                        .clone()
                        .unwrap_or_else(|| description.clone());
                    Some(ProcessStatus::failed(None, message))
                }
            }
        });

        match (&updated, stop_requested) {
            (_, true) => info!("{description} after stop request"),
            (Some(status), false) => warn!(
                "{description} unexpectedly: {}",
                status.error.as_deref().unwrap_or_default()
            ),
            (None, false) => debug!("{description} (superseded child)"),
        }

        let startup = if stop_requested {
            StartupSignal::Stopped
        } else {
            StartupSignal::Failed(description)
        };
        let _ = signal.send(startup);
    }
}

fn describe_exit(exit: Option<ExitStatus>) -> String {
    let Some(status) = exit else {
        return "exited".to_string();
    };
    if let Some(code) = status.code() {
        return format!("exited with code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("was terminated by signal {signal}");
        }
    }
    format!("exited ({status})")
}

fn spawn_reader<R>(
    shared: Arc<Shared>,
    generation: u64,
    stream: LogStream,
    mut reader: R,
    signal: Sender<StartupSignal>,
) where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut splitter = LineSplitter::new();
        let mut buffer = [0_u8; READ_BUFFER_BYTES];
        loop {
            let read = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(size) => size,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!("backend {} read failed: {err}", stream.as_str());
                    break;
                }
            };
            for line in splitter.push(&buffer[..read]) {
                shared.handle_line(generation, stream, &line, &signal);
            }
        }
        if let Some(line) = splitter.finish() {
            shared.handle_line(generation, stream, &line, &signal);
        }
    });
}

struct MonitorContext {
    shared: Arc<Shared>,
    generation: u64,
    child: Child,
    control: Receiver<ChildControl>,
    exited: Sender<()>,
    stop_requested: Arc<AtomicBool>,
    signal: Sender<StartupSignal>,
}

fn spawn_monitor(context: MonitorContext) {
    thread::spawn(move || {
        let MonitorContext {
            shared,
            generation,
            mut child,
            control,
            exited,
            stop_requested,
            signal,
        } = context;

        let exit = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {}
                Err(err) => {
                    warn!("failed to poll backend pid={}: {err}", child.id());
                    let _ = child.kill();
                    break child.wait().ok();
                }
            }
            match control.recv_timeout(EXIT_POLL_INTERVAL) {
                Ok(ChildControl::Terminate) => terminate_child(&mut child),
                Ok(ChildControl::Kill) => kill_child(&mut child),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => thread::sleep(EXIT_POLL_INTERVAL),
            }
        };

        shared.handle_exit(
            generation,
            exit,
            stop_requested.load(Ordering::SeqCst),
            &signal,
        );
        let _ = exited.send(());
    });
}

fn terminate_child(child: &mut Child) {
    #[cfg(unix)]
    {
        let pid = child.id() as i32;
        // The child leads its own process group; signal the whole group.
        let group_status = unsafe { libc::kill(-pid, libc::SIGTERM) };
        if group_status != 0 {
            let direct = unsafe { libc::kill(pid, libc::SIGTERM) };
            if direct != 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    warn!("failed to send SIGTERM to backend pid={pid}: {err}");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = child.kill() {
            warn!("failed to terminate backend pid={}: {err}", child.id());
        }
    }
}

fn kill_child(child: &mut Child) {
    #[cfg(unix)]
    unsafe {
        libc::kill(-(child.id() as i32), libc::SIGKILL);
    }
    if let Err(err) = child.kill() {
        if err.kind() != io::ErrorKind::InvalidInput {
            warn!("failed to kill backend pid={}: {err}", child.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::BackendCommand;
    use std::path::PathBuf;

    struct FixedPort(u16);

    impl ReadinessProbe for FixedPort {
        fn detect(&self, line: &str) -> Option<u16> {
            (line == "up").then_some(self.0)
        }
    }

    fn shell_supervisor(script: &str) -> Supervisor {
        let mut launch = LaunchSettings::new(
            BackendCommand::executable("sh", vec!["-c".to_string(), script.to_string()]),
            PathBuf::from("/nonexistent/nomad-config.json"),
        );
        launch.login_shell = false;
        let mut settings = SupervisorSettings::new(launch);
        settings.startup_timeout = Duration::from_secs(5);
        settings.stop_grace_period = Duration::from_millis(500);
        Supervisor::new(settings, Arc::new(FixedPort(4321)))
    }

    #[test]
    fn describe_exit_reports_code() {
        let status = std::process::Command::new("sh")
            .args(["-c", "exit 3"])
            .status()
            .unwrap();
        assert_eq!(describe_exit(Some(status)), "exited with code 3");
        assert_eq!(describe_exit(None), "exited");
    }

    #[test]
    fn stop_without_child_is_a_quiet_no_op() {
        let supervisor = shell_supervisor("true");
        let events = supervisor.subscribe();
        supervisor.stop();
        supervisor.stop();
        assert_eq!(supervisor.status(), ProcessStatus::stopped());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn start_resolves_with_custom_probe_and_stop_returns_to_stopped() {
        // `sh -c script serve --host ...` binds the trailing args to $0.. and ignores them.
        let supervisor = shell_supervisor("echo up; while true; do sleep 0.1; done");
        let status = supervisor.start(StartOptions::default()).unwrap();
        assert_eq!(status.state, ProcessState::Ready);
        assert_eq!(status.port, Some(4321));
        assert_eq!(status.url.as_deref(), Some("http://127.0.0.1:4321"));
        assert!(status.pid.is_some());

        supervisor.stop();
        assert_eq!(supervisor.status(), ProcessStatus::stopped());
    }

    #[test]
    fn shutdown_refuses_later_starts() {
        let supervisor = shell_supervisor("echo up; sleep 5");
        supervisor.shutdown();
        assert!(matches!(
            supervisor.start(StartOptions::default()),
            Err(SupervisorError::Stopped)
        ));
        assert_eq!(supervisor.status().state, ProcessState::Stopped);
    }

    #[test]
    fn startup_timeout_env_override() {
        let _guard = env_lock().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = std::env::var(STARTUP_TIMEOUT_ENV).ok();

        std::env::set_var(STARTUP_TIMEOUT_ENV, "1500");
        assert_eq!(startup_timeout_from_env(), Duration::from_millis(1500));
        std::env::set_var(STARTUP_TIMEOUT_ENV, "soon");
        assert_eq!(startup_timeout_from_env(), STARTUP_TIMEOUT);

        restore_env(STARTUP_TIMEOUT_ENV, previous);
    }

    fn env_lock() -> &'static Mutex<()> {
        static LOCK: std::sync::OnceLock<Mutex<()>> = std::sync::OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    fn restore_env(key: &str, value: Option<String>) {
        match value {
            Some(value) => std::env::set_var(key, value),
            None => std::env::remove_var(key),
        }
    }

    #[test]
    fn status_is_a_copy() {
        let supervisor = shell_supervisor("true");
        let mut copy = supervisor.status();
        copy.state = ProcessState::Ready;
        copy.port = Some(1);
        assert_eq!(supervisor.status().state, ProcessState::Stopped);
    }
}
