//! Daemon lifecycle: start, stop, restart, status, list.
//!
//! The manager never talks to a running server over the bus protocol.
//! It works from the PID and port files, the instance registry, signals
//! and the `/health` probe.
//!
//! ```text
//!   stopped ──start──▶ starting ──ready──▶ running ──stop──▶ stopping ──▶ stopped
//!                                             │
//!                                             └── pid gone ──▶ crashed
//! ```

use std::fmt;
use std::fs::OpenOptions;
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use daemonize::{Daemonize, Outcome};
use thiserror::Error;
use tracing::{debug, info, warn};

use hookbus_protocol::HealthReport;

use crate::config::{BusConfig, RuntimePaths};
use crate::instances::{InstanceEntry, InstanceRegistry, LaunchMode, RegistryFileError};
use crate::ports::{PortError, PortManager, ProcessTable, ReclaimPolicy, SystemProcessTable};
use crate::runtime::ServeOptions;

/// SIGTERM grace before SIGKILL on stop (50 polls of 100ms).
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Pause between stop and start on restart.
pub const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// How long the launching process waits for the daemon to answer `/health`.
pub const READY_TIMEOUT: Duration = Duration::from_secs(5);

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const READY_POLL: Duration = Duration::from_millis(100);

// ============================================================================
// Types
// ============================================================================

/// Options for `start` and `restart`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    /// Preferred port; outside the configured range it is the only candidate
    pub port: Option<u16>,
    /// Allow reclaiming ports held by our own daemons
    pub force: bool,
    /// Stay attached to the terminal
    pub foreground: bool,
}

/// Result of `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// A server is already running; nothing was launched.
    AlreadyRunning { pid: u32, port: Option<u16> },
    /// Launching side: the detached daemon answered its health probe.
    Started { pid: u32, port: u16 },
    /// This process must now run the server.
    Serve(ServeOptions),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Stopped,
    Running,
    /// Process alive but its port does not accept connections
    Ghost,
    /// PID file left behind by a process that is gone
    Crashed,
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Ghost => write!(f, "ghost"),
            Self::Crashed => write!(f, "crashed"),
        }
    }
}

/// Snapshot returned by `status`.
#[derive(Debug, Clone)]
pub struct DaemonStatus {
    pub state: DaemonState,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub health: Option<HealthReport>,
    /// Set when the health probe answers with an unexpected identity
    pub conflict: Option<String>,
}

impl DaemonStatus {
    fn stopped() -> Self {
        Self {
            state: DaemonState::Stopped,
            pid: None,
            port: None,
            health: None,
            conflict: None,
        }
    }

    /// True while a server process holds the PID file.
    pub fn is_running(&self) -> bool {
        matches!(self.state, DaemonState::Running | DaemonState::Ghost)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped { pid: u32 },
    NotRunning,
}

// ============================================================================
// Daemon Manager
// ============================================================================

pub struct DaemonManager<T: ProcessTable = SystemProcessTable> {
    paths: RuntimePaths,
    config: BusConfig,
    registry: InstanceRegistry,
    ports: PortManager<T>,
}

impl DaemonManager<SystemProcessTable> {
    pub fn system(paths: RuntimePaths, config: BusConfig) -> Self {
        Self::new(SystemProcessTable, paths, config)
    }
}

impl<T: ProcessTable> DaemonManager<T> {
    pub fn new(table: T, paths: RuntimePaths, config: BusConfig) -> Self {
        Self {
            registry: InstanceRegistry::new(&paths.registry_file),
            ports: PortManager::new(table, &paths),
            paths,
            config,
        }
    }

    pub fn paths(&self) -> &RuntimePaths {
        &self.paths
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn ports(&self) -> &PortManager<T> {
        &self.ports
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.ports.table().is_alive(pid)
    }

    /// A live pid from the PID file only counts if it is one of ours;
    /// anything else is a recycled pid.
    fn owns(&self, pid: u32) -> bool {
        if !self.is_alive(pid) {
            return false;
        }
        if self.registry.find_by_pid(pid).is_some() {
            return true;
        }
        self.ports
            .table()
            .describe(pid)
            .is_some_and(|info| info.has_instance_marker || info.is_server_process())
    }

    /// Reports the daemon recorded in the runtime directory.
    pub fn status(&self) -> DaemonStatus {
        let Some(pid) = self.paths.read_pid() else {
            return DaemonStatus::stopped();
        };
        let port = self.paths.read_port();

        if !self.owns(pid) {
            return DaemonStatus {
                state: DaemonState::Crashed,
                pid: Some(pid),
                port,
                health: None,
                conflict: None,
            };
        }

        let accepting = port.is_some_and(accepts_connections);
        if !accepting {
            return DaemonStatus {
                state: DaemonState::Ghost,
                pid: Some(pid),
                port,
                health: None,
                conflict: None,
            };
        }

        let health = port.and_then(|p| match probe_health(p, PROBE_TIMEOUT) {
            Ok(report) => Some(report),
            Err(e) => {
                debug!(error = %e, "Health probe failed");
                None
            }
        });
        let conflict = health.as_ref().and_then(|report| self.check_identity(pid, report));

        DaemonStatus {
            state: DaemonState::Running,
            pid: Some(pid),
            port,
            health,
            conflict,
        }
    }

    /// Compares the probed identity with what was registered. Warns only.
    fn check_identity(&self, pid: u32, report: &HealthReport) -> Option<String> {
        let expected = self.registry.find_by_pid(pid)?;
        if expected.server_id == report.server_id {
            return None;
        }
        let message = format!(
            "port {} answers as server {} but pid {} registered as {}",
            report.port, report.server_id, pid, expected.server_id
        );
        warn!(
            pid,
            expected = %expected.server_id,
            actual = %report.server_id,
            "Server identity conflict"
        );
        Some(message)
    }

    /// Every live registered instance. Dead registrations are removed first.
    pub fn list(&self) -> Result<Vec<InstanceEntry>, DaemonError> {
        Ok(self.registry.cleanup(|pid| self.is_alive(pid))?)
    }

    /// Starts the server unless one is already running.
    ///
    /// In background mode this detaches: the launching process gets
    /// `Started` once the daemon is healthy, the detached child gets
    /// `Serve`. In foreground mode the caller gets `Serve` directly.
    pub fn start(&self, options: StartOptions) -> Result<LaunchOutcome, DaemonError> {
        self.paths.ensure_dir().map_err(|source| DaemonError::Io {
            path: self.paths.dir.clone(),
            source,
        })?;

        let status = self.status();
        match status.state {
            DaemonState::Running | DaemonState::Ghost => {
                if let Some(pid) = status.pid {
                    info!(pid, port = ?status.port, "Server already running");
                    return Ok(LaunchOutcome::AlreadyRunning {
                        pid,
                        port: status.port,
                    });
                }
            }
            DaemonState::Crashed => {
                debug!(pid = ?status.pid, "Clearing stale runtime files");
                self.paths.clear_pid_and_port();
            }
            DaemonState::Stopped => {}
        }

        // Captured before detaching; the daemon runs from `/`.
        let project_root = std::env::current_dir().map_err(|source| DaemonError::Io {
            path: PathBuf::from("."),
            source,
        })?;

        self.registry.cleanup(|pid| self.is_alive(pid))?;
        let port = self.choose_port(options)?;

        if options.foreground {
            return Ok(LaunchOutcome::Serve(ServeOptions {
                port,
                mode: LaunchMode::Foreground,
                project_root,
            }));
        }
        self.detach(port, project_root)
    }

    fn choose_port(&self, options: StartOptions) -> Result<u16, DaemonError> {
        let (start, end) = match options.port {
            Some(port) if !self.config.in_range(port) => (port, port),
            _ => (self.config.port_range_start, self.config.port_range_end),
        };
        let policy = ReclaimPolicy {
            reclaim: self.config.reclaim,
            force: options.force,
        };
        Ok(self.ports.find_available(start, end, options.port, policy)?)
    }

    fn detach(&self, port: u16, project_root: PathBuf) -> Result<LaunchOutcome, DaemonError> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.paths.log_file)
            .map_err(|source| DaemonError::Io {
                path: self.paths.log_file.clone(),
                source,
            })?;
        let log_err = log.try_clone().map_err(|source| DaemonError::Io {
            path: self.paths.log_file.clone(),
            source,
        })?;

        info!(port, log = %self.paths.log_file.display(), "Detaching server");

        let daemonize = Daemonize::new()
            .working_directory("/")
            .stdout(log)
            .stderr(log_err);

        match daemonize.execute() {
            Outcome::Child(Ok(_)) => Ok(LaunchOutcome::Serve(ServeOptions {
                port,
                mode: LaunchMode::Daemon,
                project_root,
            })),
            Outcome::Child(Err(e)) => Err(DaemonError::Detach(e.to_string())),
            Outcome::Parent(Ok(_)) => self.wait_ready(port),
            Outcome::Parent(Err(e)) => Err(DaemonError::Detach(e.to_string())),
        }
    }

    /// Launching side: waits for the PID file and a healthy probe.
    fn wait_ready(&self, port: u16) -> Result<LaunchOutcome, DaemonError> {
        let deadline = Instant::now() + READY_TIMEOUT;

        while Instant::now() < deadline {
            if let (Some(pid), Some(recorded)) = (self.paths.read_pid(), self.paths.read_port()) {
                if !self.is_alive(pid) {
                    return Err(DaemonError::ExitedEarly {
                        log_file: self.paths.log_file.clone(),
                    });
                }
                if recorded == port && probe_health(port, PROBE_TIMEOUT).is_ok() {
                    return Ok(LaunchOutcome::Started { pid, port });
                }
            }
            std::thread::sleep(READY_POLL);
        }

        Err(DaemonError::StartTimeout {
            port,
            log_file: self.paths.log_file.clone(),
        })
    }

    /// Stops the recorded daemon. Stopping a stopped daemon is not an error.
    pub fn stop(&self) -> Result<StopOutcome, DaemonError> {
        let Some(pid) = self.paths.read_pid() else {
            return Ok(StopOutcome::NotRunning);
        };

        if !self.owns(pid) {
            debug!(pid, "PID file is stale");
            self.paths.clear_pid_and_port();
            self.registry.unregister(pid)?;
            return Ok(StopOutcome::NotRunning);
        }

        info!(pid, "Stopping server");
        if !self.ports.table().terminate(pid, STOP_GRACE) {
            return Err(DaemonError::StopTimeout { pid });
        }

        self.paths.clear_pid_and_port();
        self.registry.unregister(pid)?;
        info!(pid, "Server stopped");
        Ok(StopOutcome::Stopped { pid })
    }

    pub fn restart(&self, options: StartOptions) -> Result<LaunchOutcome, DaemonError> {
        if let StopOutcome::Stopped { .. } = self.stop()? {
            std::thread::sleep(SETTLE_DELAY);
        }
        self.start(options)
    }
}

/// Returns true if something accepts TCP connections on the local port.
pub fn accepts_connections(port: u16) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).is_ok()
}

/// Fetches `/health` from a local server.
pub fn probe_health(port: u16, timeout: Duration) -> Result<HealthReport, DaemonError> {
    let url = format!("http://127.0.0.1:{port}/health");
    let agent: ureq::Agent = ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build()
        .into();

    let probe_err = |reason: String| DaemonError::Probe { port, reason };

    let mut response = agent.get(&url).call().map_err(|e| probe_err(e.to_string()))?;
    let body = response
        .body_mut()
        .read_to_string()
        .map_err(|e| probe_err(e.to_string()))?;
    serde_json::from_str(&body).map_err(|e| probe_err(e.to_string()))
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryFileError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error("Failed to detach: {0}")]
    Detach(String),

    #[error("Server exited during startup; see {log_file}")]
    ExitedEarly { log_file: PathBuf },

    #[error("Server on port {port} not healthy after startup; see {log_file}")]
    StartTimeout { port: u16, log_file: PathBuf },

    #[error("Server (pid {pid}) did not exit")]
    StopTimeout { pid: u32 },

    #[error("Health probe on port {port} failed: {reason}")]
    Probe { port: u16, reason: String },
}
