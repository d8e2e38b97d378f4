//! Port scanning, occupant classification and reclaim.
//!
//! Who holds a port is a documented heuristic, checked in order:
//!
//! 1. The pid is in the instance registry: its launch mode decides
//!    (`daemon` is own-daemon, `foreground` is own-debug).
//! 2. The pid matches the daemon PID file: own-daemon.
//! 3. The command line names the `hookbusd` binary, or the environment
//!    carries `HOOKBUS_INSTANCE`: own-debug.
//! 4. Anything else with a known pid is external; a listener whose pid
//!    cannot be resolved is unknown.
//!
//! Only own-debug servers are reclaimed by default. Own daemons need an
//! explicit force; external and unknown occupants are never touched.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{RuntimePaths, INSTANCE_ENV};
use crate::instances::{InstanceRegistry, LaunchMode};

/// Name of the server binary, used to recognise our own processes.
pub const SERVER_BINARY: &str = "hookbusd";

/// Grace period between SIGTERM and SIGKILL when reclaiming.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(3);

/// How long to wait for a reclaimed port to become bindable.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

// ============================================================================
// Process Table Seam
// ============================================================================

/// What the classifier needs to know about a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub cmdline: Vec<String>,
    /// Environment carries `HOOKBUS_INSTANCE`
    pub has_instance_marker: bool,
}

impl ProcessInfo {
    /// Command line joined for display.
    pub fn command(&self) -> String {
        self.cmdline.join(" ")
    }

    /// True when the command line names the server binary.
    pub fn is_server_process(&self) -> bool {
        self.cmdline.iter().take(2).any(|arg| {
            std::path::Path::new(arg)
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n == SERVER_BINARY)
        })
    }
}

/// Access to the operating system's process table.
pub trait ProcessTable {
    /// Pid of the process listening on `port`, if it can be resolved.
    fn listener_pid(&self, port: u16) -> Option<u32>;

    fn describe(&self, pid: u32) -> Option<ProcessInfo>;

    fn is_alive(&self, pid: u32) -> bool;

    /// Sends SIGTERM, waits up to `grace`, then SIGKILL.
    /// Returns true once the process is gone.
    fn terminate(&self, pid: u32, grace: Duration) -> bool;
}

/// `/proc`-backed process table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessTable;

impl SystemProcessTable {
    fn listening_inodes(port: u16) -> HashSet<u64> {
        let v4 = procfs::net::tcp().unwrap_or_default();
        let v6 = procfs::net::tcp6().unwrap_or_default();
        v4.into_iter()
            .chain(v6)
            .filter(|e| e.local_address.port() == port && e.state == procfs::net::TcpState::Listen)
            .map(|e| e.inode)
            .collect()
    }

    fn signal(pid: u32, signal: libc::c_int) -> bool {
        if pid == 0 || pid == std::process::id() {
            return false;
        }
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        // SAFETY: kill(2) has no memory-safety preconditions.
        unsafe { libc::kill(raw, signal) == 0 }
    }

    fn wait_gone(&self, pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !self.is_alive(pid) {
                return true;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        !self.is_alive(pid)
    }
}

impl ProcessTable for SystemProcessTable {
    fn listener_pid(&self, port: u16) -> Option<u32> {
        let inodes = Self::listening_inodes(port);
        if inodes.is_empty() {
            return None;
        }

        for process in procfs::process::all_processes().ok()?.flatten() {
            let Ok(fds) = process.fd() else { continue };
            for fd in fds.flatten() {
                if let procfs::process::FDTarget::Socket(inode) = fd.target {
                    if inodes.contains(&inode) {
                        return u32::try_from(process.pid).ok();
                    }
                }
            }
        }
        None
    }

    fn describe(&self, pid: u32) -> Option<ProcessInfo> {
        let process = procfs::process::Process::new(i32::try_from(pid).ok()?).ok()?;
        let cmdline = process.cmdline().unwrap_or_default();
        let has_instance_marker = process
            .environ()
            .map(|env| env.contains_key(std::ffi::OsStr::new(INSTANCE_ENV)))
            .unwrap_or(false);
        Some(ProcessInfo {
            pid,
            cmdline,
            has_instance_marker,
        })
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        procfs::process::Process::new(raw)
            .and_then(|p| p.stat())
            .map(|stat| stat.state != 'Z')
            .unwrap_or(false)
    }

    fn terminate(&self, pid: u32, grace: Duration) -> bool {
        if !self.is_alive(pid) {
            return true;
        }
        if !Self::signal(pid, libc::SIGTERM) {
            return !self.is_alive(pid);
        }
        if self.wait_gone(pid, grace) {
            return true;
        }
        warn!(pid, "Process ignored SIGTERM, sending SIGKILL");
        Self::signal(pid, libc::SIGKILL);
        self.wait_gone(pid, Duration::from_secs(1))
    }
}

// ============================================================================
// Port Status
// ============================================================================

/// Who, if anyone, holds a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortState {
    Free,
    OwnDebug { pid: u32 },
    OwnDaemon { pid: u32 },
    External { pid: u32, command: String },
    Unknown,
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::OwnDebug { pid } => write!(f, "own-debug (pid {pid})"),
            Self::OwnDaemon { pid } => write!(f, "own-daemon (pid {pid})"),
            Self::External { pid, command } => write!(f, "external (pid {pid}: {command})"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortStatus {
    pub port: u16,
    pub state: PortState,
}

/// What `find_available` may do to occupied ports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimPolicy {
    /// Reclaim ports held by our own debug servers
    pub reclaim: bool,
    /// Also reclaim ports held by our own daemons
    pub force: bool,
}

// ============================================================================
// Port Manager
// ============================================================================

/// Scans a port range and picks or reclaims a port for the bus.
pub struct PortManager<T: ProcessTable = SystemProcessTable> {
    table: T,
    registry: InstanceRegistry,
    paths: RuntimePaths,
    host: IpAddr,
    grace: Duration,
}

impl PortManager<SystemProcessTable> {
    pub fn system(paths: &RuntimePaths) -> Self {
        Self::new(SystemProcessTable, paths)
    }
}

impl<T: ProcessTable> PortManager<T> {
    pub fn new(table: T, paths: &RuntimePaths) -> Self {
        Self {
            table,
            registry: InstanceRegistry::new(&paths.registry_file),
            paths: paths.clone(),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            grace: DEFAULT_GRACE,
        }
    }

    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn table(&self) -> &T {
        &self.table
    }

    /// Returns true if the port can be bound right now.
    pub fn is_free(&self, port: u16) -> bool {
        TcpListener::bind((self.host, port)).is_ok()
    }

    /// Classifies one port.
    pub fn classify(&self, port: u16) -> PortStatus {
        let state = if self.is_free(port) {
            PortState::Free
        } else {
            match self.table.listener_pid(port) {
                Some(pid) => self.classify_pid(pid),
                None => PortState::Unknown,
            }
        };
        PortStatus { port, state }
    }

    fn classify_pid(&self, pid: u32) -> PortState {
        if let Some(entry) = self.registry.find_by_pid(pid) {
            return match entry.mode {
                LaunchMode::Daemon => PortState::OwnDaemon { pid },
                LaunchMode::Foreground => PortState::OwnDebug { pid },
            };
        }

        if self.paths.read_pid() == Some(pid) {
            return PortState::OwnDaemon { pid };
        }

        match self.table.describe(pid) {
            Some(info) if info.has_instance_marker || info.is_server_process() => {
                PortState::OwnDebug { pid }
            }
            Some(info) => PortState::External {
                pid,
                command: info.command(),
            },
            None => PortState::Unknown,
        }
    }

    /// Classifies every port in `start..=end`.
    pub fn scan(&self, start: u16, end: u16) -> Vec<PortStatus> {
        (start..=end).map(|port| self.classify(port)).collect()
    }

    /// Picks a port in `start..=end`, trying `preferred` first and then
    /// wrapping around the range.
    ///
    /// # Errors
    ///
    /// `PortError::NoPortAvailable` when every port is taken by an
    /// occupant the policy does not allow reclaiming.
    pub fn find_available(
        &self,
        start: u16,
        end: u16,
        preferred: Option<u16>,
        policy: ReclaimPolicy,
    ) -> Result<u16, PortError> {
        if start > end {
            return Err(PortError::InvalidRange { start, end });
        }

        for port in candidate_order(start, end, preferred) {
            let status = self.classify(port);
            debug!(port, state = %status.state, "Port classified");

            match status.state {
                PortState::Free => return Ok(port),
                PortState::OwnDebug { pid } if policy.reclaim => {
                    if self.reclaim(port, pid) {
                        return Ok(port);
                    }
                }
                PortState::OwnDaemon { pid } if policy.force => {
                    if self.reclaim(port, pid) {
                        return Ok(port);
                    }
                }
                _ => {}
            }
        }

        Err(PortError::NoPortAvailable { start, end })
    }

    fn reclaim(&self, port: u16, pid: u32) -> bool {
        info!(port, pid, "Reclaiming port from our own server");
        if !self.table.terminate(pid, self.grace) {
            warn!(port, pid, "Failed to stop previous server");
            return false;
        }

        let deadline = Instant::now() + RELEASE_TIMEOUT;
        while Instant::now() < deadline {
            if self.is_free(port) {
                if let Err(e) = self.registry.unregister(pid) {
                    debug!(error = %e, "Could not drop registration of reclaimed server");
                }
                return true;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        warn!(port, pid, "Port still busy after reclaim");
        false
    }
}

/// `preferred..=end` then `start..preferred`; the whole range when there is
/// no in-range preference.
fn candidate_order(start: u16, end: u16, preferred: Option<u16>) -> Vec<u16> {
    match preferred.filter(|p| (start..=end).contains(p)) {
        Some(p) => (p..=end).chain(start..p).collect(),
        None => (start..=end).collect(),
    }
}

/// Errors raised while selecting a port.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("No port available in range {start}-{end}")]
    NoPortAvailable { start: u16, end: u16 },

    #[error("Invalid port range {start}-{end}")]
    InvalidRange { start: u16, end: u16 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instances::InstanceEntry;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Fake table: each pid "owns" a real listener that terminate() drops.
    #[derive(Default)]
    struct FakeTable {
        listeners: Mutex<HashMap<u32, TcpListener>>,
        ports: HashMap<u16, u32>,
        infos: HashMap<u32, ProcessInfo>,
        terminated: Mutex<Vec<u32>>,
    }

    impl FakeTable {
        fn occupy(&mut self, pid: u32, cmdline: &[&str]) -> u16 {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let port = listener.local_addr().unwrap().port();
            self.listeners.lock().unwrap().insert(pid, listener);
            self.ports.insert(port, pid);
            self.infos.insert(
                pid,
                ProcessInfo {
                    pid,
                    cmdline: cmdline.iter().map(|s| s.to_string()).collect(),
                    has_instance_marker: false,
                },
            );
            port
        }
    }

    impl ProcessTable for FakeTable {
        fn listener_pid(&self, port: u16) -> Option<u32> {
            self.ports.get(&port).copied()
        }
        fn describe(&self, pid: u32) -> Option<ProcessInfo> {
            self.infos.get(&pid).cloned()
        }
        fn is_alive(&self, pid: u32) -> bool {
            self.listeners.lock().unwrap().contains_key(&pid)
        }
        fn terminate(&self, pid: u32, _grace: Duration) -> bool {
            self.terminated.lock().unwrap().push(pid);
            self.listeners.lock().unwrap().remove(&pid);
            true
        }
    }

    fn paths() -> (tempfile::TempDir, RuntimePaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = RuntimePaths::in_dir(dir.path());
        (dir, paths)
    }

    #[test]
    fn test_candidate_order_wraps() {
        assert_eq!(candidate_order(1, 5, Some(3)), vec![3, 4, 5, 1, 2]);
        assert_eq!(candidate_order(1, 3, None), vec![1, 2, 3]);
        assert_eq!(candidate_order(1, 3, Some(9)), vec![1, 2, 3]);
    }

    #[test]
    fn test_classify_external_by_cmdline() {
        let (_dir, paths) = paths();
        let mut table = FakeTable::default();
        let port = table.occupy(4242, &["python3", "-m", "http.server"]);
        let manager = PortManager::new(table, &paths);

        match manager.classify(port).state {
            PortState::External { pid, command } => {
                assert_eq!(pid, 4242);
                assert!(command.starts_with("python3"));
            }
            other => panic!("expected external, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_own_debug_by_binary_name() {
        let (_dir, paths) = paths();
        let mut table = FakeTable::default();
        let port = table.occupy(4243, &["/usr/local/bin/hookbusd", "run"]);
        let manager = PortManager::new(table, &paths);
        assert_eq!(manager.classify(port).state, PortState::OwnDebug { pid: 4243 });
    }

    #[test]
    fn test_registry_mode_wins_over_cmdline() {
        let (_dir, paths) = paths();
        let mut table = FakeTable::default();
        let port = table.occupy(4244, &["hookbusd", "start"]);
        InstanceRegistry::new(&paths.registry_file)
            .register(InstanceEntry::new(port, 4244, "x", LaunchMode::Daemon, "/src/app"), |_| true)
            .unwrap();
        let manager = PortManager::new(table, &paths);
        assert_eq!(manager.classify(port).state, PortState::OwnDaemon { pid: 4244 });
    }

    #[test]
    fn test_pid_file_marks_daemon() {
        let (_dir, paths) = paths();
        let mut table = FakeTable::default();
        let port = table.occupy(4245, &["something"]);
        std::fs::write(&paths.pid_file, "4245\n").unwrap();
        let manager = PortManager::new(table, &paths);
        assert_eq!(manager.classify(port).state, PortState::OwnDaemon { pid: 4245 });
    }

    #[test]
    fn test_unresolvable_listener_is_unknown() {
        let (_dir, paths) = paths();
        let held = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();
        let manager = PortManager::new(FakeTable::default(), &paths);
        assert_eq!(manager.classify(port).state, PortState::Unknown);
    }

    #[test]
    fn test_invalid_range() {
        let (_dir, paths) = paths();
        let manager = PortManager::new(FakeTable::default(), &paths);
        assert_eq!(
            manager.find_available(10, 5, None, ReclaimPolicy::default()),
            Err(PortError::InvalidRange { start: 10, end: 5 })
        );
    }
}
