//! Runs one bus server process from bind to clean exit.

use std::net::SocketAddr;
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{spawn_bus, BusSettings};
use crate::config::{BusConfig, RuntimePaths};
use crate::heartbeat::Heartbeat;
use crate::instances::{InstanceEntry, InstanceRegistry, LaunchMode};
use crate::ports::{ProcessTable, SystemProcessTable};
use crate::server::{EventBusServer, ServerError, DEFAULT_HOST};

/// Identity reported on `/health` and in heartbeats.
pub fn new_server_id(pid: u32) -> String {
    format!("hookbusd-{pid}-{}", chrono::Utc::now().timestamp_millis())
}

/// What one server process runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeOptions {
    /// 0 picks an ephemeral port
    pub port: u16,
    pub mode: LaunchMode,
    /// Directory the operator launched from, recorded in the registry
    pub project_root: PathBuf,
}

/// Serves the bus until `shutdown` fires.
///
/// A daemon writes the PID and port files; every mode registers itself in
/// the instance registry. All of it is removed again on the way out.
pub async fn serve(
    config: BusConfig,
    paths: RuntimePaths,
    options: ServeOptions,
    shutdown: CancellationToken,
) -> Result<(), RuntimeError> {
    let ServeOptions {
        port,
        mode,
        project_root,
    } = options;
    let pid = std::process::id();
    let server_id = new_server_id(pid);

    paths.ensure_dir().map_err(|source| RuntimeError::Io {
        path: paths.dir.clone(),
        source,
    })?;

    let bus = spawn_bus(BusSettings::from_config(&config, server_id.clone()));
    let addr = SocketAddr::from((DEFAULT_HOST, port));

    let server = match EventBusServer::bind(addr, bus.clone(), config.auth_token.clone(), shutdown.clone()).await {
        Ok(server) => server,
        Err(e) => {
            bus.shutdown().await;
            if e.is_addr_in_use() {
                return Err(RuntimeError::PortUnavailable { port });
            }
            return Err(e.into());
        }
    };
    let port = server.local_addr()?.port();

    if mode == LaunchMode::Daemon {
        paths.write_pid(pid).map_err(|source| RuntimeError::Io {
            path: paths.pid_file.clone(),
            source,
        })?;
        paths.write_port(port).map_err(|source| RuntimeError::Io {
            path: paths.port_file.clone(),
            source,
        })?;
    }

    let registry = InstanceRegistry::new(&paths.registry_file);
    let table = SystemProcessTable;
    let entry = InstanceEntry::new(port, pid, &server_id, mode, project_root);
    if let Err(e) = registry.register(entry, |p| table.is_alive(p)) {
        warn!(error = %e, "Failed to register instance");
    }

    let mut heartbeat = Heartbeat::new(bus, config.heartbeat_interval()).with_parent(&shutdown);
    heartbeat.start();

    info!(port, pid, %server_id, %mode, "Bus server ready");
    let result = server.run().await;

    heartbeat.stop().await;

    if let Err(e) = registry.unregister(pid) {
        warn!(error = %e, "Failed to unregister instance");
    }
    if mode == LaunchMode::Daemon && paths.read_pid() == Some(pid) {
        paths.clear_pid_and_port();
    }

    result.map_err(RuntimeError::from)
}

/// Resolves on SIGTERM or SIGINT.
pub async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("port {port} became unavailable; try `hookbusd start --port <other>`")]
    PortUnavailable { port: u16 },

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}
