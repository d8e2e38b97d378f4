//! Bus configuration and runtime file locations.
//!
//! Configuration is layered: built-in defaults, then
//! `$XDG_CONFIG_HOME/hookbus/config.toml` when present, then `HOOKBUS_*`
//! environment variables. Command-line flags are applied last by the
//! binaries.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Environment variable overriding the runtime directory.
pub const RUNTIME_DIR_ENV: &str = "HOOKBUS_RUNTIME_DIR";

/// Environment marker that identifies a debug server started by tooling.
pub const INSTANCE_ENV: &str = "HOOKBUS_INSTANCE";

// ============================================================================
// Bus Configuration
// ============================================================================

/// Tunables for the bus daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Seconds between `system.heartbeat` events
    pub heartbeat_interval_secs: u64,

    /// Number of events retained for replay
    pub history_capacity: usize,

    /// First port of the scan range (inclusive)
    pub port_range_start: u16,

    /// Last port of the scan range (inclusive)
    pub port_range_end: u16,

    /// Reclaim ports held by our own debug servers
    pub reclaim: bool,

    /// Maximum concurrently connected clients
    pub max_clients: usize,

    /// Idle time after which a session record is dropped
    pub session_ttl_secs: u64,

    /// Shared secret clients must present on connect
    pub auth_token: Option<String>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 60,
            history_capacity: 1000,
            port_range_start: 8765,
            port_range_end: 8785,
            reclaim: true,
            max_clients: 64,
            session_ttl_secs: 3600,
            auth_token: None,
        }
    }
}

impl BusConfig {
    /// Returns the default config file location, if a config dir exists.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("hookbus").join("config.toml"))
    }

    /// Loads the layered configuration (file, then environment).
    ///
    /// A missing file is not an error; a malformed one is.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).or_else(Self::default_path);

        let mut config = match path {
            Some(ref p) if p.exists() => Self::from_file(p)?,
            _ => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// Applies `HOOKBUS_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("HOOKBUS_HEARTBEAT_INTERVAL") {
            self.heartbeat_interval_secs = parse_value("HOOKBUS_HEARTBEAT_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("HOOKBUS_HISTORY_CAPACITY") {
            self.history_capacity = parse_value("HOOKBUS_HISTORY_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("HOOKBUS_PORT_RANGE") {
            let (start, end) = parse_range(&v)?;
            self.port_range_start = start;
            self.port_range_end = end;
        }
        if let Some(v) = lookup("HOOKBUS_RECLAIM") {
            self.reclaim = parse_bool("HOOKBUS_RECLAIM", &v)?;
        }
        if let Some(v) = lookup("HOOKBUS_MAX_CLIENTS") {
            self.max_clients = parse_value("HOOKBUS_MAX_CLIENTS", &v)?;
        }
        if let Some(v) = lookup("HOOKBUS_SESSION_TTL") {
            self.session_ttl_secs = parse_value("HOOKBUS_SESSION_TTL", &v)?;
        }
        if let Some(v) = lookup("HOOKBUS_TOKEN") {
            self.auth_token = if v.is_empty() { None } else { Some(v) };
        }
        Ok(())
    }

    /// Rejects values the bus cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port_range_start > self.port_range_end {
            return Err(ConfigError::InvalidValue {
                key: "port_range".to_string(),
                value: format!("{}-{}", self.port_range_start, self.port_range_end),
                reason: "range start is after range end".to_string(),
            });
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "heartbeat_interval_secs".to_string(),
                value: "0".to_string(),
                reason: "must be at least one second".to_string(),
            });
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "history_capacity".to_string(),
                value: "0".to_string(),
                reason: "must hold at least one event".to_string(),
            });
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// Returns true if `port` lies inside the configured range.
    pub fn in_range(&self, port: u16) -> bool {
        (self.port_range_start..=self.port_range_end).contains(&port)
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: "not a valid number".to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}

/// Parses `START-END` (or a single port).
pub fn parse_range(value: &str) -> Result<(u16, u16), ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        key: "port_range".to_string(),
        value: value.to_string(),
        reason: "expected START-END".to_string(),
    };

    match value.split_once('-') {
        Some((start, end)) => {
            let start = start.trim().parse().map_err(|_| invalid())?;
            let end = end.trim().parse().map_err(|_| invalid())?;
            Ok((start, end))
        }
        None => {
            let port = value.trim().parse().map_err(|_| invalid())?;
            Ok((port, port))
        }
    }
}

// ============================================================================
// Runtime Paths
// ============================================================================

/// Files the daemon lifecycle keeps under the runtime directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    pub dir: PathBuf,
    pub pid_file: PathBuf,
    pub port_file: PathBuf,
    pub log_file: PathBuf,
    pub registry_file: PathBuf,
}

impl RuntimePaths {
    /// Lays out the runtime files inside `dir`.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            pid_file: dir.join("hookbusd.pid"),
            port_file: dir.join("hookbusd.port"),
            log_file: dir.join("hookbusd.log"),
            registry_file: dir.join("instances.json"),
            dir,
        }
    }

    /// Resolves the runtime directory from the environment.
    ///
    /// `HOOKBUS_RUNTIME_DIR`, else `<state dir>/hookbus`, else `/tmp/hookbus`.
    pub fn from_env() -> Self {
        let dir = std::env::var_os(RUNTIME_DIR_ENV)
            .map(PathBuf::from)
            .or_else(|| dirs::state_dir().map(|d| d.join("hookbus")))
            .unwrap_or_else(|| PathBuf::from("/tmp/hookbus"));
        Self::in_dir(dir)
    }

    /// Creates the runtime directory if needed.
    pub fn ensure_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)
    }

    /// Pid recorded by a daemonized server, if any.
    pub fn read_pid(&self) -> Option<u32> {
        read_number(&self.pid_file)
    }

    /// Port recorded by a daemonized server, if any.
    pub fn read_port(&self) -> Option<u16> {
        read_number(&self.port_file)
    }

    pub fn write_pid(&self, pid: u32) -> std::io::Result<()> {
        self.ensure_dir()?;
        std::fs::write(&self.pid_file, format!("{pid}\n"))
    }

    pub fn write_port(&self, port: u16) -> std::io::Result<()> {
        self.ensure_dir()?;
        std::fs::write(&self.port_file, format!("{port}\n"))
    }

    /// Removes the PID and port files. Missing files are fine.
    pub fn clear_pid_and_port(&self) {
        for path in [&self.pid_file, &self.port_file] {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!(path = %path.display(), error = %e, "Failed to remove runtime file");
                }
            }
        }
    }
}

fn read_number<T: std::str::FromStr>(path: &Path) -> Option<T> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: {value} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.heartbeat_interval_secs, 60);
        assert_eq!(config.history_capacity, 1000);
        assert_eq!((config.port_range_start, config.port_range_end), (8765, 8785));
        assert!(config.reclaim);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "history_capacity = 50\nreclaim = false\n").unwrap();

        let config = BusConfig::from_file(&path).unwrap();
        assert_eq!(config.history_capacity, 50);
        assert!(!config.reclaim);
        assert_eq!(config.heartbeat_interval_secs, 60);
    }

    #[test]
    fn test_malformed_toml_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "history_capacity = \"lots\"").unwrap();
        assert!(matches!(
            BusConfig::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = BusConfig::default();
        config
            .apply_env(env(&[
                ("HOOKBUS_PORT_RANGE", "9000-9010"),
                ("HOOKBUS_RECLAIM", "off"),
                ("HOOKBUS_TOKEN", "s3cret"),
            ]))
            .unwrap();
        assert_eq!((config.port_range_start, config.port_range_end), (9000, 9010));
        assert!(!config.reclaim);
        assert_eq!(config.auth_token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_env_rejects_garbage() {
        let mut config = BusConfig::default();
        let err = config
            .apply_env(env(&[("HOOKBUS_HISTORY_CAPACITY", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("HOOKBUS_HISTORY_CAPACITY"));
    }

    #[test]
    fn test_validate_range() {
        let config = BusConfig {
            port_range_start: 9000,
            port_range_end: 8000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_range_single_port() {
        assert_eq!(parse_range("8765").unwrap(), (8765, 8765));
        assert!(parse_range("a-b").is_err());
    }

    #[test]
    fn test_runtime_paths_layout() {
        let paths = RuntimePaths::in_dir("/run/hb");
        assert_eq!(paths.pid_file, PathBuf::from("/run/hb/hookbusd.pid"));
        assert_eq!(paths.registry_file, PathBuf::from("/run/hb/instances.json"));
    }

    #[test]
    fn test_pid_and_port_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RuntimePaths::in_dir(dir.path().join("rt"));
        assert_eq!(paths.read_pid(), None);

        paths.write_pid(4321).unwrap();
        paths.write_port(8770).unwrap();
        assert_eq!(paths.read_pid(), Some(4321));
        assert_eq!(paths.read_port(), Some(8770));

        paths.clear_pid_and_port();
        paths.clear_pid_and_port();
        assert_eq!(paths.read_port(), None);
    }
}
