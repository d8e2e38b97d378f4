//! Instance registry: which bus servers run on which ports.
//!
//! A JSON file under the runtime directory, mapping instance id to its
//! entry:
//!
//! ```json
//! { "8765-4242": { "port": 8765, "pid": 4242, "start_time": "...", "project_root": "/src/app", ... } }
//! ```
//!
//! Every mutation is cleanup-then-read-then-write without locking; the last
//! writer wins.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// How a server was launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// Detached background daemon
    Daemon,
    /// Attached to a terminal (debug run)
    Foreground,
}

impl fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Daemon => write!(f, "daemon"),
            Self::Foreground => write!(f, "foreground"),
        }
    }
}

/// One registered server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceEntry {
    /// `{port}-{pid}`; the entry's key in the file
    #[serde(skip)]
    pub instance_id: String,
    pub port: u16,
    pub pid: u32,
    /// Identity the server reports on `/health`
    pub server_id: String,
    #[serde(rename = "start_time")]
    pub started_at: DateTime<Utc>,
    /// Directory the server was launched from
    pub project_root: PathBuf,
    pub mode: LaunchMode,
}

impl InstanceEntry {
    pub fn new(
        port: u16,
        pid: u32,
        server_id: impl Into<String>,
        mode: LaunchMode,
        project_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            instance_id: format!("{port}-{pid}"),
            port,
            pid,
            server_id: server_id.into(),
            started_at: Utc::now(),
            project_root: project_root.into(),
            mode,
        }
    }
}

type RegistryFile = BTreeMap<String, InstanceEntry>;

/// Handle to the registry file.
#[derive(Debug, Clone)]
pub struct InstanceRegistry {
    path: PathBuf,
}

impl InstanceRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every entry. A missing or corrupt file reads as empty.
    pub fn load(&self) -> Vec<InstanceEntry> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(_) => return Vec::new(),
        };
        match serde_json::from_str::<RegistryFile>(&text) {
            Ok(file) => file
                .into_iter()
                .map(|(id, mut entry)| {
                    entry.instance_id = id;
                    entry
                })
                .collect(),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Instance registry unreadable, treating as empty"
                );
                Vec::new()
            }
        }
    }

    /// Removes entries whose process is gone. Returns the live entries.
    pub fn cleanup<F>(&self, is_alive: F) -> Result<Vec<InstanceEntry>, RegistryFileError>
    where
        F: Fn(u32) -> bool,
    {
        let entries = self.load();
        let before = entries.len();
        let live: Vec<InstanceEntry> = entries.into_iter().filter(|e| is_alive(e.pid)).collect();

        if live.len() != before {
            debug!(removed = before - live.len(), "Removed dead instance registrations");
            self.store(&live)?;
        }
        Ok(live)
    }

    /// Adds `entry`, replacing any registration for the same port or pid.
    pub fn register<F>(&self, entry: InstanceEntry, is_alive: F) -> Result<(), RegistryFileError>
    where
        F: Fn(u32) -> bool,
    {
        let mut entries = self.cleanup(is_alive)?;
        entries.retain(|e| e.port != entry.port && e.pid != entry.pid);
        debug!(port = entry.port, pid = entry.pid, mode = %entry.mode, "Registering instance");
        entries.push(entry);
        self.store(&entries)
    }

    /// Removes the registration of `pid`, if any.
    pub fn unregister(&self, pid: u32) -> Result<(), RegistryFileError> {
        let mut entries = self.load();
        let before = entries.len();
        entries.retain(|e| e.pid != pid);
        if entries.len() != before {
            self.store(&entries)?;
        }
        Ok(())
    }

    pub fn find_by_pid(&self, pid: u32) -> Option<InstanceEntry> {
        self.load().into_iter().find(|e| e.pid == pid)
    }

    pub fn find_by_port(&self, port: u16) -> Option<InstanceEntry> {
        self.load().into_iter().find(|e| e.port == port)
    }

    fn store(&self, entries: &[InstanceEntry]) -> Result<(), RegistryFileError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| RegistryFileError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let file: RegistryFile = entries
            .iter()
            .map(|e| (e.instance_id.clone(), e.clone()))
            .collect();
        let json = serde_json::to_string_pretty(&file)?;

        // Write-then-rename so readers never see a torn file.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|source| RegistryFileError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| RegistryFileError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

/// Errors writing the registry file.
#[derive(Debug, Error)]
pub enum RegistryFileError {
    #[error("Instance registry I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode instance registry: {0}")]
    Encode(#[from] serde_json::Error),
}
