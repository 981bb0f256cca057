//! Configuration file
//!
//! JSON at `~/.capgate/config.json` unless a path is given. A missing file
//! means defaults; unknown keys are rejected so typos do not silently fall
//! back to defaults.

use crate::declaration::ScannerConfig;
use crate::mcp::McpServerConfig;
use crate::shell::ShellConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Largest accepted frame on the broker socket
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Connections a broker serves at once; later ones wait in the listen backlog
pub const DEFAULT_MAX_CONNECTIONS: usize = 32;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CapgateConfig {
    pub scanner: ScannerConfig,
    pub execution: ExecutionConfig,
    pub shell: ShellConfig,
    pub mcp_servers: Vec<McpServerConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionConfig {
    /// Wall-clock limit for one worker run
    pub timeout_secs: u64,
    /// Per-call limit inside the worker
    pub call_timeout_secs: u64,
    /// Where broker sockets are created; the system temp dir when unset
    pub socket_dir: Option<PathBuf>,
    /// Run source units that declare nothing, with an empty declared set
    pub allow_undeclared: bool,
    pub max_frame_bytes: usize,
    pub max_connections: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            call_timeout_secs: 10,
            socket_dir: None,
            allow_undeclared: false,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn socket_dir(&self) -> PathBuf {
        self.socket_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("capgate"))
    }
}

impl CapgateConfig {
    /// `~/.capgate/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".capgate").join("config.json"))
    }

    /// Load from `path`, or from the default location when `None`
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse { path, source })
    }
}
