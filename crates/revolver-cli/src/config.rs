// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2025 Revolver Contributors

//! Configuration document for `revolver watch`.
//!
//! A YAML file, usually created with `revolver init`:
//!
//! ```yaml
//! log_level: info
//! root: .
//! exec: cmd/revolver
//! ports:
//!   - port: 8080
//!     name: http
//!     env: HTTP_PORT
//! scripts:
//!   preload: go build -o app .
//!   run: ./app
//!   cleanup: rm app
//! exts: [.go, .mod, .sum]
//! ```
//!
//! The tuning keys (`listen_host`, `debounce_ms`, ...) are optional.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use revolver_ecdysis::{CoordinatorSettings, PortBinding, ScriptBundle};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Failed to write config file {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] serde_yaml::Error),

    #[error("Config file {0:?} already exists (use --force to overwrite)")]
    Exists(PathBuf),

    #[error("scripts.run must not be empty")]
    MissingRunScript,

    #[error("Port {name:?} has port number 0")]
    ZeroPort { name: String },

    #[error("Every port needs a non-empty name")]
    EmptyPortName,

    #[error("Port {name:?} needs a non-empty env variable name")]
    EmptyEnvName { name: String },

    #[error("Port name {0:?} is used more than once")]
    DuplicateName(String),

    #[error("Env variable {0:?} is used more than once")]
    DuplicateEnv(String),

    #[error("Port {0} is listed more than once")]
    DuplicatePort(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(level)
    }
}

/// One public port and the variable that carries its backend port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    pub port: u16,
    pub name: String,
    pub env: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptConfig {
    #[serde(default)]
    pub preload: String,
    #[serde(default)]
    pub run: String,
    #[serde(default)]
    pub cleanup: String,
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log_level: LogLevel,
    /// Project root watched for changes.
    #[serde(default = "default_dir")]
    pub root: PathBuf,
    /// Working directory of every script.
    #[serde(default = "default_dir")]
    pub exec: PathBuf,
    #[serde(default)]
    pub ports: Vec<PortConfig>,
    #[serde(default)]
    pub scripts: ScriptConfig,
    /// Extension suffixes that trigger a restart. Empty means every file.
    #[serde(default)]
    pub exts: Vec<String>,

    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "default_drain_interval_secs")]
    pub drain_interval_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Accept PROXY v2 headers from clients.
    #[serde(default)]
    pub trust_proxy_header: bool,
}

fn default_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_listen_host() -> String {
    "0.0.0.0".into()
}

fn default_debounce_ms() -> u64 {
    2_000
}

fn default_ready_timeout_secs() -> u64 {
    30
}

fn default_stop_grace_ms() -> u64 {
    3_000
}

fn default_drain_interval_secs() -> u64 {
    10
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

/// The document written by `revolver init`: a Go service built in place.
impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            root: default_dir(),
            exec: PathBuf::from("cmd/revolver"),
            ports: vec![PortConfig {
                port: 8080,
                name: "http".into(),
                env: "HTTP_PORT".into(),
            }],
            scripts: ScriptConfig {
                preload: "go build -o app .".into(),
                run: "./app".into(),
                cleanup: "rm app".into(),
            },
            exts: vec![".go".into(), ".mod".into(), ".sum".into()],
            listen_host: default_listen_host(),
            debounce_ms: default_debounce_ms(),
            ready_timeout_secs: default_ready_timeout_secs(),
            stop_grace_ms: default_stop_grace_ms(),
            drain_interval_secs: default_drain_interval_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            trust_proxy_header: false,
        }
    }
}

impl Config {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default document to `path`, creating parent directories.
    pub fn write_default(path: &Path, force: bool) -> Result<(), ConfigError> {
        if path.exists() && !force {
            return Err(ConfigError::Exists(path.to_path_buf()));
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let content = serde_yaml::to_string(&Config::default())?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scripts.run.trim().is_empty() {
            return Err(ConfigError::MissingRunScript);
        }

        let mut names = HashSet::new();
        let mut envs = HashSet::new();
        let mut numbers = HashSet::new();
        for port in &self.ports {
            if port.name.is_empty() {
                return Err(ConfigError::EmptyPortName);
            }
            if port.port == 0 {
                return Err(ConfigError::ZeroPort {
                    name: port.name.clone(),
                });
            }
            if port.env.is_empty() {
                return Err(ConfigError::EmptyEnvName {
                    name: port.name.clone(),
                });
            }
            if !names.insert(port.name.as_str()) {
                return Err(ConfigError::DuplicateName(port.name.clone()));
            }
            if !envs.insert(port.env.as_str()) {
                return Err(ConfigError::DuplicateEnv(port.env.clone()));
            }
            if !numbers.insert(port.port) {
                return Err(ConfigError::DuplicatePort(port.port));
            }
        }

        Ok(())
    }

    /// Public listen address for one port.
    pub fn listen_addr(&self, port: u16) -> String {
        if self.listen_host.contains(':') && !self.listen_host.starts_with('[') {
            format!("[{}]:{}", self.listen_host, port)
        } else {
            format!("{}:{}", self.listen_host, port)
        }
    }

    pub fn scripts(&self) -> ScriptBundle {
        ScriptBundle::new(
            self.scripts.preload.clone(),
            self.scripts.run.clone(),
            self.scripts.cleanup.clone(),
        )
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            work_dir: self.exec.clone(),
            scripts: self.scripts(),
            ports: self
                .ports
                .iter()
                .map(|p| PortBinding::new(p.port, p.name.clone(), p.env.clone()))
                .collect(),
            ready_timeout: Duration::from_secs(self.ready_timeout_secs),
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
