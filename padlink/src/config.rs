//! YAML configuration. Every field has a default so an empty or missing file
//! is valid.
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use directories_next::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::core::prelude::*;
use crate::error::PadError;
use crate::wire::{DEFAULT_CONFLICT_THRESHOLD, TrailingBytePolicy};

pub const CONFIG_FILE_NAME: &str = "padlink.yaml";

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub link: LinkConfig,
    pub supervisor: SupervisorConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LinkConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            connect_timeout_ms: 3000,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// A `padlink-runner` child process per session.
    #[default]
    Process,
    /// A thread per session, preempted by an instruction hook.
    Thread,
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "process" => Ok(ExecutionMode::Process),
            "thread" => Ok(ExecutionMode::Thread),
            other => Err(format!(
                "unknown execution mode '{}' (expected process or thread)",
                other
            )),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Process => write!(f, "process"),
            ExecutionMode::Thread => write!(f, "thread"),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    pub execution: ExecutionMode,
    pub runner_path: Option<PathBuf>,
    pub runner_args: Vec<String>,
    pub rpc_timeout_ms: u64,
    pub grace_period_ms: u64,
    pub trailing_byte: TrailingBytePolicy,
    pub conflict_threshold: usize,
    pub memory_limit_bytes: usize,
    pub hook_instruction_interval: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            execution: ExecutionMode::default(),
            runner_path: None,
            runner_args: Vec::new(),
            rpc_timeout_ms: 1000,
            grace_period_ms: 500,
            trailing_byte: TrailingBytePolicy::default(),
            conflict_threshold: DEFAULT_CONFLICT_THRESHOLD,
            memory_limit_bytes: 32 * 1024 * 1024,
            hook_instruction_interval: 1000,
        }
    }
}

impl Config {
    pub fn from_yaml(source: &str) -> Result<Self, PadError> {
        if source.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yml::from_str(source)
            .map_err(|err| PadError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, PadError> {
        let source = fs::read_to_string(path).map_err(|err| {
            PadError::Config(format!(
                "failed to read '{}': {}",
                path.display(),
                err
            ))
        })?;

        Self::from_yaml(&source).map_err(|err| {
            PadError::Config(format!("'{}': {}", path.display(), err))
        })
    }

    /// An explicit path must exist; otherwise the per-user config file is
    /// used when present, else defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, PadError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        match default_path() {
            Some(path) if path.exists() => {
                info!("using config {}", path.display());
                Self::load(&path)
            }
            _ => {
                debug!("no config file found; using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn validate(&self) -> Result<(), PadError> {
        if self.supervisor.conflict_threshold == 0 {
            return Err(PadError::Config(
                "conflict_threshold must be at least 1".to_string(),
            ));
        }
        if self.supervisor.hook_instruction_interval == 0 {
            return Err(PadError::Config(
                "hook_instruction_interval must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String, PadError> {
        serde_yml::to_string(self)
            .map_err(|err| PadError::Config(err.to_string()))
    }
}

/// `<config dir>/Padlink/padlink.yaml`
pub fn default_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "Padlink")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}
