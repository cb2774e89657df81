//! Messages crossing the isolation boundary between the supervisor and a
//! script runner. Everything here is serde so the same types travel over an
//! in-process channel or an `ipc-channel` pair.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::state::{Address, ButtonRecord, EdgeKind};
use crate::wire::Command;

pub type RequestId = u64;

/// Round-trip queries a script can make against the canonical store.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, Hash, PartialEq)]
pub enum QueryKey {
    Pressed,
    ConsumePendingPressed,
    ConsumePendingUnpressed,
}

impl QueryKey {
    /// Value a request resolves to when the supervisor never answers.
    pub fn default_reply(self) -> bool {
        false
    }

    /// The edge a consuming query takes once its reply is delivered.
    pub fn consumes(self) -> Option<EdgeKind> {
        match self {
            QueryKey::Pressed => None,
            QueryKey::ConsumePendingPressed => Some(EdgeKind::Rise),
            QueryKey::ConsumePendingUnpressed => Some(EdgeKind::Fall),
        }
    }
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, Hash, PartialEq,
)]
pub enum LogLevel {
    #[default]
    Log,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Log => "log",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn to_log_level(self) -> log::Level {
        match self {
            LogLevel::Log | LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "log" => Ok(LogLevel::Log),
            "debug" | "trace" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Everything a runner needs before the first line of script runs.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct LaunchSpec {
    pub name: String,
    pub source: String,
    pub snapshot: Vec<(Address, ButtonRecord)>,
    pub rpc_timeout_ms: u64,
    pub memory_limit_bytes: usize,
    pub hook_instruction_interval: u32,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
pub struct ScriptOutcome {
    pub ok: bool,
    pub result: Option<String>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

/// Supervisor → runner.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub enum HostMessage {
    Launch(Box<LaunchSpec>),
    Push {
        addr: Address,
        record: ButtonRecord,
    },
    Reply {
        id: RequestId,
        value: bool,
    },
}

/// Runner → supervisor.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub enum RunnerMessage {
    Ready,
    Log {
        level: LogLevel,
        line: String,
    },
    Notify(String),
    Emit(Command),
    Query {
        id: RequestId,
        key: QueryKey,
        addr: Address,
    },
    /// A pending flag consumed from the session cache.
    Consumed {
        addr: Address,
        kind: EdgeKind,
        upto: u64,
    },
    Done(ScriptOutcome),
}
