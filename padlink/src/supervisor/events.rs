use std::sync::mpsc;
use std::sync::mpsc::{Receiver, Sender};

use serde::Serialize;

use crate::bridge::{LogLevel, RunnerMessage};
use crate::state::{Address, ButtonState};

use super::session::{SessionHandle, SessionOutcome};

/// Everything the control thread reacts to, funnelled into one queue.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlEvent {
    Received(Vec<u8>),
    Disconnected(String),
    Runner {
        session: SessionHandle,
        message: RunnerMessage,
    },
    RunnerExited {
        session: SessionHandle,
        detail: Option<String>,
    },
    Operator(OperatorCommand),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OperatorCommand {
    Start { name: String, source: String },
    Stop,
    Simulate { addr: Address, pressed: bool },
    SendRaw(Vec<u8>),
    Shutdown,
}

#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected(String),
}

/// Outward notifications for whatever front-end is attached.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
    Received {
        bytes: Vec<u8>,
    },
    Transmitted {
        bytes: Vec<u8>,
    },
    ScriptLog {
        session: SessionHandle,
        level: LogLevel,
        line: String,
    },
    Notify {
        session: SessionHandle,
        text: String,
    },
    /// The device reported that another host holds it.
    Conflict,
    /// A pad's level or pending flags changed.
    PendingUpdated {
        addr: Address,
        state: ButtonState,
    },
    ButtonsReset,
    ConnectionStatus {
        status: ConnectionStatus,
    },
    SessionStarted {
        session: SessionHandle,
        name: String,
    },
    SessionFinished {
        session: SessionHandle,
        outcome: SessionOutcome,
    },
}

impl HostEvent {
    /// One line of JSON, for machine readable front-ends.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

pub type ControlSender = Sender<ControlEvent>;
pub type ControlReceiver = Receiver<ControlEvent>;
pub type HostEventSender = Sender<HostEvent>;
pub type HostEventReceiver = Receiver<HostEvent>;

pub fn control_channel() -> (ControlSender, ControlReceiver) {
    mpsc::channel()
}

pub fn host_event_channel() -> (HostEventSender, HostEventReceiver) {
    mpsc::channel()
}
