use std::io;

use thiserror::Error;

use crate::state::Address;
use crate::supervisor::SessionHandle;

#[derive(Debug, Error)]
pub enum PadError {
    /// The wire closed or broke. The active session is terminated and the
    /// store is reset.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("a script is already running ({0})")]
    AlreadyRunning(SessionHandle),

    #[error("script fault: {0}")]
    ScriptFault(String),

    #[error("request {id} unanswered after {waited_ms} ms")]
    Timeout { id: u64, waited_ms: u64 },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("address {0} is already bound to another pad")]
    AddressConflict(Address),

    #[error("unknown session {0}")]
    UnknownSession(SessionHandle),

    #[error("not connected")]
    NotConnected,

    #[error("failed to launch script runner: {0}")]
    Launch(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("invalid config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Rejections raised while encoding host → device commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CodecError {
    #[error("range declares {declared} colors but carries {actual}")]
    CountMismatch { declared: usize, actual: usize },

    #[error("range must contain at least one color")]
    EmptyRange,

    #[error("range of {0} colors exceeds the 255 color frame limit")]
    RangeTooLong(usize),

    #[error("truncated command at byte {offset}: {detail}")]
    Truncated { offset: usize, detail: String },
}
