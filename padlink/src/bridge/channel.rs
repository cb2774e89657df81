//! One-directional message endpoints, implemented for std `mpsc` (thread
//! units) and `ipc-channel` (process units) so the sandbox and the supervisor
//! don't care which side of a process boundary they're on.
use std::fmt;
use std::sync::mpsc;
use std::time::Duration;

use ipc_channel::ipc::{self, IpcReceiver, IpcSender};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// The other end hung up.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinkClosed(pub String);

impl fmt::Display for LinkClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link closed: {}", self.0)
    }
}

impl std::error::Error for LinkClosed {}

pub trait MessageSink<T>: Send {
    fn send(&self, message: T) -> Result<(), LinkClosed>;
}

pub trait MessageSource<T> {
    fn try_recv(&self) -> Result<Option<T>, LinkClosed>;

    /// Waits up to `timeout`; `Ok(None)` when nothing arrived.
    fn recv_timeout(&self, timeout: Duration) -> Result<Option<T>, LinkClosed>;
}

impl<T: Send> MessageSink<T> for mpsc::Sender<T> {
    fn send(&self, message: T) -> Result<(), LinkClosed> {
        mpsc::Sender::send(self, message)
            .map_err(|_| LinkClosed("receiver dropped".to_string()))
    }
}

impl<T> MessageSource<T> for mpsc::Receiver<T> {
    fn try_recv(&self) -> Result<Option<T>, LinkClosed> {
        match mpsc::Receiver::try_recv(self) {
            Ok(message) => Ok(Some(message)),
            Err(mpsc::TryRecvError::Empty) => Ok(None),
            Err(mpsc::TryRecvError::Disconnected) => {
                Err(LinkClosed("sender dropped".to_string()))
            }
        }
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<T>, LinkClosed> {
        match mpsc::Receiver::recv_timeout(self, timeout) {
            Ok(message) => Ok(Some(message)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(LinkClosed("sender dropped".to_string()))
            }
        }
    }
}

impl<T: Serialize + Send> MessageSink<T> for IpcSender<T> {
    fn send(&self, message: T) -> Result<(), LinkClosed> {
        IpcSender::send(self, message)
            .map_err(|err| LinkClosed(err.to_string()))
    }
}

impl<T: Serialize + DeserializeOwned> MessageSource<T> for IpcReceiver<T> {
    fn try_recv(&self) -> Result<Option<T>, LinkClosed> {
        map_ipc_result(IpcReceiver::try_recv(self))
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<T>, LinkClosed> {
        map_ipc_result(IpcReceiver::try_recv_timeout(self, timeout))
    }
}

fn map_ipc_result<T>(
    result: Result<T, ipc::TryRecvError>,
) -> Result<Option<T>, LinkClosed> {
    match result {
        Ok(message) => Ok(Some(message)),
        Err(ipc::TryRecvError::Empty) => Ok(None),
        Err(ipc::TryRecvError::IpcError(err)) => {
            Err(LinkClosed(format!("{:?}", err)))
        }
    }
}
