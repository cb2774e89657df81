//! Child side of a process unit.
use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use ipc_channel::ipc::{self, IpcReceiver, IpcSender};

use crate::bridge::{HostMessage, RunnerMessage};
use crate::core::prelude::*;

/// Connects back to the host named by `server_name`, waits for the script and
/// runs it to completion. The host kills this process to terminate it.
pub fn run_child(server_name: String) -> Result<(), Box<dyn Error>> {
    let (to_parent, from_parent) = setup_ipc_connection(server_name)?;

    let spec = loop {
        match from_parent.recv() {
            Ok(HostMessage::Launch(spec)) => break *spec,
            Ok(other) => debug!("ignoring {:?} before launch", other),
            Err(err) => {
                return Err(format!("host hung up before launch: {:?}", err)
                    .into());
            }
        }
    };

    info!("running '{}'", spec.name);

    let outcome = super::run_session(
        spec,
        Box::new(from_parent),
        Box::new(to_parent),
        Arc::new(AtomicBool::new(false)),
    );

    debug!("script finished: ok={}", outcome.ok);
    Ok(())
}

type ChildLink = (IpcSender<RunnerMessage>, IpcReceiver<HostMessage>);

fn setup_ipc_connection(
    server_name: String,
) -> Result<ChildLink, ipc_channel::Error> {
    let (to_child, from_parent) = ipc::channel()?;
    let (to_parent, from_child) = ipc::channel()?;
    let bootstrap: IpcSender<super::unit::Bootstrap> =
        IpcSender::connect(server_name)?;
    bootstrap.send((to_child, from_child))?;
    Ok((to_parent, from_parent))
}
