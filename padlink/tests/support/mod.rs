#![allow(dead_code)]

use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use padlink::supervisor::{HostEventReceiver, host_event_channel};
use padlink::{
    ExecutionMode, SessionHandle, SessionState, Supervisor, SupervisorConfig,
};

/// Wire stand-in that records everything written to it.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn bytes(&self) -> Vec<u8> {
        self.0.lock().expect("buffer lock").clone()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("buffer lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn config(mode: ExecutionMode) -> SupervisorConfig {
    SupervisorConfig {
        execution: mode,
        rpc_timeout_ms: 500,
        grace_period_ms: 1000,
        ..SupervisorConfig::default()
    }
}

pub fn supervisor(
    mode: ExecutionMode,
) -> (Supervisor, HostEventReceiver, SharedBuffer) {
    supervisor_with(config(mode))
}

pub fn supervisor_with(
    config: SupervisorConfig,
) -> (Supervisor, HostEventReceiver, SharedBuffer) {
    let (host_tx, host_rx) = host_event_channel();
    let mut supervisor = Supervisor::new(config, host_tx);
    let wire = SharedBuffer::default();
    supervisor.attach_wire(Box::new(wire.clone()));
    (supervisor, host_rx, wire)
}

/// Polls until `condition` holds or `timeout` passes.
pub fn poll_until(
    supervisor: &mut Supervisor,
    timeout: Duration,
    mut condition: impl FnMut(&Supervisor) -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        supervisor.poll(Duration::from_millis(10));
        if condition(supervisor) {
            return true;
        }
    }
    false
}

pub fn run_to_end(
    supervisor: &mut Supervisor,
    handle: SessionHandle,
) -> SessionState {
    let finished = poll_until(supervisor, Duration::from_secs(10), |s| {
        s.session_state(handle).is_some_and(SessionState::is_terminal)
    });
    assert!(finished, "{} did not finish", handle);
    supervisor
        .session_state(handle)
        .expect("session still registered")
}
