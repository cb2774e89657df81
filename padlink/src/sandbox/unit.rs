//! Preemptible execution units a session's script runs on.
use std::env;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ipc_channel::ipc::{self, IpcOneShotServer, IpcReceiver, IpcSender};

use crate::bridge::{
    HostMessage, LaunchSpec, LinkClosed, MessageSink, RunnerMessage,
};
use crate::config::SupervisorConfig;
use crate::core::prelude::*;
use crate::error::PadError;
use crate::supervisor::{ControlEvent, ControlSender, SessionHandle};

/// Environment variable naming the runner executable.
pub const RUNNER_ENV: &str = "PADLINK_RUNNER";
pub const RUNNER_BIN: &str = "padlink-runner";

/// How long the host waits for a freshly spawned runner to connect back.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const EXIT_POLL: Duration = Duration::from_millis(5);

pub type Bootstrap = (IpcSender<HostMessage>, IpcReceiver<RunnerMessage>);

pub trait ExecutionUnit: Send {
    /// Queues a message for the script side, in order.
    fn send(&self, message: HostMessage) -> Result<(), LinkClosed>;

    /// Stops the script abruptly. Returns true when the unit was confirmed
    /// halted within `grace`.
    fn terminate(&mut self, grace: Duration) -> bool;

    fn is_finished(&mut self) -> bool;
}

/// Forwards a thread unit's messages into the supervisor queue, tagged with
/// the session they came from.
struct SessionOutbox {
    session: SessionHandle,
    control_tx: ControlSender,
}

impl MessageSink<RunnerMessage> for SessionOutbox {
    fn send(&self, message: RunnerMessage) -> Result<(), LinkClosed> {
        self.control_tx
            .send(ControlEvent::Runner {
                session: self.session,
                message,
            })
            .map_err(|_| LinkClosed("supervisor stopped".to_string()))
    }
}

pub struct ThreadUnit {
    to_script: mpsc::Sender<HostMessage>,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ThreadUnit {
    pub fn spawn(
        session: SessionHandle,
        spec: LaunchSpec,
        control_tx: ControlSender,
    ) -> Result<Self, PadError> {
        let (to_script, from_host) = mpsc::channel();
        let cancel = Arc::new(AtomicBool::new(false));

        let handle = {
            let cancel = cancel.clone();
            thread::Builder::new()
                .name(format!("padlink-session-{}", session.0))
                .spawn(move || {
                    let outbox = SessionOutbox {
                        session,
                        control_tx: control_tx.clone(),
                    };
                    super::run_session(
                        spec,
                        Box::new(from_host),
                        Box::new(outbox),
                        cancel,
                    );
                    let _ = control_tx.send(ControlEvent::RunnerExited {
                        session,
                        detail: None,
                    });
                })?
        };

        Ok(Self {
            to_script,
            cancel,
            handle: Some(handle),
        })
    }
}

impl ExecutionUnit for ThreadUnit {
    fn send(&self, message: HostMessage) -> Result<(), LinkClosed> {
        MessageSink::send(&self.to_script, message)
    }

    fn terminate(&mut self, grace: Duration) -> bool {
        self.cancel.store(true, Ordering::Relaxed);

        let deadline = Instant::now() + grace;
        while !self.is_finished() {
            if Instant::now() >= deadline {
                warn!("session thread still running after {:?}", grace);
                return false;
            }
            thread::sleep(EXIT_POLL);
        }

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        true
    }

    fn is_finished(&mut self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for ThreadUnit {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if self.is_finished() {
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

/// Program and leading arguments used to start a runner child. The IPC
/// server name is appended last.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunnerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl RunnerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    /// `runner_path` from config, then `$PADLINK_RUNNER`, then a
    /// `padlink-runner` next to the current executable.
    pub fn locate(config: &SupervisorConfig) -> Result<Self, PadError> {
        if let Some(path) = &config.runner_path {
            return Ok(Self {
                program: path.clone(),
                args: config.runner_args.clone(),
            });
        }

        if let Some(path) = env::var_os(RUNNER_ENV) {
            return Ok(Self::new(path));
        }

        let exe = env::current_exe()?;
        let sibling = exe.with_file_name(format!(
            "{}{}",
            RUNNER_BIN,
            env::consts::EXE_SUFFIX
        ));
        if sibling.exists() {
            Ok(Self::new(sibling))
        } else {
            Err(PadError::Launch(format!(
                "no {} found (set {} or runner_path)",
                RUNNER_BIN, RUNNER_ENV
            )))
        }
    }
}

/// A runner child. Messages for it go through an unbounded queue drained by
/// an outbound thread, so a script that never reads its inbox can fill the
/// socket without ever blocking the supervisor.
pub struct ProcessUnit {
    child: Child,
    outbox: Option<mpsc::Sender<HostMessage>>,
    outbound_handle: Option<JoinHandle<()>>,
    inbound_handle: Option<JoinHandle<()>>,
}

impl ProcessUnit {
    pub fn spawn(
        session: SessionHandle,
        spec: LaunchSpec,
        control_tx: ControlSender,
        runner: &RunnerCommand,
    ) -> Result<Self, PadError> {
        let (server, server_name) = IpcOneShotServer::<Bootstrap>::new()
            .map_err(|err| {
                PadError::Launch(format!(
                    "failed to create IPC bootstrap: {}",
                    err
                ))
            })?;

        let mut child = spawn_runner_process(runner, &server_name)?;

        relay_runner_output(&mut child);

        let bootstrap =
            accept_bootstrap(server, &server_name, CONNECT_TIMEOUT);
        let (to_child, from_child) = match bootstrap {
            Ok(bootstrap) => bootstrap,
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(err);
            }
        };

        debug!("runner process {} connected for {}", child.id(), session);

        if let Err(err) = to_child.send(HostMessage::Launch(Box::new(spec))) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(PadError::Launch(format!(
                "failed to send script to runner: {}",
                err
            )));
        }

        let (outbox, queued) = mpsc::channel::<HostMessage>();
        let outbound_handle = thread::spawn(move || {
            while let Ok(message) = queued.recv() {
                if let Err(err) = to_child.send(message) {
                    debug!("{}: runner stopped reading: {}", session, err);
                    break;
                }
            }
        });

        let inbound_handle = thread::spawn(move || {
            let detail = loop {
                match from_child.recv() {
                    Ok(message) => {
                        trace!("received runner message: {:?}", message);
                        let event = ControlEvent::Runner { session, message };
                        if control_tx.send(event).is_err() {
                            break None;
                        }
                    }
                    Err(err) => break Some(format!("{:?}", err)),
                }
            };
            let _ = control_tx
                .send(ControlEvent::RunnerExited { session, detail });
        });

        Ok(Self {
            child,
            outbox: Some(outbox),
            outbound_handle: Some(outbound_handle),
            inbound_handle: Some(inbound_handle),
        })
    }
}

impl ExecutionUnit for ProcessUnit {
    fn send(&self, message: HostMessage) -> Result<(), LinkClosed> {
        match &self.outbox {
            Some(outbox) => MessageSink::send(outbox, message),
            None => Err(LinkClosed("runner terminated".to_string())),
        }
    }

    fn terminate(&mut self, grace: Duration) -> bool {
        self.outbox = None;
        if let Err(err) = self.child.kill() {
            debug!("kill runner {}: {}", self.child.id(), err);
        }

        let deadline = Instant::now() + grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!("runner {} exited: {}", self.child.id(), status);
                    return true;
                }
                Ok(None) if Instant::now() < deadline => {
                    thread::sleep(EXIT_POLL);
                }
                Ok(None) => {
                    warn!(
                        "runner {} still alive after {:?}",
                        self.child.id(),
                        grace
                    );
                    return false;
                }
                Err(err) => {
                    warn!("failed to wait on runner: {}", err);
                    return false;
                }
            }
        }
    }

    fn is_finished(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }
}

impl Drop for ProcessUnit {
    fn drop(&mut self) {
        debug!("shutting down runner {}", self.child.id());

        self.outbox = None;
        let _ = self.child.kill();
        let _ = self.child.wait();

        // a send blocked on the dead child's socket fails once it is reaped
        if let Some(handle) = self.outbound_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.inbound_handle.take() {
            let _ = handle.join();
        }
    }
}

fn spawn_runner_process(
    runner: &RunnerCommand,
    server_name: &str,
) -> Result<Child, PadError> {
    let mut command = Command::new(&runner.program);

    command
        .args(&runner.args)
        .arg(server_name)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    command.spawn().map_err(|err| {
        PadError::Launch(format!(
            "failed to launch '{}': {}",
            runner.program.display(),
            err
        ))
    })
}

/// `IpcOneShotServer::accept` blocks until the child connects, so it runs on
/// its own thread. If the child never shows up the accept is released with a
/// throwaway bootstrap and the thread joined.
fn accept_bootstrap(
    server: IpcOneShotServer<Bootstrap>,
    server_name: &str,
    timeout: Duration,
) -> Result<Bootstrap, PadError> {
    let (tx, rx) = mpsc::channel();

    let handle = thread::spawn(move || {
        let result = server
            .accept()
            .map(|(_, bootstrap)| bootstrap)
            .map_err(|err| {
                format!("failed to accept runner bootstrap: {}", err)
            });
        let _ = tx.send(result);
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            let _ = handle.join();
            result.map_err(PadError::Launch)
        }
        Err(_) => {
            match release_bootstrap(server_name) {
                Ok(()) => {
                    let _ = handle.join();
                }
                Err(err) => debug!("could not release bootstrap: {}", err),
            }
            Err(PadError::Launch(format!(
                "runner did not connect within {:?}",
                timeout
            )))
        }
    }
}

fn release_bootstrap(server_name: &str) -> Result<(), String> {
    let (to_runner, _) =
        ipc::channel::<HostMessage>().map_err(|err| err.to_string())?;
    let (_, from_runner) =
        ipc::channel::<RunnerMessage>().map_err(|err| err.to_string())?;
    let sender = IpcSender::<Bootstrap>::connect(server_name.to_string())
        .map_err(|err| err.to_string())?;
    sender
        .send((to_runner, from_runner))
        .map_err(|err| err.to_string())
}

/// Runner output arrives line by line and is echoed with a `[runner]` prefix
/// so script-host panics and logger output land next to the supervisor's.
fn relay_runner_output(child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines().map_while(Result::ok) {
                println!("[runner] {}", line);
            }
        });
    }

    if let Some(stderr) = child.stderr.take() {
        thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines().map_while(Result::ok) {
                eprintln!("[runner] {}", line);
            }
        });
    }
}
