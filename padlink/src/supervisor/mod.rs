//! Session supervisor: sole owner of the canonical button store and the wire
//! writer. Runs on the control thread and reacts to [`ControlEvent`]s.
pub mod events;
pub mod session;

use std::io::Write;
use std::time::Duration;

use crate::bridge::{HostMessage, LaunchSpec, QueryKey, RunnerMessage, rpc};
use crate::config::{ExecutionMode, SupervisorConfig};
use crate::core::logging::SCRIPT_TARGET;
use crate::core::prelude::*;
use crate::error::PadError;
use crate::sandbox::{ExecutionUnit, ProcessUnit, RunnerCommand, ThreadUnit};
use crate::state::{Address, ButtonState, ButtonStore, Edge, EdgeKind};
use crate::wire::{Command, Frame, FrameDecoder};

pub use events::{
    ConnectionStatus, ControlEvent, ControlReceiver, ControlSender,
    HostEvent, HostEventReceiver, HostEventSender, OperatorCommand,
    control_channel, host_event_channel,
};
pub use session::{
    Session, SessionHandle, SessionOutcome, SessionRegistry, SessionState,
};

pub type WireWriter = Box<dyn Write + Send>;

pub struct Supervisor {
    config: SupervisorConfig,
    store: ButtonStore,
    decoder: FrameDecoder,
    sessions: SessionRegistry,
    wire: Option<WireWriter>,
    runner: Option<RunnerCommand>,
    control_tx: ControlSender,
    control_rx: ControlReceiver,
    host_tx: HostEventSender,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, host_tx: HostEventSender) -> Self {
        let (control_tx, control_rx) = control_channel();
        let decoder =
            FrameDecoder::new(config.trailing_byte, config.conflict_threshold);

        Self {
            config,
            store: ButtonStore::new(),
            decoder,
            sessions: SessionRegistry::default(),
            wire: None,
            runner: None,
            control_tx,
            control_rx,
            host_tx,
        }
    }

    /// Handle for producers (wire reader, execution units, operator input).
    pub fn control_sender(&self) -> ControlSender {
        self.control_tx.clone()
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn store(&self) -> &ButtonStore {
        &self.store
    }

    /// Overrides the runner executable used in process mode.
    pub fn set_runner(&mut self, runner: RunnerCommand) {
        self.runner = Some(runner);
    }

    pub fn attach_wire(&mut self, writer: WireWriter) {
        self.wire = Some(writer);
        self.decoder.reset();
        self.emit(HostEvent::ConnectionStatus {
            status: ConnectionStatus::Connected,
        });
    }

    pub fn is_connected(&self) -> bool {
        self.wire.is_some()
    }

    pub fn active_session(&self) -> Option<SessionHandle> {
        self.sessions.active_handle()
    }

    pub fn session_state(&self, handle: SessionHandle) -> Option<SessionState> {
        self.sessions.get(handle).map(Session::state)
    }

    pub fn session_outcome(
        &self,
        handle: SessionHandle,
    ) -> Option<&SessionOutcome> {
        self.sessions.get(handle).and_then(Session::outcome)
    }

    /// Starts `source` in a fresh session. Rejected while another session is
    /// active.
    pub fn start(
        &mut self,
        name: &str,
        source: &str,
    ) -> Result<SessionHandle, PadError> {
        if let Some(active) = self.sessions.active_handle() {
            return Err(PadError::AlreadyRunning(active));
        }

        self.store.clear_pending();
        for addr in self.store.addresses().collect::<Vec<_>>() {
            self.emit_state(addr);
        }

        let spec = LaunchSpec {
            name: name.to_string(),
            source: source.to_string(),
            snapshot: self.store.snapshot(),
            rpc_timeout_ms: self.config.rpc_timeout_ms,
            memory_limit_bytes: self.config.memory_limit_bytes,
            hook_instruction_interval: self.config.hook_instruction_interval,
        };

        let handle = self.sessions.create(name).handle();
        let unit = match self.spawn_unit(handle, spec) {
            Ok(unit) => unit,
            Err(err) => {
                error!("{}: {}", handle, err);
                self.sessions.remove(handle);
                return Err(err);
            }
        };

        if let Some(session) = self.sessions.get_mut(handle) {
            session.run_on(unit);
        }

        info!("{} started ({}, {})", handle, name, self.config.execution);
        self.emit(HostEvent::SessionStarted {
            session: handle,
            name: name.to_string(),
        });

        Ok(handle)
    }

    fn spawn_unit(
        &mut self,
        handle: SessionHandle,
        spec: LaunchSpec,
    ) -> Result<Box<dyn ExecutionUnit>, PadError> {
        let control_tx = self.control_tx.clone();
        match self.config.execution {
            ExecutionMode::Thread => {
                Ok(Box::new(ThreadUnit::spawn(handle, spec, control_tx)?))
            }
            ExecutionMode::Process => {
                if self.runner.is_none() {
                    self.runner = Some(RunnerCommand::locate(&self.config)?);
                }
                let runner = self
                    .runner
                    .as_ref()
                    .ok_or_else(|| PadError::Launch("no runner".to_string()))?;
                Ok(Box::new(ProcessUnit::spawn(
                    handle, spec, control_tx, runner,
                )?))
            }
        }
    }

    /// Terminates `handle` and resets the store. Safe to call again on a
    /// session that already ended.
    pub fn stop(&mut self, handle: SessionHandle) -> Result<(), PadError> {
        let session = self
            .sessions
            .get(handle)
            .ok_or(PadError::UnknownSession(handle))?;

        if session.state().is_terminal() {
            debug!("{} already {}", handle, session.state());
            return Ok(());
        }

        self.terminate(handle, "stopped by operator");
        self.reset_store();
        Ok(())
    }

    /// Stops whatever is running; returns the handle that was stopped.
    pub fn stop_active(&mut self) -> Option<SessionHandle> {
        let handle = self.sessions.active_handle()?;
        if let Err(err) = self.stop(handle) {
            warn!("failed to stop {}: {}", handle, err);
        }
        Some(handle)
    }

    fn terminate(&mut self, handle: SessionHandle, reason: &str) {
        let grace = millis(self.config.grace_period_ms);
        let Some(session) = self.sessions.get_mut(handle) else {
            return;
        };

        let confirmed = session
            .unit_mut()
            .map(|unit| unit.terminate(grace))
            .unwrap_or(true);
        if !confirmed {
            warn!("{} not confirmed halted within {:?}", handle, grace);
        }

        let outcome = SessionOutcome {
            state: SessionState::Terminated,
            result: None,
            error: Some(reason.to_string()),
            elapsed_ms: session.elapsed_ms(),
            halt_confirmed: Some(confirmed),
        };
        if let Some(outcome) = session.finish(SessionState::Terminated, outcome)
        {
            info!("{} terminated: {}", handle, reason);
            self.emit(HostEvent::SessionFinished {
                session: handle,
                outcome,
            });
        }
    }

    fn reset_store(&mut self) {
        self.store.reset_all();
        self.emit(HostEvent::ButtonsReset);
    }

    /// Raw bytes from the wire.
    pub fn on_receive(&mut self, bytes: &[u8]) {
        trace!("rx {}", hex_string(bytes));
        self.emit(HostEvent::Received {
            bytes: bytes.to_vec(),
        });

        for frame in self.decoder.decode(bytes) {
            match frame {
                Frame::Signal { addr, pressed } => {
                    self.apply_signal(addr, pressed);
                }
                Frame::Conflict => {
                    warn!("device reports it is in use elsewhere");
                    self.emit(HostEvent::Conflict);
                }
                Frame::Truncated { addr } => {
                    let err = PadError::MalformedFrame(format!(
                        "dropped dangling address byte {:#04x}",
                        addr
                    ));
                    debug!("{}", err);
                }
            }
        }
    }

    /// Injects a signal as if it had arrived on the wire.
    pub fn simulate(&mut self, addr: Address, pressed: bool) {
        debug!("simulated signal {} -> {}", addr, pressed);
        self.apply_signal(addr, pressed);
    }

    fn apply_signal(&mut self, addr: Address, pressed: bool) {
        let edge = self.store.apply(addr, pressed);
        if edge == Edge::None {
            return;
        }
        trace!("pad {} {:?}", addr, edge);
        self.emit_state(addr);
        self.push_record(addr);
    }

    /// Sends the canonical record for `addr` to the active session.
    fn push_record(&mut self, addr: Address) {
        let record = self.store.record(addr);
        let Some(session) = self.sessions.active() else {
            return;
        };
        if let Some(unit) = session.unit() {
            if let Err(err) = unit.send(HostMessage::Push { addr, record }) {
                debug!("{}: push dropped: {}", session.handle(), err);
            }
        }
    }

    /// The wire went away: terminate the session and forget every pad.
    pub fn on_disconnect(&mut self, reason: &str) {
        let err = PadError::ConnectionLost(reason.to_string());
        error!("{}", err);

        self.wire = None;
        self.decoder.reset();

        if let Some(handle) = self.sessions.active_handle() {
            self.terminate(handle, &err.to_string());
        }
        self.reset_store();

        self.emit(HostEvent::ConnectionStatus {
            status: ConnectionStatus::Disconnected(reason.to_string()),
        });
    }

    /// Writes operator supplied bytes straight to the wire.
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<(), PadError> {
        self.write_wire(bytes)
    }

    fn write_wire(&mut self, bytes: &[u8]) -> Result<(), PadError> {
        let wire = self.wire.as_mut().ok_or(PadError::NotConnected)?;
        let result = wire.write_all(bytes).and_then(|_| wire.flush());

        match result {
            Ok(()) => {
                trace!("tx {}", hex_string(bytes));
                self.emit(HostEvent::Transmitted {
                    bytes: bytes.to_vec(),
                });
                Ok(())
            }
            Err(err) => {
                self.on_disconnect(&err.to_string());
                Err(PadError::ConnectionLost(err.to_string()))
            }
        }
    }

    /// Waits up to `timeout` for control events and handles every one that
    /// is ready. Returns false once a shutdown was requested.
    pub fn poll(&mut self, timeout: Duration) -> bool {
        let Ok(event) = self.control_rx.recv_timeout(timeout) else {
            return true;
        };

        let mut running = self.handle_event(event);
        while running {
            match self.control_rx.try_recv() {
                Ok(event) => running = self.handle_event(event),
                Err(_) => break,
            }
        }
        running
    }

    pub fn handle_event(&mut self, event: ControlEvent) -> bool {
        match event {
            ControlEvent::Received(bytes) => self.on_receive(&bytes),
            ControlEvent::Disconnected(reason) => self.on_disconnect(&reason),
            ControlEvent::Runner { session, message } => {
                self.on_runner(session, message);
            }
            ControlEvent::RunnerExited { session, detail } => {
                self.on_runner_exited(session, detail);
            }
            ControlEvent::Operator(command) => {
                return self.on_operator(command);
            }
        }
        true
    }

    fn on_operator(&mut self, command: OperatorCommand) -> bool {
        match command {
            OperatorCommand::Start { name, source } => {
                if let Err(err) = self.start(&name, &source) {
                    warn!("start rejected: {}", err);
                }
            }
            OperatorCommand::Stop => {
                if self.stop_active().is_none() {
                    info!("no session running");
                }
            }
            OperatorCommand::Simulate { addr, pressed } => {
                self.simulate(addr, pressed);
            }
            OperatorCommand::SendRaw(bytes) => {
                if let Err(err) = self.send_raw(&bytes) {
                    warn!("send failed: {}", err);
                }
            }
            OperatorCommand::Shutdown => {
                self.stop_active();
                return false;
            }
        }
        true
    }

    fn is_running(&self, handle: SessionHandle) -> bool {
        self.sessions
            .get(handle)
            .is_some_and(|s| s.state() == SessionState::Running)
    }

    fn on_runner(&mut self, session: SessionHandle, message: RunnerMessage) {
        if !self.is_running(session) {
            trace!("ignoring {:?} from finished {}", message, session);
            return;
        }

        match message {
            RunnerMessage::Ready => debug!("{} runner ready", session),
            RunnerMessage::Log { level, line } => {
                log::log!(
                    target: SCRIPT_TARGET,
                    level.to_log_level(),
                    "[{}] {}",
                    session,
                    line
                );
                self.emit(HostEvent::ScriptLog {
                    session,
                    level,
                    line,
                });
            }
            RunnerMessage::Notify(text) => {
                info!("{}: {}", session, text);
                self.emit(HostEvent::Notify { session, text });
            }
            RunnerMessage::Emit(command) => self.on_emit(session, command),
            RunnerMessage::Query { id, key, addr } => {
                self.on_query(session, id, key, addr);
            }
            RunnerMessage::Consumed { addr, kind, upto } => {
                if self.store.acknowledge(addr, kind, upto) {
                    self.emit_state(addr);
                }
            }
            RunnerMessage::Done(outcome) => {
                let next = ternary!(
                    outcome.ok,
                    SessionState::Completed,
                    SessionState::Failed
                );
                if let Some(error) = &outcome.error {
                    warn!("{}", PadError::ScriptFault(error.clone()));
                }
                self.finish(
                    session,
                    next,
                    SessionOutcome {
                        state: next,
                        result: outcome.result,
                        error: outcome.error,
                        elapsed_ms: outcome.elapsed_ms,
                        halt_confirmed: None,
                    },
                );
            }
        }
    }

    fn on_emit(&mut self, session: SessionHandle, command: Command) {
        let bytes = match command.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("{}: dropping invalid command: {}", session, err);
                return;
            }
        };

        if !self.is_connected() {
            trace!("not connected; dropping {}", hex_string(&bytes));
            return;
        }

        if let Err(err) = self.write_wire(&bytes) {
            debug!("{}: write failed: {}", session, err);
        }
    }

    /// Answers a round-trip query. The current record is pushed ahead of the
    /// reply so the session cache agrees when the script resumes; a
    /// consuming query is settled by the session's `Consumed` message.
    fn on_query(
        &mut self,
        session: SessionHandle,
        id: u64,
        key: QueryKey,
        addr: Address,
    ) {
        let value = rpc::answer(&self.store, key, addr);
        self.push_record(addr);

        let Some(unit) = self.sessions.get(session).and_then(Session::unit)
        else {
            return;
        };
        if let Err(err) = unit.send(HostMessage::Reply { id, value }) {
            debug!("{}: reply {} dropped: {}", session, id, err);
        }
    }

    fn on_runner_exited(
        &mut self,
        session: SessionHandle,
        detail: Option<String>,
    ) {
        if !self.is_running(session) {
            return;
        }

        let error = format!(
            "runner exited unexpectedly{}",
            detail.map(|d| format!(": {}", d)).unwrap_or_default()
        );
        warn!("{}", PadError::ScriptFault(error.clone()));
        self.finish(
            session,
            SessionState::Failed,
            SessionOutcome {
                state: SessionState::Failed,
                result: None,
                error: Some(error),
                elapsed_ms: 0,
                halt_confirmed: None,
            },
        );
    }

    fn finish(
        &mut self,
        handle: SessionHandle,
        next: SessionState,
        outcome: SessionOutcome,
    ) {
        let Some(session) = self.sessions.get_mut(handle) else {
            return;
        };
        if let Some(outcome) = session.finish(next, outcome) {
            info!("{} {}", handle, next);
            self.emit(HostEvent::SessionFinished {
                session: handle,
                outcome,
            });
        }
    }

    pub fn button_state(&self, addr: Address) -> ButtonState {
        self.store.state(addr)
    }

    /// Consumes a flag on the operator's behalf, outside any session.
    pub fn consume(&mut self, addr: Address, kind: EdgeKind) -> bool {
        let consumed = self.store.consume(addr, kind);
        if consumed {
            self.emit_state(addr);
            self.push_record(addr);
        }
        consumed
    }

    fn emit_state(&self, addr: Address) {
        self.emit(HostEvent::PendingUpdated {
            addr,
            state: self.store.state(addr),
        });
    }

    fn emit(&self, event: HostEvent) {
        if self.host_tx.send(event).is_err() {
            trace!("no host event listener");
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Some(handle) = self.sessions.active_handle() {
            self.terminate(handle, "supervisor shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::wire::encode_set_one;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn supervisor() -> (Supervisor, HostEventReceiver, SharedBuffer) {
        let config = SupervisorConfig {
            execution: ExecutionMode::Thread,
            rpc_timeout_ms: 200,
            ..SupervisorConfig::default()
        };
        let (host_tx, host_rx) = host_event_channel();
        let mut supervisor = Supervisor::new(config, host_tx);
        let wire = SharedBuffer::default();
        supervisor.attach_wire(Box::new(wire.clone()));
        (supervisor, host_rx, wire)
    }

    fn run_until_finished(
        supervisor: &mut Supervisor,
        handle: SessionHandle,
    ) -> SessionState {
        for _ in 0..500 {
            supervisor.poll(millis(10));
            if let Some(state) = supervisor.session_state(handle) {
                if state.is_terminal() {
                    return state;
                }
            }
        }
        panic!("session did not finish");
    }

    #[test]
    fn receive_updates_store_and_reports_conflict_once() {
        let (mut supervisor, host_rx, _) = supervisor();
        supervisor.on_receive(&[1, 1, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);

        assert!(supervisor.store().peek_pressed(1));
        let conflicts = host_rx
            .try_iter()
            .filter(|e| *e == HostEvent::Conflict)
            .count();
        assert_eq!(conflicts, 1);
    }

    #[test]
    fn emitted_color_reaches_the_wire() {
        let (mut supervisor, _, wire) = supervisor();
        let handle = supervisor
            .start("color", "set_color(3, {10, 20, 30})")
            .unwrap();
        assert_eq!(
            run_until_finished(&mut supervisor, handle),
            SessionState::Completed
        );
        assert_eq!(
            *wire.0.lock().unwrap(),
            encode_set_one(3, crate::wire::Color::new(10, 20, 30)).to_vec()
        );
    }

    #[test]
    fn second_start_is_rejected_while_active() {
        let (mut supervisor, _, _) = supervisor();
        let first = supervisor.start("spin", "while true do end").unwrap();

        match supervisor.start("other", "return 1") {
            Err(PadError::AlreadyRunning(active)) => assert_eq!(active, first),
            other => panic!("expected AlreadyRunning, got {:?}", other),
        }
        assert_eq!(
            supervisor.session_state(first),
            Some(SessionState::Running)
        );

        supervisor.stop(first).unwrap();
        assert_eq!(
            supervisor.session_state(first),
            Some(SessionState::Terminated)
        );
    }

    #[test]
    fn stop_is_idempotent_and_resets_store() {
        let (mut supervisor, _, _) = supervisor();
        supervisor.simulate(4, true);
        let handle = supervisor.start("spin", "while true do end").unwrap();

        supervisor.stop(handle).unwrap();
        supervisor.stop(handle).unwrap();
        assert_eq!(supervisor.button_state(4), ButtonState::default());
        assert!(matches!(
            supervisor.stop(SessionHandle(99)),
            Err(PadError::UnknownSession(_))
        ));
    }

    #[test]
    fn script_fault_fails_without_reset() {
        let (mut supervisor, _, _) = supervisor();
        supervisor.simulate(2, true);
        let handle = supervisor.start("fault", "error('nope')").unwrap();

        assert_eq!(
            run_until_finished(&mut supervisor, handle),
            SessionState::Failed
        );
        assert!(supervisor.store().peek_pressed(2));
        let outcome = supervisor.session_outcome(handle).unwrap();
        assert!(outcome.error.as_deref().unwrap().contains("nope"));
    }

    #[test]
    fn disconnect_terminates_and_resets() {
        let (mut supervisor, host_rx, _) = supervisor();
        let handle = supervisor.start("spin", "while true do end").unwrap();
        supervisor.on_receive(&[1, 1, 2, 1, 2, 0]);

        supervisor.handle_event(ControlEvent::Disconnected("eof".to_string()));

        assert_eq!(
            supervisor.session_state(handle),
            Some(SessionState::Terminated)
        );
        for addr in [1, 2] {
            assert_eq!(supervisor.button_state(addr), ButtonState::default());
        }
        assert!(!supervisor.is_connected());
        assert!(host_rx.try_iter().any(|e| e == HostEvent::ButtonsReset));
    }

    #[test]
    fn start_clears_pending_but_keeps_level() {
        let (mut supervisor, _, _) = supervisor();
        supervisor.simulate(6, true);
        let handle = supervisor
            .start(
                "probe",
                "return tostring(peek_pressed(6)) .. ' ' \
                 .. tostring(consume_pending_pressed(6))",
            )
            .unwrap();
        run_until_finished(&mut supervisor, handle);
        let outcome = supervisor.session_outcome(handle).unwrap();
        assert_eq!(outcome.result.as_deref(), Some("true false"));
    }

    #[test]
    fn send_raw_requires_a_wire() {
        let (host_tx, _host_rx) = host_event_channel();
        let mut supervisor =
            Supervisor::new(SupervisorConfig::default(), host_tx);
        assert!(matches!(
            supervisor.send_raw(&[1, 2]),
            Err(PadError::NotConnected)
        ));
    }
}
