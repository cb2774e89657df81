//! The sandbox end of a session link: the local button cache, the pending
//! request table and the two message endpoints.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::bridge::{
    HostMessage, LaunchSpec, LinkClosed, LogLevel, MessageSink, MessageSource,
    QueryKey, Resolution, RpcClient, RunnerMessage, ScriptOutcome,
};
use crate::core::prelude::*;
use crate::error::{CodecError, PadError};
use crate::state::{Address, ButtonCache, EdgeKind};
use crate::wire::{Color, Command};

use super::capabilities::{Capabilities, Interrupt};

/// Upper bound on how long a suspended call waits before rechecking the
/// cancel flag.
const WAIT_SLICE: Duration = Duration::from_millis(10);

pub type Inbox = Box<dyn MessageSource<HostMessage>>;
pub type Outbox = Box<dyn MessageSink<RunnerMessage>>;

pub struct SandboxPort {
    cache: ButtonCache,
    rpc: RpcClient,
    inbox: Inbox,
    outbox: Outbox,
    cancel: Arc<AtomicBool>,
    closed: bool,
    started: Instant,
}

impl SandboxPort {
    pub fn new(
        spec: &LaunchSpec,
        inbox: Inbox,
        outbox: Outbox,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        let mut cache = ButtonCache::new();
        cache.merge_all(&spec.snapshot);

        Self {
            cache,
            rpc: RpcClient::new(millis(spec.rpc_timeout_ms)),
            inbox,
            outbox,
            cancel,
            closed: false,
            started: Instant::now(),
        }
    }

    /// True once termination was requested or the supervisor went away.
    pub fn is_halted(&self) -> bool {
        self.closed || self.cancel.load(Ordering::Relaxed)
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn cache(&self) -> &ButtonCache {
        &self.cache
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn send(&mut self, message: RunnerMessage) {
        if self.closed {
            return;
        }
        if let Err(err) = self.outbox.send(message) {
            debug!("supervisor unreachable: {}", err);
            self.closed = true;
        }
    }

    pub fn finish(&mut self, outcome: ScriptOutcome) {
        self.rpc.abandon_all();
        self.send(RunnerMessage::Done(outcome));
    }

    /// Applies everything already queued without waiting.
    pub fn drain(&mut self) {
        while !self.closed {
            match self.inbox.try_recv() {
                Ok(Some(message)) => self.handle(message),
                Ok(None) => break,
                Err(err) => self.close(err),
            }
        }
    }

    fn wait_for_message(&mut self, timeout: Duration) -> Result<(), Interrupt> {
        self.check_halt()?;
        match self.inbox.recv_timeout(timeout.min(WAIT_SLICE)) {
            Ok(Some(message)) => {
                self.handle(message);
                self.drain();
            }
            Ok(None) => {}
            Err(err) => {
                self.close(err.clone());
                return Err(Interrupt::Link(err));
            }
        }
        self.check_halt()
    }

    fn handle(&mut self, message: HostMessage) {
        match message {
            HostMessage::Push { addr, record } => {
                self.cache.merge(addr, &record);
            }
            HostMessage::Reply { id, value } => {
                self.rpc.resolve(id, value);
            }
            HostMessage::Launch(_) => {
                warn!("ignoring launch request for a running session");
            }
        }
    }

    fn close(&mut self, err: LinkClosed) {
        debug!("session link closed: {}", err);
        self.closed = true;
    }

    fn check_halt(&self) -> Result<(), Interrupt> {
        ternary!(self.is_halted(), Err(Interrupt::Terminated), Ok(()))
    }

    fn consume(&mut self, addr: Address, kind: EdgeKind) -> bool {
        self.drain();
        match self.cache.consume(addr, kind) {
            Some(upto) => {
                self.send(RunnerMessage::Consumed { addr, kind, upto });
                true
            }
            None => false,
        }
    }
}

impl Capabilities for SandboxPort {
    fn peek_pressed(&mut self, addr: Address) -> bool {
        self.drain();
        self.cache.peek_pressed(addr)
    }

    fn consume_pending_pressed(&mut self, addr: Address) -> bool {
        self.consume(addr, EdgeKind::Rise)
    }

    fn consume_pending_unpressed(&mut self, addr: Address) -> bool {
        self.consume(addr, EdgeKind::Fall)
    }

    fn set_color(&mut self, addr: Address, color: Color) {
        self.send(RunnerMessage::Emit(Command::SetOne { addr, color }));
    }

    fn set_color_range(
        &mut self,
        start: Address,
        colors: Vec<Color>,
    ) -> Result<(), CodecError> {
        let command = Command::SetRange { start, colors };
        command.encode()?;
        self.send(RunnerMessage::Emit(command));
        Ok(())
    }

    fn log(&mut self, level: LogLevel, line: String) {
        self.send(RunnerMessage::Log { level, line });
    }

    fn notify_user(&mut self, text: String) {
        self.send(RunnerMessage::Notify(text));
    }

    fn now_ms(&self) -> u64 {
        as_millis(self.started.elapsed())
    }

    fn await_query(
        &mut self,
        key: QueryKey,
        addr: Address,
    ) -> Result<Resolution, Interrupt> {
        self.check_halt()?;
        let (id, message) = self.rpc.issue(key, addr);
        self.send(message);

        loop {
            if let Some(value) = self.rpc.take_resolved(id) {
                // the record was pushed ahead of the reply, so the cache
                // already holds whatever the supervisor saw
                let delivered = match key.consumes() {
                    Some(kind) => self.consume(addr, kind),
                    None => value,
                };
                return Ok(Resolution::Replied(delivered));
            }

            let Some(remaining) = self.rpc.remaining(id) else {
                let waited_ms = as_millis(self.rpc.timeout());
                let resolution = self
                    .rpc
                    .expire(id)
                    .unwrap_or(Resolution::TimedOut(key.default_reply()));
                let line = PadError::Timeout { id, waited_ms }.to_string();
                self.send(RunnerMessage::Log {
                    level: LogLevel::Warn,
                    line,
                });
                return Ok(resolution);
            };

            if let Err(interrupt) = self.wait_for_message(remaining) {
                self.rpc.abandon_all();
                return Err(interrupt);
            }
        }
    }

    fn sleep(&mut self, duration: Duration) -> Result<(), Interrupt> {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                self.drain();
                return self.check_halt();
            }
            self.wait_for_message(deadline - now)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;

    use super::*;
    use crate::state::ButtonRecord;

    fn spec(timeout_ms: u64) -> LaunchSpec {
        let mut pressed = ButtonRecord::default();
        pressed.apply_level(true);

        LaunchSpec {
            name: "test".to_string(),
            source: String::new(),
            snapshot: vec![(1, pressed)],
            rpc_timeout_ms: timeout_ms,
            memory_limit_bytes: 0,
            hook_instruction_interval: 1000,
        }
    }

    fn port(
        timeout_ms: u64,
    ) -> (
        SandboxPort,
        mpsc::Sender<HostMessage>,
        mpsc::Receiver<RunnerMessage>,
    ) {
        let (host_tx, host_rx) = mpsc::channel();
        let (runner_tx, runner_rx) = mpsc::channel();
        let port = SandboxPort::new(
            &spec(timeout_ms),
            Box::new(host_rx),
            Box::new(runner_tx),
            Arc::new(AtomicBool::new(false)),
        );
        (port, host_tx, runner_rx)
    }

    #[test]
    fn snapshot_seeds_cache() {
        let (mut port, _host, _runner) = port(100);
        assert!(port.peek_pressed(1));
        assert!(!port.peek_pressed(2));
    }

    #[test]
    fn consume_notifies_supervisor_once() {
        let (mut port, _host, runner) = port(100);
        assert!(port.consume_pending_pressed(1));
        assert!(!port.consume_pending_pressed(1));

        assert_eq!(
            runner.try_recv().unwrap(),
            RunnerMessage::Consumed {
                addr: 1,
                kind: EdgeKind::Rise,
                upto: 1
            }
        );
        assert!(runner.try_recv().is_err());
    }

    #[test]
    fn pushes_are_visible_before_next_observation() {
        let (mut port, host, _runner) = port(100);
        let mut record = ButtonRecord::default();
        record.apply_level(true);
        record.apply_level(false);
        host.send(HostMessage::Push { addr: 2, record }).unwrap();

        assert!(!port.peek_pressed(2));
        assert!(port.consume_pending_unpressed(2));
        assert!(port.consume_pending_pressed(2));
    }

    #[test]
    fn await_query_returns_reply() {
        let (mut port, host, runner) = port(1000);

        let responder = thread::spawn(move || {
            if let Ok(RunnerMessage::Query { id, .. }) = runner.recv() {
                host.send(HostMessage::Reply { id, value: true }).unwrap();
            }
        });

        let resolution = port.await_query(QueryKey::Pressed, 1).unwrap();
        assert_eq!(resolution, Resolution::Replied(true));
        responder.join().unwrap();
    }

    #[test]
    fn await_query_times_out_to_default() {
        let (mut port, _host, runner) = port(20);
        let resolution = port.await_query(QueryKey::Pressed, 1).unwrap();
        assert_eq!(resolution, Resolution::TimedOut(false));

        assert!(matches!(runner.recv(), Ok(RunnerMessage::Query { .. })));
        assert!(matches!(
            runner.recv(),
            Ok(RunnerMessage::Log {
                level: LogLevel::Warn,
                ..
            })
        ));
    }

    #[test]
    fn delivered_consume_reply_takes_the_flag() {
        let (mut port, host, runner) = port(1000);

        let responder = thread::spawn(move || {
            let mut messages = Vec::new();
            if let Ok(RunnerMessage::Query { id, .. }) = runner.recv() {
                host.send(HostMessage::Reply { id, value: true }).unwrap();
            }
            while let Ok(message) = runner.recv_timeout(millis(200)) {
                messages.push(message);
            }
            messages
        });

        let resolution = port
            .await_query(QueryKey::ConsumePendingPressed, 1)
            .unwrap();
        assert_eq!(resolution, Resolution::Replied(true));
        assert!(!port.consume_pending_pressed(1));

        let messages = responder.join().unwrap();
        assert!(messages.contains(&RunnerMessage::Consumed {
            addr: 1,
            kind: EdgeKind::Rise,
            upto: 1,
        }));
    }

    #[test]
    fn late_consume_reply_leaves_the_flag_pending() {
        let (mut port, host, runner) = port(20);

        let resolution = port
            .await_query(QueryKey::ConsumePendingPressed, 1)
            .unwrap();
        assert_eq!(resolution, Resolution::TimedOut(false));

        let Ok(RunnerMessage::Query { id, .. }) = runner.recv() else {
            panic!("expected the query");
        };
        host.send(HostMessage::Reply { id, value: true }).unwrap();

        assert!(port.consume_pending_pressed(1));
        let consumed = runner
            .try_iter()
            .filter(|m| matches!(m, RunnerMessage::Consumed { .. }))
            .count();
        assert_eq!(consumed, 1);
    }

    #[test]
    fn sleep_is_interrupted_by_cancel() {
        let (mut port, _host, _runner) = port(100);
        let cancel = port.cancel_flag();

        let canceller = thread::spawn(move || {
            thread::sleep(millis(30));
            cancel.store(true, Ordering::Relaxed);
        });

        let started = Instant::now();
        assert!(matches!(
            port.sleep(Duration::from_secs(10)),
            Err(Interrupt::Terminated)
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
        canceller.join().unwrap();
    }

    #[test]
    fn oversized_range_is_rejected_before_emit() {
        let (mut port, _host, runner) = port(100);
        let colors = vec![Color::BLACK; 256];
        assert_eq!(
            port.set_color_range(0, colors),
            Err(CodecError::RangeTooLong(256))
        );
        assert!(runner.try_recv().is_err());
    }
}
