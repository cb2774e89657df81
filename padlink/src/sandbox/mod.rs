pub mod capabilities;
pub mod lua;
pub mod port;
pub mod runner;
pub mod unit;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::bridge::{LaunchSpec, RunnerMessage, ScriptOutcome};

pub use capabilities::{Capabilities, Interrupt};
pub use port::{Inbox, Outbox, SandboxPort};
pub use unit::{ExecutionUnit, ProcessUnit, RunnerCommand, ThreadUnit};

/// Runs one script session to the end on the calling thread. Shared by both
/// execution units.
pub fn run_session(
    spec: LaunchSpec,
    inbox: Inbox,
    outbox: Outbox,
    cancel: Arc<AtomicBool>,
) -> ScriptOutcome {
    let port = Rc::new(RefCell::new(SandboxPort::new(
        &spec, inbox, outbox, cancel,
    )));
    port.borrow_mut().send(RunnerMessage::Ready);

    let outcome = lua::execute(&spec, &port);
    port.borrow_mut().finish(outcome.clone());
    outcome
}
