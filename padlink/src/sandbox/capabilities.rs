use std::time::Duration;

use thiserror::Error;

use crate::bridge::{LinkClosed, LogLevel, QueryKey, Resolution};
use crate::error::CodecError;
use crate::state::Address;
use crate::wire::Color;

/// Why a suspending call gave up before it finished.
#[derive(Debug, Error)]
pub enum Interrupt {
    #[error("session terminated")]
    Terminated,

    #[error(transparent)]
    Link(#[from] LinkClosed),
}

/// Everything a script may do. The first group never suspends; the second
/// group (`await_query`, `sleep`) may, and is the only place where the script
/// can be parked waiting on the supervisor or a timer.
pub trait Capabilities {
    fn peek_pressed(&mut self, addr: Address) -> bool;
    fn consume_pending_pressed(&mut self, addr: Address) -> bool;
    fn consume_pending_unpressed(&mut self, addr: Address) -> bool;
    fn set_color(&mut self, addr: Address, color: Color);
    fn set_color_range(
        &mut self,
        start: Address,
        colors: Vec<Color>,
    ) -> Result<(), CodecError>;
    fn log(&mut self, level: LogLevel, line: String);
    fn notify_user(&mut self, text: String);
    fn now_ms(&self) -> u64;

    fn await_query(
        &mut self,
        key: QueryKey,
        addr: Address,
    ) -> Result<Resolution, Interrupt>;
    fn sleep(&mut self, duration: Duration) -> Result<(), Interrupt>;
}
