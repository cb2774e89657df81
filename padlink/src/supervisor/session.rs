use std::fmt;
use std::time::Instant;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::core::prelude::*;
use crate::sandbox::ExecutionUnit;

/// Finished sessions kept around for status queries.
pub const HISTORY_LIMIT: usize = 32;

/// Stable identity of one script run.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Serialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
)]
pub struct SessionHandle(pub u64);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session #{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, Hash, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Running,
    Completed,
    Failed,
    Terminated,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed
                | SessionState::Failed
                | SessionState::Terminated
        )
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Created, SessionState::Running)
                | (SessionState::Created, SessionState::Failed)
                | (SessionState::Created, SessionState::Terminated)
                | (SessionState::Running, SessionState::Completed)
                | (SessionState::Running, SessionState::Failed)
                | (SessionState::Running, SessionState::Terminated)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Created => "created",
            SessionState::Running => "running",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Terminated => "terminated",
        };
        write!(f, "{}", label)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct SessionOutcome {
    pub state: SessionState,
    pub result: Option<String>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
    /// For terminations: whether the unit was seen to halt within the grace
    /// period.
    pub halt_confirmed: Option<bool>,
}

pub struct Session {
    handle: SessionHandle,
    name: String,
    state: SessionState,
    started_at: Instant,
    unit: Option<Box<dyn ExecutionUnit>>,
    outcome: Option<SessionOutcome>,
}

impl Session {
    pub fn new(handle: SessionHandle, name: &str) -> Self {
        Self {
            handle,
            name: name.to_string(),
            state: SessionState::Created,
            started_at: Instant::now(),
            unit: None,
            outcome: None,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn outcome(&self) -> Option<&SessionOutcome> {
        self.outcome.as_ref()
    }

    pub fn unit(&self) -> Option<&dyn ExecutionUnit> {
        self.unit.as_deref()
    }

    pub fn unit_mut(&mut self) -> Option<&mut (dyn ExecutionUnit + 'static)> {
        self.unit.as_deref_mut()
    }

    /// Hands the session its execution unit and moves it to `Running`.
    pub fn run_on(&mut self, unit: Box<dyn ExecutionUnit>) -> bool {
        self.unit = Some(unit);
        self.transition(SessionState::Running)
    }

    /// Moves to `next` if the life cycle allows it. Terminal states never
    /// change again.
    pub fn transition(&mut self, next: SessionState) -> bool {
        if self.state.can_transition_to(next) {
            trace!("{}: {} -> {}", self.handle, self.state, next);
            self.state = next;
            true
        } else {
            debug!(
                "{}: ignoring transition {} -> {}",
                self.handle, self.state, next
            );
            false
        }
    }

    /// Enters a terminal state, records the outcome and releases the unit.
    pub fn finish(
        &mut self,
        next: SessionState,
        mut outcome: SessionOutcome,
    ) -> Option<SessionOutcome> {
        if !next.is_terminal() || !self.transition(next) {
            return None;
        }
        outcome.state = next;
        if outcome.elapsed_ms == 0 {
            outcome.elapsed_ms = as_millis(self.started_at.elapsed());
        }
        self.unit = None;
        self.outcome = Some(outcome.clone());
        Some(outcome)
    }

    pub fn elapsed_ms(&self) -> u64 {
        as_millis(self.started_at.elapsed())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.handle)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("outcome", &self.outcome)
            .finish()
    }
}

/// Every session the supervisor started, keyed by handle. At most one is
/// active; finished ones are pruned oldest first.
#[derive(Debug)]
pub struct SessionRegistry {
    next_handle: u64,
    history_limit: usize,
    sessions: IndexMap<SessionHandle, Session>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(HISTORY_LIMIT)
    }
}

impl SessionRegistry {
    pub fn new(history_limit: usize) -> Self {
        Self {
            next_handle: 1,
            history_limit,
            sessions: IndexMap::new(),
        }
    }

    pub fn create(&mut self, name: &str) -> &mut Session {
        let handle = SessionHandle(self.next_handle);
        self.next_handle += 1;
        self.prune();
        self.sessions
            .entry(handle)
            .or_insert_with(|| Session::new(handle, name))
    }

    pub fn get(&self, handle: SessionHandle) -> Option<&Session> {
        self.sessions.get(&handle)
    }

    pub fn get_mut(&mut self, handle: SessionHandle) -> Option<&mut Session> {
        self.sessions.get_mut(&handle)
    }

    pub fn remove(&mut self, handle: SessionHandle) -> Option<Session> {
        self.sessions.shift_remove(&handle)
    }

    pub fn active(&self) -> Option<&Session> {
        self.sessions.values().find(|s| s.state().is_active())
    }

    pub fn active_mut(&mut self) -> Option<&mut Session> {
        self.sessions.values_mut().find(|s| s.state().is_active())
    }

    pub fn active_handle(&self) -> Option<SessionHandle> {
        self.active().map(Session::handle)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn prune(&mut self) {
        while self.sessions.len() >= self.history_limit.max(1) {
            let oldest_finished = self
                .sessions
                .iter()
                .find(|(_, s)| s.state().is_terminal())
                .map(|(handle, _)| *handle);

            match oldest_finished {
                Some(handle) => {
                    self.sessions.shift_remove(&handle);
                }
                None => break,
            }
        }
    }
}
