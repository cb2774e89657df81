//! Request/reply correlation for the round-trip form of the capability
//! surface. The sandbox side keeps the pending table; the supervisor side
//! answers against the canonical store without changing it. A consuming
//! query is settled by the sandbox once the reply is delivered, so a reply
//! that arrives after the timeout leaves the flag pending.
use std::time::{Duration, Instant};

use crate::core::prelude::*;
use crate::state::{Address, ButtonStore};

use super::messages::{QueryKey, RequestId, RunnerMessage};

#[derive(Clone, Debug, PartialEq)]
pub struct PendingRequest {
    pub id: RequestId,
    pub key: QueryKey,
    pub addr: Address,
    pub issued_at: Instant,
}

/// How an awaited request ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Resolution {
    Replied(bool),
    /// Unanswered past the timeout; carries the default reply.
    TimedOut(bool),
}

impl Resolution {
    pub fn value(self) -> bool {
        match self {
            Resolution::Replied(value) | Resolution::TimedOut(value) => value,
        }
    }
}

#[derive(Debug)]
pub struct RpcClient {
    next_id: RequestId,
    timeout: Duration,
    pending: HashMap<RequestId, PendingRequest>,
    resolved: HashMap<RequestId, bool>,
}

impl RpcClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_id: 1,
            timeout,
            pending: HashMap::default(),
            resolved: HashMap::default(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Registers a new request and returns the message to send for it.
    pub fn issue(
        &mut self,
        key: QueryKey,
        addr: Address,
    ) -> (RequestId, RunnerMessage) {
        let id = self.next_id;
        self.next_id += 1;

        self.pending.insert(
            id,
            PendingRequest {
                id,
                key,
                addr,
                issued_at: Instant::now(),
            },
        );

        (id, RunnerMessage::Query { id, key, addr })
    }

    /// Records a reply. Replies for ids that are not outstanding (late,
    /// duplicate, or never issued) are dropped and return false.
    pub fn resolve(&mut self, id: RequestId, value: bool) -> bool {
        if self.pending.remove(&id).is_some() {
            self.resolved.insert(id, value);
            true
        } else {
            trace!("dropping reply for unknown request {}", id);
            false
        }
    }

    pub fn take_resolved(&mut self, id: RequestId) -> Option<bool> {
        self.resolved.remove(&id)
    }

    /// Time left before `id` times out, `None` once it's past due or gone.
    pub fn remaining(&self, id: RequestId) -> Option<Duration> {
        self.pending.get(&id).and_then(|request| {
            self.timeout.checked_sub(request.issued_at.elapsed())
        })
    }

    /// Gives up on `id` and yields its default reply.
    pub fn expire(&mut self, id: RequestId) -> Option<Resolution> {
        self.pending.remove(&id).map(|request| {
            warn!(
                "request {} ({:?} {}) unanswered after {} ms; using default",
                id,
                request.key,
                request.addr,
                as_millis(request.issued_at.elapsed())
            );
            Resolution::TimedOut(request.key.default_reply())
        })
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Drops every in-flight request without resolving it.
    pub fn abandon_all(&mut self) {
        if !self.pending.is_empty() {
            debug!("abandoning {} in-flight requests", self.pending.len());
        }
        self.pending.clear();
        self.resolved.clear();
    }
}

/// Supervisor-side answer to a query. Read only: consuming queries report
/// whether the flag is pending right now.
pub fn answer(store: &ButtonStore, key: QueryKey, addr: Address) -> bool {
    let state = store.state(addr);
    match key {
        QueryKey::Pressed => state.pressed,
        QueryKey::ConsumePendingPressed => state.pending_pressed,
        QueryKey::ConsumePendingUnpressed => state.pending_unpressed,
    }
}
