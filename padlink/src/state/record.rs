use serde::{Deserialize, Serialize};

/// 8-bit pad address. Not contiguous, not bounded by any visual grid.
pub type Address = u8;

/// Boolean view of one pad, as scripts and observers see it.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, Hash, PartialEq,
)]
pub struct ButtonState {
    pub pressed: bool,
    pub pending_pressed: bool,
    pub pending_unpressed: bool,
}

/// Result of applying a level to a pad.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Edge {
    None,
    RoseToPressed,
    FellToReleased,
}

/// Which one-shot flag a consumption refers to.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, Hash, PartialEq)]
pub enum EdgeKind {
    Rise,
    Fall,
}

/// Monotonic count of edges seen and the count already consumed. The flag is
/// pending while `seen > taken`.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, Hash, PartialEq,
)]
pub struct EdgeCounter {
    pub seen: u64,
    pub taken: u64,
}

impl EdgeCounter {
    pub fn is_pending(&self) -> bool {
        self.seen > self.taken
    }

    /// Consumes the flag and returns the sequence number it was consumed up
    /// to, or `None` when nothing was pending.
    pub fn take(&mut self) -> Option<u64> {
        if self.is_pending() {
            self.taken = self.seen;
            Some(self.taken)
        } else {
            None
        }
    }

    /// Marks every edge up to `upto` as consumed. Never un-consumes.
    pub fn acknowledge(&mut self, upto: u64) -> bool {
        let upto = upto.min(self.seen);
        if upto > self.taken {
            self.taken = upto;
            true
        } else {
            false
        }
    }

    pub fn merge(&mut self, other: &EdgeCounter) {
        self.seen = self.seen.max(other.seen);
        self.taken = self.taken.max(other.taken);
    }
}

/// Replicated per-pad record exchanged between the canonical store and a
/// session cache.
///
/// Both sides only ever grow the counters, so merging is a component-wise
/// max: edges that arrive while a consumption is in flight are never lost,
/// and a stale push can never resurrect a flag that was already consumed.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, Hash, PartialEq,
)]
pub struct ButtonRecord {
    pub rises: EdgeCounter,
    pub falls: EdgeCounter,
}

impl ButtonRecord {
    pub fn pressed(&self) -> bool {
        self.rises.seen > self.falls.seen
    }

    pub fn state(&self) -> ButtonState {
        ButtonState {
            pressed: self.pressed(),
            pending_pressed: self.rises.is_pending(),
            pending_unpressed: self.falls.is_pending(),
        }
    }

    pub fn apply_level(&mut self, pressed: bool) -> Edge {
        match (self.pressed(), pressed) {
            (false, true) => {
                self.rises.seen += 1;
                Edge::RoseToPressed
            }
            (true, false) => {
                self.falls.seen += 1;
                Edge::FellToReleased
            }
            _ => Edge::None,
        }
    }

    pub fn counter_mut(&mut self, kind: EdgeKind) -> &mut EdgeCounter {
        match kind {
            EdgeKind::Rise => &mut self.rises,
            EdgeKind::Fall => &mut self.falls,
        }
    }

    /// Drops every pending flag while keeping the pressed level.
    pub fn clear_pending(&mut self) {
        self.rises.taken = self.rises.seen;
        self.falls.taken = self.falls.seen;
    }

    pub fn merge(&mut self, other: &ButtonRecord) {
        self.rises.merge(&other.rises);
        self.falls.merge(&other.falls);
    }
}
