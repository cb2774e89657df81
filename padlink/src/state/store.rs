//! Canonical per-address button table. Owned by the supervisor and only ever
//! mutated from its thread; sessions see replicas pushed to them.
use indexmap::IndexMap;

use super::record::{Address, ButtonRecord, ButtonState, Edge, EdgeKind};

/// Uses [`IndexMap`] so snapshots list pads in the order they were first
/// observed.
#[derive(Clone, Debug, Default)]
pub struct ButtonStore {
    records: IndexMap<Address, ButtonRecord>,
}

impl ButtonStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates the pressed level unconditionally and raises the matching
    /// pending flag only on an edge.
    pub fn apply(&mut self, addr: Address, pressed: bool) -> Edge {
        self.records.entry(addr).or_default().apply_level(pressed)
    }

    pub fn peek_pressed(&self, addr: Address) -> bool {
        self.records.get(&addr).is_some_and(ButtonRecord::pressed)
    }

    pub fn consume_pending_pressed(&mut self, addr: Address) -> bool {
        self.consume(addr, EdgeKind::Rise)
    }

    pub fn consume_pending_unpressed(&mut self, addr: Address) -> bool {
        self.consume(addr, EdgeKind::Fall)
    }

    pub fn consume(&mut self, addr: Address, kind: EdgeKind) -> bool {
        self.records
            .get_mut(&addr)
            .and_then(|record| record.counter_mut(kind).take())
            .is_some()
    }

    /// Applies a consumption that already happened in a session cache.
    /// Returns true when the canonical flag changed.
    pub fn acknowledge(
        &mut self,
        addr: Address,
        kind: EdgeKind,
        upto: u64,
    ) -> bool {
        self.records
            .get_mut(&addr)
            .is_some_and(|record| record.counter_mut(kind).acknowledge(upto))
    }

    pub fn state(&self, addr: Address) -> ButtonState {
        self.record(addr).state()
    }

    pub fn record(&self, addr: Address) -> ButtonRecord {
        self.records.get(&addr).copied().unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<(Address, ButtonRecord)> {
        self.records.iter().map(|(a, r)| (*a, *r)).collect()
    }

    pub fn addresses(&self) -> impl Iterator<Item = Address> + '_ {
        self.records.keys().copied()
    }

    /// Drops pending flags everywhere, keeping pressed levels.
    pub fn clear_pending(&mut self) {
        for record in self.records.values_mut() {
            record.clear_pending();
        }
    }

    /// Every known pad back to `{false, false, false}`.
    pub fn reset_all(&mut self) {
        for record in self.records.values_mut() {
            *record = ButtonRecord::default();
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(pressed: bool, pp: bool, up: bool) -> ButtonState {
        ButtonState {
            pressed,
            pending_pressed: pp,
            pending_unpressed: up,
        }
    }

    #[test]
    fn rising_edge_sets_only_pending_pressed() {
        let mut store = ButtonStore::new();
        assert_eq!(store.apply(3, true), Edge::RoseToPressed);
        assert_eq!(store.state(3), state(true, true, false));
    }

    #[test]
    fn falling_edge_leaves_pending_pressed_untouched() {
        let mut store = ButtonStore::new();
        store.apply(3, true);
        assert_eq!(store.apply(3, false), Edge::FellToReleased);
        assert_eq!(store.state(3), state(false, true, true));
    }

    #[test]
    fn repeated_level_is_not_an_edge() {
        let mut store = ButtonStore::new();
        store.apply(1, false);
        assert_eq!(store.state(1), state(false, false, false));
        store.apply(1, true);
        store.consume_pending_pressed(1);
        assert_eq!(store.apply(1, true), Edge::None);
        assert_eq!(store.state(1), state(true, false, false));
    }

    #[test]
    fn consume_returns_true_once_per_edge() {
        let mut store = ButtonStore::new();
        store.apply(7, true);
        assert!(store.consume_pending_pressed(7));
        assert!(!store.consume_pending_pressed(7));

        store.apply(7, false);
        store.apply(7, true);
        assert!(store.consume_pending_pressed(7));
        assert!(store.consume_pending_unpressed(7));
        assert!(!store.consume_pending_unpressed(7));
    }

    #[test]
    fn peek_never_consumes() {
        let mut store = ButtonStore::new();
        store.apply(2, true);
        assert!(store.peek_pressed(2));
        assert!(store.peek_pressed(2));
        assert!(store.state(2).pending_pressed);
    }

    #[test]
    fn unknown_address_reads_as_released() {
        let mut store = ButtonStore::new();
        assert!(!store.peek_pressed(200));
        assert!(!store.consume_pending_pressed(200));
        assert!(store.is_empty());
    }

    #[test]
    fn quick_cycles_accumulate_instead_of_cancelling() {
        let mut store = ButtonStore::new();
        store.apply(1, true);
        store.apply(1, false);
        store.apply(1, true);
        assert_eq!(store.state(1), state(true, true, true));
    }

    #[test]
    fn acknowledge_respects_newer_edges() {
        let mut store = ButtonStore::new();
        store.apply(4, true);
        let upto = store.record(4).rises.seen;
        store.apply(4, false);
        store.apply(4, true);

        assert!(store.acknowledge(4, EdgeKind::Rise, upto));
        assert!(store.state(4).pending_pressed);
    }

    #[test]
    fn reset_all_clears_every_entry() {
        let mut store = ButtonStore::new();
        store.apply(1, true);
        store.apply(2, true);
        store.apply(2, false);
        store.reset_all();

        assert_eq!(store.len(), 2);
        for addr in [1, 2] {
            assert_eq!(store.state(addr), state(false, false, false));
        }
    }

    #[test]
    fn snapshot_preserves_first_seen_order() {
        let mut store = ButtonStore::new();
        store.apply(9, true);
        store.apply(2, true);
        store.apply(9, false);
        let addrs: Vec<Address> =
            store.snapshot().into_iter().map(|(a, _)| a).collect();
        assert_eq!(addrs, vec![9, 2]);
    }
}
