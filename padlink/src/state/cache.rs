use crate::core::prelude::*;

use super::record::{Address, ButtonRecord, ButtonState, EdgeKind};

/// Session-local read replica of the canonical store, refreshed only by
/// pushed records.
#[derive(Clone, Debug, Default)]
pub struct ButtonCache {
    records: HashMap<Address, ButtonRecord>,
}

impl ButtonCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, addr: Address, record: &ButtonRecord) {
        self.records.entry(addr).or_default().merge(record);
    }

    pub fn merge_all<'a>(
        &mut self,
        records: impl IntoIterator<Item = &'a (Address, ButtonRecord)>,
    ) {
        for (addr, record) in records {
            self.merge(*addr, record);
        }
    }

    pub fn peek_pressed(&self, addr: Address) -> bool {
        self.records.get(&addr).is_some_and(ButtonRecord::pressed)
    }

    /// Consumes locally. `Some(upto)` means the flag was set and the caller
    /// owes the supervisor a notification.
    pub fn consume(&mut self, addr: Address, kind: EdgeKind) -> Option<u64> {
        self.records
            .get_mut(&addr)
            .and_then(|record| record.counter_mut(kind).take())
    }

    pub fn state(&self, addr: Address) -> ButtonState {
        self.records
            .get(&addr)
            .map(ButtonRecord::state)
            .unwrap_or_default()
    }
}
