//! Per-priority queues of watchers waiting for their callback.
//!
//! A watcher appears at most once across all levels; feeding it again only
//! ORs the new events into its record. Records are popped from the end of a
//! level, so delivery within one priority is last-fed-first.

use crate::reactor::event::Events;
use crate::reactor::watcher::{NUMPRI, WatcherId};

#[derive(Clone, Copy, Debug)]
pub(crate) struct Record {
    /// `None` once the watcher was stopped or had its pending event cleared.
    pub(crate) watcher: Option<WatcherId>,
    pub(crate) events: Events,
}

pub(crate) struct PendingQueue {
    levels: [Vec<Record>; NUMPRI],
    cursor: usize,
}

impl PendingQueue {
    pub(crate) fn new() -> Self {
        Self {
            levels: Default::default(),
            cursor: NUMPRI - 1,
        }
    }

    /// Queues `events` for `id` at level `pri`, returning the 1-based slot to
    /// store in the watcher. `slot` is the watcher's current pending slot.
    pub(crate) fn feed(&mut self, id: WatcherId, pri: usize, slot: usize, events: Events) -> usize {
        self.cursor = NUMPRI - 1;

        if slot != 0 {
            self.levels[pri][slot - 1].events |= events;
            return slot;
        }

        self.levels[pri].push(Record {
            watcher: Some(id),
            events,
        });

        self.levels[pri].len()
    }

    /// Empties the record at `slot` and returns the events it carried.
    ///
    /// The record itself stays so that other slots on the level remain valid.
    pub(crate) fn clear(&mut self, pri: usize, slot: usize) -> Events {
        let record = &mut self.levels[pri][slot - 1];
        record.watcher = None;
        std::mem::take(&mut record.events)
    }

    pub(crate) fn rewind(&mut self) {
        self.cursor = NUMPRI - 1;
    }

    /// Pops the next record, highest level first.
    ///
    /// A feed between two pops moves the cursor back to the top level.
    pub(crate) fn pop(&mut self) -> Option<Record> {
        loop {
            if let Some(record) = self.levels[self.cursor].pop() {
                return Some(record);
            }

            if self.cursor == 0 {
                return None;
            }

            self.cursor -= 1;
        }
    }

    /// Number of records at a level, including emptied ones.
    pub(crate) fn level_len(&self, pri: usize) -> usize {
        self.levels[pri].len()
    }

    /// Number of records that still name a watcher.
    pub(crate) fn count(&self) -> usize {
        self.levels
            .iter()
            .flatten()
            .filter(|record| record.watcher.is_some())
            .count()
    }

    pub(crate) fn records(&self, pri: usize) -> &[Record] {
        &self.levels[pri]
    }

    pub(crate) fn clear_all(&mut self) {
        for level in &mut self.levels {
            level.clear();
        }
    }
}
