//! 4-ary min-heap of deadlines used for timers and periodics.
//!
//! The heap stores a cached copy of each deadline next to the item it belongs
//! to. Whenever a node moves, the new 1-based position is reported through a
//! [`Backref`] so the owning watcher can find its node again in O(1).

use crate::reactor::Timestamp;

const DHEAP: usize = 4;

/// Receives heap position updates for items.
pub(crate) trait Backref<T> {
    fn set_slot(&mut self, item: T, slot: usize);
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Node<T> {
    pub(crate) at: Timestamp,
    pub(crate) item: T,
}

pub(crate) struct Heap<T> {
    nodes: Vec<Node<T>>,
}

fn parent(k: usize) -> usize {
    (k - 1) / DHEAP
}

impl<T: Copy> Heap<T> {
    pub(crate) fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn top(&self) -> Option<Node<T>> {
        self.nodes.first().copied()
    }

    /// Node at a 1-based slot, as stored in a watcher's active field.
    pub(crate) fn get(&self, slot: usize) -> Option<Node<T>> {
        slot.checked_sub(1).and_then(|k| self.nodes.get(k)).copied()
    }

    pub(crate) fn nodes(&self) -> &[Node<T>] {
        &self.nodes
    }

    pub(crate) fn push(&mut self, at: Timestamp, item: T, refs: &mut impl Backref<T>) {
        self.nodes.push(Node { at, item });
        let k = self.nodes.len() - 1;
        self.upheap(k, refs);
    }

    #[cfg(test)]
    pub(crate) fn pop_min(&mut self, refs: &mut impl Backref<T>) -> Option<Node<T>> {
        if self.nodes.is_empty() {
            return None;
        }

        Some(self.remove(1, refs))
    }

    /// Removes the node at a 1-based slot by swapping in the last node and
    /// re-establishing the heap condition around it.
    pub(crate) fn remove(&mut self, slot: usize, refs: &mut impl Backref<T>) -> Node<T> {
        let k = slot - 1;
        let removed = self.nodes.swap_remove(k);

        if k < self.nodes.len() {
            self.adjust(slot, refs);
        }

        removed
    }

    /// Changes the deadline of the node at a 1-based slot and restores order.
    pub(crate) fn set_at(&mut self, slot: usize, at: Timestamp, refs: &mut impl Backref<T>) {
        self.nodes[slot - 1].at = at;
        self.adjust(slot, refs);
    }

    /// Updates a cached deadline without moving anything; follow with [`Heap::rebuild`].
    pub(crate) fn set_at_unordered(&mut self, k: usize, at: Timestamp) {
        self.nodes[k].at = at;
    }

    /// Restores the heap after bulk deadline changes. Rare, O(n log n).
    pub(crate) fn rebuild(&mut self, refs: &mut impl Backref<T>) {
        for k in 0..self.nodes.len() {
            self.upheap(k, refs);
        }
    }

    /// Moves the node at a 1-based slot up or down until the heap holds.
    pub(crate) fn adjust(&mut self, slot: usize, refs: &mut impl Backref<T>) {
        let k = slot - 1;
        if k > 0 && self.nodes[k].at <= self.nodes[parent(k)].at {
            self.upheap(k, refs);
        } else {
            self.downheap(k, refs);
        }
    }

    fn upheap(&mut self, mut k: usize, refs: &mut impl Backref<T>) {
        let node = self.nodes[k];

        while k > 0 {
            let p = parent(k);
            if self.nodes[p].at <= node.at {
                break;
            }

            self.nodes[k] = self.nodes[p];
            refs.set_slot(self.nodes[k].item, k + 1);
            k = p;
        }

        self.nodes[k] = node;
        refs.set_slot(node.item, k + 1);
    }

    fn downheap(&mut self, mut k: usize, refs: &mut impl Backref<T>) {
        let node = self.nodes[k];
        let n = self.nodes.len();

        loop {
            let first = DHEAP * k + 1;
            if first >= n {
                break;
            }

            let last = (first + DHEAP).min(n);
            let mut min = first;
            for c in first + 1..last {
                if self.nodes[c].at < self.nodes[min].at {
                    min = c;
                }
            }

            if node.at <= self.nodes[min].at {
                break;
            }

            self.nodes[k] = self.nodes[min];
            refs.set_slot(self.nodes[k].item, k + 1);
            k = min;
        }

        self.nodes[k] = node;
        refs.set_slot(node.item, k + 1);
    }

    /// Checks the heap condition; returns the first offending 1-based slot.
    pub(crate) fn violation(&self) -> Option<usize> {
        (1..self.nodes.len())
            .find(|&k| self.nodes[parent(k)].at > self.nodes[k].at)
            .map(|k| k + 1)
    }
}
