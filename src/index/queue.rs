//! Fixed-capacity candidate queue shared by graph pruning and search.
//!
//! Entries stay sorted ascending by distance. A full queue rejects anything
//! not strictly better than its tail and otherwise evicts the tail, which is
//! handed back so the caller can release the page pin it may hold.

use crate::error::{IndexError, IndexResult};
use crate::vector::VertexIndex;

/// One candidate vertex.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueEntry {
    pub vertex: VertexIndex,
    pub distance: f32,
    /// Neighbors have been expanded.
    pub checked: bool,
    /// `distance` is exact rather than a PQ estimate.
    pub exact: bool,
    /// The entry holds a pin on its graph page.
    pub locked: bool,
}

/// Outcome of `BoundedGreedyVertexPriorityQueue::add`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Insertion {
    Rejected,
    Added(usize),
    /// Added at the position, pushing out the previous tail.
    Evicted(usize, QueueEntry),
}

/// Bounded best-first candidate list.
#[derive(Debug, Clone)]
pub struct BoundedGreedyVertexPriorityQueue {
    entries: Vec<QueueEntry>,
    capacity: usize,
}

impl BoundedGreedyVertexPriorityQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Vec::with_capacity(capacity + 1),
            capacity,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    pub fn get(&self, position: usize) -> &QueueEntry {
        &self.entries[position]
    }

    /// Inserts a candidate keeping the order; equal distances keep
    /// insertion order.
    pub fn add(
        &mut self,
        vertex: VertexIndex,
        distance: f32,
        exact: bool,
        locked: bool,
    ) -> Insertion {
        let full = self.entries.len() >= self.capacity;
        if full && self.entries.last().is_some_and(|tail| distance >= tail.distance) {
            return Insertion::Rejected;
        }

        let position = self.entries.partition_point(|e| e.distance <= distance);
        self.entries.insert(
            position,
            QueueEntry {
                vertex,
                distance,
                checked: false,
                exact,
                locked,
            },
        );

        if full {
            match self.entries.pop() {
                Some(evicted) => Insertion::Evicted(position, evicted),
                None => Insertion::Added(position),
            }
        } else {
            Insertion::Added(position)
        }
    }

    /// Position of the closest entry not yet checked.
    pub fn next_not_checked(&self) -> Option<usize> {
        self.entries.iter().position(|e| !e.checked)
    }

    /// Collects the positions of up to four closest unchecked entries whose
    /// distance is still a PQ estimate.
    pub fn next_not_checked_pq(&self, out: &mut Vec<usize>) -> usize {
        out.clear();
        for (position, entry) in self.entries.iter().enumerate() {
            if !entry.checked && !entry.exact {
                out.push(position);
                if out.len() == 4 {
                    break;
                }
            }
        }
        out.len()
    }

    pub fn position_of(&self, vertex: VertexIndex) -> Option<usize> {
        self.entries.iter().position(|e| e.vertex == vertex)
    }

    /// Replaces an estimate by the exact `distance` and moves the entry to
    /// its sorted position, returning that position.
    pub fn update_distance(&mut self, position: usize, distance: f32) -> usize {
        let old = self.entries[position].distance;
        self.entries[position].distance = distance;
        self.entries[position].exact = true;

        // Only the range between the old and new slot shifts by one, so a
        // rotation replaces the element-by-element swap cascade.
        if distance > old {
            let tail = &self.entries[position + 1..];
            let target = position + tail.partition_point(|e| e.distance <= distance);
            self.entries[position..=target].rotate_left(1);
            target
        } else {
            let head = &self.entries[..position];
            let target = head.partition_point(|e| e.distance <= distance);
            self.entries[target..=position].rotate_right(1);
            target
        }
    }

    pub fn mark_checked(&mut self, position: usize) {
        self.entries[position].checked = true;
    }

    /// Records that the entry holds a page pin.
    ///
    /// Locking an entry twice would leak a pin, so it is a protocol error.
    pub fn mark_locked(&mut self, position: usize) -> IndexResult<()> {
        let entry = &mut self.entries[position];
        if entry.locked {
            return Err(IndexError::protocol(format!(
                "vertex {} is already locked in the candidate queue",
                entry.vertex
            )));
        }
        entry.locked = true;
        Ok(())
    }

    /// Appends the closest `k` vertices to `out`.
    pub fn vertices_into(&self, out: &mut Vec<VertexIndex>, k: usize) {
        out.extend(self.entries.iter().take(k).map(|e| e.vertex));
    }

    /// Clears every lock flag, returning the vertices that held one.
    pub fn drain_locked(&mut self) -> Vec<VertexIndex> {
        let mut locked = Vec::new();
        for entry in self.entries.iter_mut().filter(|e| e.locked) {
            entry.locked = false;
            locked.push(entry.vertex);
        }
        locked
    }

    #[cfg(test)]
    fn is_sorted(&self) -> bool {
        self.entries.windows(2).all(|w| w[0].distance <= w[1].distance)
    }
}
