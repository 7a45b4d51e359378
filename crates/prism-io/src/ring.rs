//! # Ring — Bounded Recency Buffer
//!
//! Keeps the `capacity` most recent entries. Pushing into a full ring
//! evicts the oldest entry and hands it back to the caller.

use crate::cursor::Cursor;

#[derive(Debug, Clone)]
pub struct Ring<T> {
    cursor: Cursor,
    slots: Vec<Option<T>>,
}

impl<T> Ring<T> {
    /// A ring holding up to `capacity` entries (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        let slots = capacity.max(1);
        Self {
            cursor: Cursor::new(slots),
            slots: (0..slots).map(|_| None).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.cursor.capacity()
    }

    pub fn len(&self) -> usize {
        self.cursor.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursor.is_empty()
    }

    /// Append an entry, returning the evicted oldest entry if the ring was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let claim = self.cursor.claim();
        let previous = self.slots[claim.slot].replace(item);
        if claim.overwrote {
            previous
        } else {
            None
        }
    }

    /// Entries oldest first. Reverse it for newest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + '_ {
        (0..self.len()).filter_map(move |offset| {
            self.cursor
                .slot_at(offset)
                .and_then(|slot| self.slots[slot].as_ref())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_within_capacity_keeps_order() {
        let mut ring = Ring::with_capacity(3);
        assert_eq!(ring.push(1), None);
        assert_eq!(ring.push(2), None);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_full_ring_evicts_oldest() {
        let mut ring = Ring::with_capacity(3);
        for i in 1..=3 {
            ring.push(i);
        }
        assert_eq!(ring.push(4), Some(1));
        assert_eq!(ring.push(5), Some(2));
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![3, 4, 5]);
        assert_eq!(ring.iter().rev().copied().collect::<Vec<_>>(), vec![5, 4, 3]);
    }

    #[test]
    fn test_zero_capacity_still_holds_one() {
        let mut ring = Ring::with_capacity(0);
        assert_eq!(ring.capacity(), 1);
        ring.push("a");
        assert_eq!(ring.push("b"), Some("a"));
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec!["b"]);
    }
}
