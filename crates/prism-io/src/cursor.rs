//! # Cursor — Recency Window Position Tracker
//!
//! Tracks which slots of a fixed ring hold live entries as a `start` offset
//! plus a `len`. Claiming a slot on a full ring reuses the oldest one, so
//! every slot is usable and the window always covers the newest writes.

/// Position tracker for an overwrite-oldest ring of `capacity` slots.
#[derive(Debug, Clone)]
pub struct Cursor {
    start: usize,
    len: usize,
    capacity: usize,
}

/// Where the next entry goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub slot: usize,
    /// The slot still held the oldest live entry, which is now gone.
    pub overwrote: bool,
}

impl Cursor {
    /// # Panics
    /// Panics if `capacity == 0`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring needs at least one slot");
        Self {
            start: 0,
            len: 0,
            capacity,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Claim the slot after the newest entry. On a full ring that slot is
    /// the oldest entry's, and the window slides forward by one.
    pub fn claim(&mut self) -> Claim {
        if self.is_full() {
            let slot = self.start;
            self.start = self.wrap(self.start + 1);
            return Claim {
                slot,
                overwrote: true,
            };
        }
        let slot = self.wrap(self.start + self.len);
        self.len += 1;
        Claim {
            slot,
            overwrote: false,
        }
    }

    /// Slot of the `offset`-th oldest live entry.
    #[inline]
    pub fn slot_at(&self, offset: usize) -> Option<usize> {
        (offset < self.len).then(|| self.wrap(self.start + offset))
    }

    #[inline]
    fn wrap(&self, pos: usize) -> usize {
        pos % self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claims_fill_every_slot() {
        let mut c = Cursor::new(3);
        let slots: Vec<usize> = (0..3).map(|_| c.claim().slot).collect();
        assert_eq!(slots, vec![0, 1, 2]);
        assert!(c.is_full());
        assert_eq!(c.len(), 3);
    }

    #[test]
    fn test_full_cursor_overwrites_oldest() {
        let mut c = Cursor::new(2);
        c.claim();
        c.claim();
        assert_eq!(
            c.claim(),
            Claim {
                slot: 0,
                overwrote: true
            }
        );
        assert_eq!(c.slot_at(0), Some(1));
        assert_eq!(c.slot_at(1), Some(0));
        assert_eq!(c.slot_at(2), None);
    }

    #[test]
    fn test_window_wraps_across_many_overwrites() {
        let mut c = Cursor::new(3);
        for _ in 0..7 {
            c.claim();
        }
        // Seven claims on three slots: the live window is claims 5..7.
        assert_eq!(c.len(), 3);
        assert_eq!(c.slot_at(0), Some(1));
        assert_eq!(c.slot_at(1), Some(2));
        assert_eq!(c.slot_at(2), Some(0));
    }

    #[test]
    fn test_empty_cursor_has_no_slots() {
        let c = Cursor::new(4);
        assert!(c.is_empty());
        assert!(!c.is_full());
        assert_eq!(c.slot_at(0), None);
    }
}
