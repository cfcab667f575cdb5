//! Per-rule half-connection counts.
//!
//! Every forwarded connection is made of two half-connections (one per relay
//! direction), and each one is counted separately. A connection that passes
//! admission and dials successfully adds 2; each byte pump removes 1 when it
//! exits.
//!
//! All reads and writes go through [`ConnectionCounter::adjust`], which holds
//! a single mutex for the whole table. Contention is negligible next to the
//! socket I/O each adjustment accompanies.

use crate::error::{ForwardError, ForwardResult};
use crate::rules::RuleIndex;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::error;

/// Live half-connection counts, one slot per rule.
#[derive(Debug)]
pub struct ConnectionCounter {
    counts: Mutex<Vec<usize>>,
}

impl ConnectionCounter {
    /// Create a counter with `rules` zeroed slots.
    pub fn new(rules: usize) -> Self {
        Self {
            counts: Mutex::new(vec![0; rules]),
        }
    }

    /// Apply `delta` to the slot for `index` and return the new count.
    ///
    /// A `delta` of `0` is a synchronized read.
    ///
    /// # Errors
    ///
    /// [`ForwardError::UnknownRule`] if `index` has no slot, and
    /// [`ForwardError::CounterUnderflow`] if the result would be negative (the
    /// slot is left unchanged).
    pub fn adjust(&self, index: RuleIndex, delta: isize) -> ForwardResult<usize> {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = counts
            .get_mut(index)
            .ok_or(ForwardError::UnknownRule(index))?;
        let next = slot
            .checked_add_signed(delta)
            .ok_or(ForwardError::CounterUnderflow {
                index,
                count: *slot,
                delta,
            })?;
        *slot = next;
        Ok(next)
    }

    /// Current count for `index`.
    pub fn peek(&self, index: RuleIndex) -> ForwardResult<usize> {
        self.adjust(index, 0)
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count both halves of a newly established connection.
    ///
    /// Adds 2 to the slot and returns one [`HalfConnectionSlot`] per relay
    /// direction. Each slot releases its unit when dropped.
    pub fn claim_pair(
        self: &Arc<Self>,
        index: RuleIndex,
    ) -> ForwardResult<(HalfConnectionSlot, HalfConnectionSlot)> {
        self.adjust(index, 2)?;
        Ok((
            HalfConnectionSlot::new(self.clone(), index),
            HalfConnectionSlot::new(self.clone(), index),
        ))
    }
}

/// RAII guard for one counted half-connection.
///
/// Decrements the rule's count by exactly 1 when dropped. Owned by the pump
/// task, so the decrement also happens if that task unwinds.
#[derive(Debug)]
pub struct HalfConnectionSlot {
    counter: Arc<ConnectionCounter>,
    index: RuleIndex,
}

impl HalfConnectionSlot {
    fn new(counter: Arc<ConnectionCounter>, index: RuleIndex) -> Self {
        Self { counter, index }
    }

    pub fn index(&self) -> RuleIndex {
        self.index
    }
}

impl Drop for HalfConnectionSlot {
    fn drop(&mut self) {
        if let Err(e) = self.counter.adjust(self.index, -1) {
            error!(index = self.index, error = %e, "failed to release half-connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjust_returns_new_value() {
        let counter = ConnectionCounter::new(2);
        assert_eq!(counter.adjust(0, 2).unwrap(), 2);
        assert_eq!(counter.adjust(0, -1).unwrap(), 1);
        assert_eq!(counter.peek(0).unwrap(), 1);
        assert_eq!(counter.peek(1).unwrap(), 0);
    }

    #[test]
    fn underflow_leaves_slot_untouched() {
        let counter = ConnectionCounter::new(1);
        counter.adjust(0, 1).unwrap();
        assert!(matches!(
            counter.adjust(0, -2),
            Err(ForwardError::CounterUnderflow { count: 1, .. })
        ));
        assert_eq!(counter.peek(0).unwrap(), 1);
    }

    #[test]
    fn unknown_index() {
        let counter = ConnectionCounter::new(1);
        assert!(matches!(counter.peek(3), Err(ForwardError::UnknownRule(3))));
        assert_eq!(counter.len(), 1);
    }

    #[test]
    fn pair_slots_release_one_each() {
        let counter = Arc::new(ConnectionCounter::new(1));
        let (a, b) = counter.claim_pair(0).unwrap();
        assert_eq!(counter.peek(0).unwrap(), 2);
        drop(a);
        assert_eq!(counter.peek(0).unwrap(), 1);
        drop(b);
        assert_eq!(counter.peek(0).unwrap(), 0);
    }

    #[test]
    fn concurrent_adjustments_are_conserved() {
        let counter = Arc::new(ConnectionCounter::new(1));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let (a, b) = counter.claim_pair(0).unwrap();
                        drop(a);
                        drop(b);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(counter.peek(0).unwrap(), 0);
    }
}
