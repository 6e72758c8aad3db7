/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Sequence number management.
//!
//! Tracks the authoritative next-expected and next-to-send sequence numbers
//! for one session. Pure state, no I/O. The outbound side separates peeking
//! (`next_outbound`) from advancing (`confirm_outbound`) so the counter only
//! moves once the message has passed its durability point: the engine never
//! advances speculatively.

use gapless_core::types::{SeqNum, SeqRange};
use std::sync::atomic::{AtomicU64, Ordering};

/// Classification of a received sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqStatus {
    /// Sequence number is exactly the expected one; the tracker advanced.
    InOrder,
    /// Sequence number is ahead of expected; the range of missing messages.
    Gap(SeqRange),
    /// Sequence number is at or below the last processed one.
    Duplicate {
        /// Expected sequence number.
        expected: u64,
        /// Received sequence number.
        received: u64,
    },
}

impl SeqStatus {
    /// Returns true if the message arrived in order.
    #[must_use]
    pub const fn is_in_order(&self) -> bool {
        matches!(self, Self::InOrder)
    }

    /// Returns true if a gap was detected.
    #[must_use]
    pub const fn is_gap(&self) -> bool {
        matches!(self, Self::Gap(_))
    }
}

/// Per-direction sequence numbers for one FIX session.
///
/// Uses atomics so snapshot reads never block; mutation is still expected to
/// come from the session's single writer.
#[derive(Debug)]
pub struct SequenceTracker {
    /// Next sequence number we will send.
    next_outbound: AtomicU64,
    /// Next sequence number we expect to receive.
    next_inbound: AtomicU64,
}

impl SequenceTracker {
    /// Creates a tracker with both directions starting at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_outbound: AtomicU64::new(1),
            next_inbound: AtomicU64::new(1),
        }
    }

    /// Creates a tracker resuming from persisted values.
    #[must_use]
    pub fn with_initial(next_outbound: u64, next_inbound: u64) -> Self {
        Self {
            next_outbound: AtomicU64::new(next_outbound),
            next_inbound: AtomicU64::new(next_inbound),
        }
    }

    /// Returns the next outbound sequence number without advancing.
    #[inline]
    #[must_use]
    pub fn next_outbound(&self) -> SeqNum {
        SeqNum::new(self.next_outbound.load(Ordering::SeqCst))
    }

    /// Advances the outbound counter after a confirmed durable send and
    /// returns the sequence number that was consumed.
    #[inline]
    pub fn confirm_outbound(&self) -> SeqNum {
        SeqNum::new(self.next_outbound.fetch_add(1, Ordering::SeqCst))
    }

    /// Returns the next expected inbound sequence number.
    #[inline]
    #[must_use]
    pub fn expected_inbound(&self) -> SeqNum {
        SeqNum::new(self.next_inbound.load(Ordering::SeqCst))
    }

    /// Advances the inbound counter past one processed message.
    #[inline]
    pub fn advance_inbound(&self) {
        self.next_inbound.fetch_add(1, Ordering::SeqCst);
    }

    /// Classifies a received sequence number.
    ///
    /// Equal to expected advances the tracker and yields `InOrder`. Strictly
    /// greater yields `Gap` over `[expected, received - 1]` without touching
    /// state. At or below yields `Duplicate` without touching state; whether
    /// a duplicate is tolerable (PossDupFlag) is the state machine's call.
    pub fn observe(&self, received: SeqNum) -> SeqStatus {
        let expected = self.next_inbound.load(Ordering::SeqCst);
        let received = received.value();

        if received == expected {
            self.next_inbound.store(expected + 1, Ordering::SeqCst);
            SeqStatus::InOrder
        } else if received > expected {
            SeqStatus::Gap(SeqRange::new(expected, received - 1))
        } else {
            SeqStatus::Duplicate { expected, received }
        }
    }

    /// Sets the next outbound sequence number.
    #[inline]
    pub fn set_outbound(&self, seq: u64) {
        self.next_outbound.store(seq, Ordering::SeqCst);
    }

    /// Sets the next expected inbound sequence number.
    #[inline]
    pub fn set_inbound(&self, seq: u64) {
        self.next_inbound.store(seq, Ordering::SeqCst);
    }

    /// Resets both directions to 1.
    #[inline]
    pub fn reset(&self) {
        self.next_outbound.store(1, Ordering::SeqCst);
        self.next_inbound.store(1, Ordering::SeqCst);
    }

    /// Returns `(next_outbound, next_inbound)` for persistence.
    #[inline]
    #[must_use]
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.next_outbound.load(Ordering::SeqCst),
            self.next_inbound.load(Ordering::SeqCst),
        )
    }
}

impl Default for SequenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_new() {
        let tracker = SequenceTracker::new();
        assert_eq!(tracker.next_outbound().value(), 1);
        assert_eq!(tracker.expected_inbound().value(), 1);
    }

    #[test]
    fn test_confirm_outbound_is_contiguous() {
        let tracker = SequenceTracker::new();
        assert_eq!(tracker.next_outbound().value(), 1);
        assert_eq!(tracker.confirm_outbound().value(), 1);
        assert_eq!(tracker.confirm_outbound().value(), 2);
        assert_eq!(tracker.next_outbound().value(), 3);
    }

    #[test]
    fn test_observe_in_order_advances() {
        let tracker = SequenceTracker::new();
        assert_eq!(tracker.observe(SeqNum::new(1)), SeqStatus::InOrder);
        assert_eq!(tracker.expected_inbound().value(), 2);
    }

    #[test]
    fn test_observe_gap_leaves_state() {
        let tracker = SequenceTracker::new();
        assert_eq!(
            tracker.observe(SeqNum::new(5)),
            SeqStatus::Gap(SeqRange::new(1, 4))
        );
        assert_eq!(tracker.expected_inbound().value(), 1);
    }

    #[test]
    fn test_observe_duplicate_leaves_state() {
        let tracker = SequenceTracker::with_initial(1, 5);
        assert_eq!(
            tracker.observe(SeqNum::new(3)),
            SeqStatus::Duplicate {
                expected: 5,
                received: 3
            }
        );
        assert_eq!(tracker.expected_inbound().value(), 5);
    }

    #[test]
    fn test_reset() {
        let tracker = SequenceTracker::with_initial(100, 200);
        tracker.reset();
        assert_eq!(tracker.snapshot(), (1, 1));
    }

    #[test]
    fn test_resume_from_persisted() {
        // Reconnect under "continue": disconnected at outbound=50/inbound=48.
        let tracker = SequenceTracker::with_initial(51, 49);
        assert_eq!(tracker.next_outbound().value(), 51);
        assert_eq!(tracker.expected_inbound().value(), 49);
    }
}
