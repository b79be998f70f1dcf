//! Activation timeline: a min-heap of (wall time, scheme id) pairs.
//!
//! Entries are never updated in place. A scheme update pushes fresh entries
//! and leaves the old ones in the heap; staleness is detected on pop by
//! comparing the popped time against the scheme's current start/expiry.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use cloud_schema::SyncId;
use signal_core::Timestamp;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimelineEntry {
    pub time_ms: Timestamp,
    pub scheme_id: SyncId,
}

#[derive(Debug, Default)]
pub struct Timeline {
    heap: BinaryHeap<Reverse<TimelineEntry>>,
}

impl Timeline {
    pub fn push(&mut self, time_ms: Timestamp, scheme_id: SyncId) {
        self.heap.push(Reverse(TimelineEntry { time_ms, scheme_id }));
    }

    pub fn peek(&self) -> Option<&TimelineEntry> {
        self.heap.peek().map(|Reverse(e)| e)
    }

    pub fn pop(&mut self) -> Option<TimelineEntry> {
        self.heap.pop().map(|Reverse(e)| e)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_time_order() {
        let mut timeline = Timeline::default();
        timeline.push(3_000, "c".into());
        timeline.push(1_000, "a".into());
        timeline.push(2_000, "b".into());

        assert_eq!(timeline.peek().unwrap().time_ms, 1_000);
        assert_eq!(timeline.pop().unwrap().scheme_id, "a");
        assert_eq!(timeline.pop().unwrap().scheme_id, "b");
        assert_eq!(timeline.pop().unwrap().scheme_id, "c");
        assert!(timeline.pop().is_none());
    }

    #[test]
    fn equal_times_break_ties_by_id() {
        let mut timeline = Timeline::default();
        timeline.push(1_000, "b".into());
        timeline.push(1_000, "a".into());
        assert_eq!(timeline.pop().unwrap().scheme_id, "a");
        assert_eq!(timeline.pop().unwrap().scheme_id, "b");
    }
}
