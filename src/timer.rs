//! Deadline queue for scheduled calls and delayed resumes.
//!
//! Entries are kept in a binary heap ordered by deadline, with insertion
//! order breaking ties so that two entries due at the same instant fire
//! in the order they were scheduled. Cancellation is lazy: a cancelled
//! entry stays in the heap and is discarded when it reaches the top.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering as AtomicOrdering};
use std::time::Instant;

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Shared view of one scheduled entry.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    state: Arc<AtomicU8>,
}

impl TimerHandle {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(PENDING)),
        }
    }

    /// Cancels the entry. Returns `false` if it already fired or was cancelled.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(PENDING, CANCELLED, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_ok()
    }

    /// True while the entry is waiting for its deadline.
    pub fn is_active(&self) -> bool {
        self.state.load(AtomicOrdering::Acquire) == PENDING
    }

    fn fire(&self) -> bool {
        self.state
            .compare_exchange(PENDING, FIRED, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_ok()
    }
}

/// An action paired with the instant it becomes due.
pub struct DeadlineEntry<A> {
    deadline: Instant,
    seq: u64,
    handle: TimerHandle,
    action: A,
}

impl<A> DeadlineEntry<A> {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl<A> Eq for DeadlineEntry<A> {}

impl<A> PartialEq for DeadlineEntry<A> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<A> Ord for DeadlineEntry<A> {
    /// Reversed so `BinaryHeap` pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<A> PartialOrd for DeadlineEntry<A> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct TimerQueue<A> {
    heap: BinaryHeap<DeadlineEntry<A>>,
    next_seq: u64,
}

impl<A> TimerQueue<A> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn push(&mut self, deadline: Instant, action: A) -> TimerHandle {
        let handle = TimerHandle::new();
        self.push_with_handle(deadline, action, handle.clone());
        handle
    }

    /// Schedules an entry whose handle was created ahead of time, so the
    /// caller could hand it out before the entry reached the queue.
    pub(crate) fn push_with_handle(&mut self, deadline: Instant, action: A, handle: TimerHandle) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(DeadlineEntry {
            deadline,
            seq,
            handle,
            action,
        });
    }

    /// Earliest deadline among live entries.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(top) = self.heap.peek() {
            if top.handle.is_active() {
                return Some(top.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Removes and returns every live action due at or before `now`, in
    /// deadline order.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<A> {
        let mut due = Vec::new();
        while self.heap.peek().is_some_and(|top| top.deadline <= now) {
            if let Some(entry) = self.heap.pop() {
                if entry.handle.fire() {
                    due.push(entry.action);
                }
            }
        }
        due
    }

    /// Number of entries still in the heap, cancelled ones included.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl<A> Default for TimerQueue<A> {
    fn default() -> Self {
        Self::new()
    }
}
