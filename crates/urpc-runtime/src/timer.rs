//! Deadline queue
//!
//! Min-heap of deadlines for calls and connect attempts, driven by the
//! event loop: `run_once` shortens its poll wait to `next_deadline()` and
//! fires whatever `poll_expired()` returns.
//!
//! # Complexity
//!
//! - Insert: O(log n)
//! - Cancel: O(1) (lazy cancellation)
//! - Poll expired: O(k log n) where k = number of expired entries
//!
//! Cancelled ids sit in a set and are skipped when they surface at the top
//! of the heap. The set is cleared whenever the heap empties.

use std::collections::{BinaryHeap, HashSet};
use std::time::Instant;

use urpc_core::{CorrelationId, HandleId};

/// What a deadline guards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// A pending call on a client connection
    Call { conn: HandleId, id: CorrelationId },
    /// One connect attempt of a client connection
    Connect { conn: HandleId, attempt: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

struct Entry {
    at: Instant,
    id: TimerId,
    what: Deadline,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.id == other.id
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed for a min-heap; ties go to the older id.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

#[derive(Default)]
pub struct DeadlineQueue {
    heap: BinaryHeap<Entry>,
    cancelled: HashSet<TimerId>,
    next_id: u64,
}

impl DeadlineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, at: Instant, what: Deadline) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.heap.push(Entry { at, id, what });
        id
    }

    /// Returns false if `id` was already cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.cancelled.insert(id)
    }

    /// Earliest live deadline.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(top) = self.heap.peek() {
            if !self.cancelled.contains(&top.id) {
                return Some(top.at);
            }
            let id = top.id;
            self.heap.pop();
            self.cancelled.remove(&id);
        }
        self.cancelled.clear();
        None
    }

    /// Remove and return every live deadline at or before `now`, earliest first.
    pub fn poll_expired(&mut self, now: Instant) -> Vec<Deadline> {
        let mut expired = Vec::new();
        while self.heap.peek().map_or(false, |top| top.at <= now) {
            let Some(entry) = self.heap.pop() else { break };
            if self.cancelled.remove(&entry.id) {
                continue;
            }
            expired.push(entry.what);
        }
        if self.heap.is_empty() {
            self.cancelled.clear();
        }
        expired
    }

    /// Entries in the heap, cancelled ones included.
    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
