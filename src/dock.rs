use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tokio::time::Instant;
use crate::ship::Departure;

/// A departure that is due, ordered by priority and then by enqueue order
struct Berth<H> {
    sequence: u64,
    departure: Departure<H>,
}

impl<H> PartialEq for Berth<H> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl<H> Eq for Berth<H> {}

impl<H> PartialOrd for Berth<H> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<H> Ord for Berth<H> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max heap: lowest priority value and then lowest sequence go first
        other.departure.priority.cmp(&self.departure.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// A departure that is not due yet, ordered by due time
struct Mooring<H> {
    sequence: u64,
    departure: Departure<H>,
}

impl<H> PartialEq for Mooring<H> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl<H> Eq for Mooring<H> {}

impl<H> PartialOrd for Mooring<H> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<H> Ord for Mooring<H> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.departure.due_at.cmp(&self.departure.due_at)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// A stable priority queue of departures: among departures that are due, the most urgent one is
///  returned first, and departures of equal priority are returned in the order they were pushed.
///
/// Departures that are scheduled for later (e.g. retries after a backoff delay) wait separately
///  until they are due, and only then compete on priority.
pub struct Dock<H> {
    next_sequence: u64,
    ready: BinaryHeap<Berth<H>>,
    waiting: BinaryHeap<Mooring<H>>,
}

impl<H> Default for Dock<H> {
    fn default() -> Self {
        Dock {
            next_sequence: 0,
            ready: BinaryHeap::new(),
            waiting: BinaryHeap::new(),
        }
    }
}

impl<H> Dock<H> {
    pub fn new() -> Dock<H> {
        Default::default()
    }

    pub fn push(&mut self, departure: Departure<H>) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.waiting.push(Mooring { sequence, departure });
    }

    fn promote_due(&mut self, now: Instant) {
        while let Some(next) = self.waiting.peek() {
            if !next.departure.is_due(now) {
                break;
            }
            if let Some(Mooring { sequence, departure }) = self.waiting.pop() {
                self.ready.push(Berth { sequence, departure });
            }
        }
    }

    /// Removes and returns the most urgent departure that is due at `now`
    pub fn pop_due(&mut self, now: Instant) -> Option<Departure<H>> {
        self.promote_due(now);
        self.ready.pop()
            .map(|berth| berth.departure)
    }

    /// Removes and returns all departures that are expired at `now`, regardless of whether they
    ///  are due
    pub fn remove_expired(&mut self, now: Instant) -> Vec<Departure<H>> {
        let mut result = Vec::new();

        if self.ready.iter().any(|b| b.departure.is_expired(now)) {
            let (expired, alive): (Vec<_>, Vec<_>) = std::mem::take(&mut self.ready)
                .into_iter()
                .partition(|b| b.departure.is_expired(now));
            self.ready = alive.into();
            result.extend(expired.into_iter().map(|b| b.departure));
        }
        if self.waiting.iter().any(|m| m.departure.is_expired(now)) {
            let (expired, alive): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiting)
                .into_iter()
                .partition(|m| m.departure.is_expired(now));
            self.waiting = alive.into();
            result.extend(expired.into_iter().map(|m| m.departure));
        }

        result.sort_by_key(|d| d.id);
        result
    }

    /// Removes all departures, e.g. because the connection is closed
    pub fn drain(&mut self) -> Vec<Departure<H>> {
        let mut result = self.ready.drain()
            .map(|b| (b.sequence, b.departure))
            .chain(self.waiting.drain().map(|m| (m.sequence, m.departure)))
            .collect::<Vec<_>>();
        result.sort_by_key(|(sequence, _)| *sequence);
        result.into_iter()
            .map(|(_, departure)| departure)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ready.len() + self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
