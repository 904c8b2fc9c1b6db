//! The envelopes that travel through a gate: [Departure]s on their way out, [Arrival]s on their
//!  way in.

use std::fmt::{Display, Formatter};
use std::time::Duration;
use tokio::time::Instant;
use crate::hub::AddressPair;
use crate::package::Package;

/// Departure priorities - lower values are more urgent. Any i32 is a valid priority, these are
///  the conventional values.
pub mod priority {
    pub const URGENT: i32 = -1;
    pub const NORMAL: i32 = 0;
    /// for traffic that is only worth sending if there is nothing else, e.g. heartbeats
    pub const SLOWER: i32 = 1;
}

/// Retry budget for application departures unless the caller has a reason to pick another one
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Identifies a departure for correlating the delegate's `on_sent` callback with a `send` call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DepartureId(u64);

impl DepartureId {
    pub fn from_raw(raw: u64) -> DepartureId {
        DepartureId(raw)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }
}

impl Display for DepartureId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
pub struct Departure<H> {
    pub id: DepartureId,
    pub pair: AddressPair,
    pub package: Package<H>,
    pub priority: i32,
    pub retries_left: u32,
    /// number of failed send attempts so far
    pub attempts: u32,
    pub created_at: Instant,
    pub expires_at: Instant,
    /// the departure is not sent before this point in time
    pub due_at: Instant,
}

impl<H> Departure<H> {
    pub fn new(id: DepartureId, pair: AddressPair, package: Package<H>, priority: i32, max_retries: u32, expires_after: Duration) -> Departure<H> {
        let now = Instant::now();
        Departure {
            id,
            pair,
            package,
            priority,
            retries_left: max_retries,
            attempts: 0,
            created_at: now,
            expires_at: now + expires_after,
            due_at: now,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.due_at <= now
    }
}

/// A package that was received on an address pair. This is handed to the delegate exactly once.
#[derive(Debug)]
pub struct Arrival<H> {
    pub pair: AddressPair,
    pub package: Package<H>,
    pub received_at: Instant,
}
