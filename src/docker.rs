//! Per-connection state: framing of inbound bytes and scheduling of outbound departures.
//!
//! A docker is owned and driven exclusively by its gate's drive loop, so there is no
//!  synchronization here. It does not do any I/O itself - the drive loop moves bytes between the
//!  hub and the docker and reports the outcome of sending.

use std::sync::Arc;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::backoff::RetryBackoff;
use crate::dock::Dock;
use crate::error::{GateError, HubError};
use crate::hub::{AddressPair, HubKind};
use crate::package::{Framer, Package, Reaction};
use crate::seeker::{PackageSeeker, Seek};
use crate::ship::{Arrival, Departure, DepartureId};

/// Upper bound for the number of split packages that are collected at the same time. When a part
///  of yet another one arrives, the oldest incomplete package is dropped.
pub const MAX_PENDING_ASSEMBLIES: usize = 16;

/// The result of feeding inbound bytes into a docker
pub struct Feed<H> {
    /// packages for the delegate, in the order they were framed
    pub arrivals: Vec<Arrival<H>>,
    /// transport-internal responses that should be sent back to the peer
    pub replies: Vec<Package<H>>,
    /// number of bytes that were dropped because the protocol is out of sync
    pub desync: Option<usize>,
}

pub enum Outgo<H> {
    Ready(Departure<H>),
    /// the departure's expiry passed while it was waiting to be sent
    Expired(Departure<H>),
}

pub enum SendOutcome<H> {
    Sent(Departure<H>),
    Retrying {
        id: DepartureId,
        attempts: u32,
        due_at: Instant,
    },
    Failed(Departure<H>, GateError),
}

/// the parts of a split package that arrived so far
struct Assembly<H> {
    parts: u32,
    received: FxHashMap<u32, Package<H>>,
    started_at: Instant,
}

pub struct Docker<F: Framer> {
    pair: AddressPair,
    kind: HubKind,
    seeker: Arc<PackageSeeker<F>>,
    backoff: RetryBackoff,
    inbound: BytesMut,
    assemblies: FxHashMap<u64, Assembly<F::Header>>,
    dock: Dock<F::Header>,
}

impl<F: Framer> Docker<F> {
    pub fn new(pair: AddressPair, kind: HubKind, seeker: Arc<PackageSeeker<F>>, backoff: RetryBackoff) -> Docker<F> {
        Docker {
            pair,
            kind,
            seeker,
            backoff,
            inbound: BytesMut::new(),
            assemblies: Default::default(),
            dock: Dock::new(),
        }
    }

    /// number of inbound bytes that are waiting for the rest of their package
    pub fn buffered_len(&self) -> usize {
        self.inbound.len()
    }

    /// number of split packages that are still missing parts
    pub fn pending_assemblies(&self) -> usize {
        self.assemblies.len()
    }

    pub fn pending_departures(&self) -> usize {
        self.dock.len()
    }

    pub fn feed(&mut self, data: &[u8], now: Instant) -> Feed<F::Header> {
        self.inbound.extend_from_slice(data);

        let mut feed = Feed {
            arrivals: Vec::new(),
            replies: Vec::new(),
            desync: None,
        };

        while !self.inbound.is_empty() {
            match self.seeker.take_package(&mut self.inbound) {
                Seek::Desync => {
                    warn!("{}: protocol out of sync, dropping {} bytes", self.pair, self.inbound.len());
                    feed.desync = Some(self.inbound.len());
                    self.inbound.clear();
                    break;
                }
                Seek::Pending { offset } => {
                    if offset > 0 {
                        debug!("{}: skipped {} bytes of garbage", self.pair, offset);
                    }
                    break;
                }
                Seek::Found { value: package, offset } => {
                    if offset > 0 {
                        debug!("{}: skipped {} bytes of garbage before package", self.pair, offset);
                    }
                    trace!("{}: framed package of {} bytes", self.pair, package.len());
                    self.on_package(package, now, &mut feed);
                }
            }
        }

        if self.kind == HubKind::Datagram && !self.inbound.is_empty() {
            // the rest of a datagram can not be continued by the next one
            debug!("{}: discarding {} unframed bytes of datagram", self.pair, self.inbound.len());
            self.inbound.clear();
        }

        feed
    }

    fn on_package(&mut self, package: Package<F::Header>, now: Instant, feed: &mut Feed<F::Header>) {
        let package = match self.seeker.framer().inspect(&package) {
            Reaction::Deliver => package,
            Reaction::Consume => return,
            Reaction::Reply(reply) => {
                feed.replies.push(reply);
                return;
            }
            Reaction::Acknowledge(reply) => {
                feed.replies.push(reply);
                package
            }
            Reaction::Collect { key, index, parts } => {
                if let Some(joined) = self.collect(package, key, index, parts, now) {
                    self.on_package(joined, now, feed);
                }
                return;
            }
        };

        feed.arrivals.push(Arrival {
            pair: self.pair,
            package,
            received_at: now,
        });
    }

    /// Adds a part to its assembly, returning the joined package once the last part arrived
    fn collect(&mut self, package: Package<F::Header>, key: u64, index: u32, parts: u32, now: Instant) -> Option<Package<F::Header>> {
        if index >= parts {
            warn!("{}: dropping part {} of {} for #{}", self.pair, index, parts, key);
            return None;
        }

        if self.assemblies.get(&key).is_some_and(|a| a.parts != parts) {
            warn!("{}: number of parts for #{} changed to {}, starting over", self.pair, key, parts);
            self.assemblies.remove(&key);
        }
        if !self.assemblies.contains_key(&key) && self.assemblies.len() >= MAX_PENDING_ASSEMBLIES {
            let oldest = self.assemblies.iter()
                .min_by_key(|(_, a)| a.started_at)
                .map(|(k, _)| *k);
            if let Some(oldest) = oldest {
                debug!("{}: too many incomplete packages, dropping #{}", self.pair, oldest);
                self.assemblies.remove(&oldest);
            }
        }

        let assembly = self.assemblies.entry(key).or_insert_with(|| Assembly {
            parts,
            received: Default::default(),
            started_at: now,
        });
        assembly.received.insert(index, package);
        trace!("{}: collected part {} of {} for #{}", self.pair, index, parts, key);
        if assembly.received.len() < parts as usize {
            return None;
        }

        let mut received = self.assemblies.remove(&key)?.received;
        let ordered = (0..parts)
            .filter_map(|i| received.remove(&i))
            .collect();
        match self.seeker.framer().join(ordered) {
            Ok(joined) => Some(joined),
            Err(e) => {
                warn!("{}: could not join {} parts for #{}: {}", self.pair, parts, key, e);
                None
            }
        }
    }

    pub fn enqueue(&mut self, departure: Departure<F::Header>) {
        trace!("{}: enqueueing departure {} with priority {}", self.pair, departure.id, departure.priority);
        self.dock.push(departure);
    }

    pub fn next_due(&mut self, now: Instant) -> Option<Outgo<F::Header>> {
        self.dock.pop_due(now)
            .map(|departure| {
                if departure.is_expired(now) {
                    Outgo::Expired(departure)
                }
                else {
                    Outgo::Ready(departure)
                }
            })
    }

    /// removes departures that expired before they could be sent
    pub fn expire(&mut self, now: Instant) -> Vec<Departure<F::Header>> {
        self.dock.remove_expired(now)
    }

    pub fn on_send_result(&mut self, mut departure: Departure<F::Header>, result: Result<(), HubError>, now: Instant) -> SendOutcome<F::Header> {
        let cause = match result {
            Ok(()) => return SendOutcome::Sent(departure),
            Err(e) => e,
        };

        departure.attempts += 1;
        if departure.retries_left == 0 || cause.is_fatal() {
            let attempts = departure.attempts;
            return SendOutcome::Failed(departure, GateError::RetriesExhausted { attempts, cause });
        }

        departure.retries_left -= 1;
        departure.due_at = now + self.backoff.delay_after(departure.attempts);
        debug!("{}: sending departure {} failed ({}), retrying at {:?}", self.pair, departure.id, cause, departure.due_at);

        let outcome = SendOutcome::Retrying {
            id: departure.id,
            attempts: departure.attempts,
            due_at: departure.due_at,
        };
        self.dock.push(departure);
        outcome
    }

    /// removes all departures, e.g. because the connection can no longer be used
    pub fn drain(&mut self) -> Vec<Departure<F::Header>> {
        self.dock.drain()
    }
}
