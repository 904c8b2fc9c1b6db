use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Connection status of a single docker.
///
/// ```ascii
/// Init -> Connecting -> Connected <-> Expired
///     any non-terminal status -> Error | Closed
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GateStatus {
    Init,
    Connecting,
    Connected,
    /// connected, but there was no successful I/O for the configured idle timeout
    Expired,
    Error,
    Closed,
}

impl GateStatus {
    /// Once a connection is in a terminal status, it stays there
    pub fn is_terminal(&self) -> bool {
        matches!(self, GateStatus::Error | GateStatus::Closed)
    }

    /// whether I/O is done on a connection in this status
    pub fn is_ready(&self) -> bool {
        matches!(self, GateStatus::Connected | GateStatus::Expired)
    }

    pub fn can_transition_to(&self, next: GateStatus) -> bool {
        use GateStatus::*;

        match (*self, next) {
            (Error | Closed, _) => false,
            (_, Error | Closed) => true,
            (Init, Connecting) | (Connecting, Connected) | (Connected, Expired) | (Expired, Connected) => true,
            _ => false,
        }
    }
}

/// Tracks a docker's status together with the I/O activity it is derived from
pub struct ConnectionState {
    status: GateStatus,
    last_io: Instant,
    last_heartbeat: Option<Instant>,
}

impl ConnectionState {
    pub fn new(now: Instant) -> ConnectionState {
        ConnectionState {
            status: GateStatus::Init,
            last_io: now,
            last_heartbeat: None,
        }
    }

    pub fn status(&self) -> GateStatus {
        self.status
    }

    /// Returns the (old, new) status pair if the status actually changed
    pub fn transition(&mut self, next: GateStatus, now: Instant) -> Option<(GateStatus, GateStatus)> {
        let old = self.status;
        if old == next {
            return None;
        }
        if !old.can_transition_to(next) {
            if !old.is_terminal() {
                warn!("ignoring invalid status transition {:?} -> {:?}", old, next);
            }
            return None;
        }

        if next == GateStatus::Connected {
            self.last_io = now;
        }
        self.status = next;
        Some((old, next))
    }

    /// registers successful I/O, which revives an expired connection
    pub fn on_io(&mut self, now: Instant) -> Option<(GateStatus, GateStatus)> {
        self.last_io = now;
        if self.status == GateStatus::Expired {
            return self.transition(GateStatus::Connected, now);
        }
        None
    }

    pub fn check_idle(&mut self, now: Instant, idle_timeout: Duration) -> Option<(GateStatus, GateStatus)> {
        if self.status == GateStatus::Connected && now.duration_since(self.last_io) >= idle_timeout {
            return self.transition(GateStatus::Expired, now);
        }
        None
    }

    /// Whether an expired connection should get a heartbeat now. Returning `true` counts as
    ///  sending one.
    pub fn take_heartbeat(&mut self, now: Instant, interval: Duration) -> bool {
        if self.status != GateStatus::Expired {
            return false;
        }
        if self.last_heartbeat.is_some_and(|t| now.duration_since(t) < interval) {
            return false;
        }
        self.last_heartbeat = Some(now);
        true
    }
}
