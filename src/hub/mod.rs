//! The socket abstraction underneath a gate. A hub maps address pairs to live sockets and
//!  provides raw, non-blocking reads and bounded writes. It knows nothing about packages.

pub mod datagram;
pub mod stream;

use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use crate::error::HubError;
use crate::seeker::ResyncPolicy;

/// Identifies a connection by its remote and (if known) local address
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressPair {
    pub remote: SocketAddr,
    pub local: Option<SocketAddr>,
}

impl AddressPair {
    pub fn new(remote: SocketAddr, local: SocketAddr) -> AddressPair {
        AddressPair {
            remote,
            local: Some(local),
        }
    }

    pub fn remote_only(remote: SocketAddr) -> AddressPair {
        AddressPair {
            remote,
            local: None,
        }
    }
}

impl Display for AddressPair {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.local {
            Some(local) => write!(f, "{}<->{}", self.remote, local),
            None => write!(f, "{}", self.remote),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HubKind {
    /// One persistent, ordered connection per pair without message boundaries
    Stream,
    /// Every receive yields one complete datagram
    Datagram,
}

impl HubKind {
    pub fn resync_policy(&self) -> ResyncPolicy {
        match self {
            HubKind::Stream => ResyncPolicy::Iterative,
            HubKind::Datagram => ResyncPolicy::SingleShot,
        }
    }
}

/// A hub is owned by a single gate - no two gates may use the same address pair on the same hub.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Hub: Send + Sync + 'static {
    fn kind(&self) -> HubKind;

    /// Opens the connection for a pair if there is none yet. This is a no-op for transports
    ///  without connections.
    async fn connect(&self, pair: AddressPair) -> Result<(), HubError>;

    /// Returns pairs that were not known to the hub before, i.e. accepted connections or new
    ///  datagram peers
    async fn incoming(&self) -> Vec<AddressPair>;

    /// Returns data that is available for a pair without waiting for more, or `None` if there
    ///  is none
    async fn receive(&self, pair: AddressPair) -> Result<Option<Bytes>, HubError>;

    async fn send(&self, pair: AddressPair, data: &[u8]) -> Result<(), HubError>;

    async fn disconnect(&self, pair: AddressPair);

    /// releases all sockets
    async fn close(&self);
}
