use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use crate::config::HubConfig;
use crate::error::HubError;
use crate::hub::{AddressPair, Hub, HubKind};

/// A hub over a single UDP socket that is shared by all peers. Datagrams are read from the
///  socket on demand and queued per peer address until the pair's docker asks for them.
pub struct DatagramHub {
    config: HubConfig,
    local_addr: SocketAddr,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    peers: Mutex<Peers>,
}

#[derive(Default)]
struct Peers {
    known: FxHashSet<SocketAddr>,
    inboxes: FxHashMap<SocketAddr, VecDeque<Bytes>>,
    discovered: Vec<AddressPair>,
}

impl DatagramHub {
    pub async fn bind(addr: SocketAddr, config: HubConfig) -> anyhow::Result<DatagramHub> {
        config.validate()?;
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        info!("datagram hub bound to {:?}", local_addr);

        Ok(DatagramHub {
            config,
            local_addr,
            socket: Mutex::new(Some(Arc::new(socket))),
            peers: Default::default(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn socket(&self) -> Result<Arc<UdpSocket>, HubError> {
        self.socket.lock().unwrap()
            .clone()
            .ok_or(HubError::Closed)
    }

    /// moves datagrams that are waiting in the socket into the peers' inboxes
    fn pump(&self, socket: &UdpSocket) {
        let mut buf = vec![0u8; self.config.max_datagram_size];

        for _ in 0..self.config.max_datagrams_per_pump {
            match socket.try_recv_from(&mut buf) {
                Ok((len, from)) => {
                    trace!("received datagram of {} bytes from {:?}", len, from);
                    let mut peers = self.peers.lock().unwrap();
                    if peers.known.insert(from) {
                        debug!("new datagram peer {:?}", from);
                        peers.discovered.push(AddressPair::new(from, self.local_addr));
                    }
                    peers.inboxes.entry(from)
                        .or_default()
                        .push_back(Bytes::copy_from_slice(&buf[..len]));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    // e.g. ICMP 'port unreachable' for an earlier send, reported on some platforms
                    debug!("error reading from datagram socket: {}", e);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Hub for DatagramHub {
    fn kind(&self) -> HubKind {
        HubKind::Datagram
    }

    async fn connect(&self, pair: AddressPair) -> Result<(), HubError> {
        self.socket()?;
        self.peers.lock().unwrap()
            .known
            .insert(pair.remote);
        Ok(())
    }

    async fn incoming(&self) -> Vec<AddressPair> {
        if let Ok(socket) = self.socket() {
            self.pump(&socket);
        }
        std::mem::take(&mut self.peers.lock().unwrap().discovered)
    }

    async fn receive(&self, pair: AddressPair) -> Result<Option<Bytes>, HubError> {
        let socket = self.socket()?;
        self.pump(&socket);

        Ok(self.peers.lock().unwrap()
            .inboxes
            .get_mut(&pair.remote)
            .and_then(|inbox| inbox.pop_front()))
    }

    async fn send(&self, pair: AddressPair, data: &[u8]) -> Result<(), HubError> {
        let socket = self.socket()?;

        let sent = timeout(self.config.write_timeout, socket.send_to(data, pair.remote)).await
            .map_err(|_| HubError::Timeout)??;
        if sent != data.len() {
            warn!("datagram to {} was truncated from {} to {} bytes", pair, data.len(), sent);
            return Err(io::Error::other("truncated datagram").into());
        }
        Ok(())
    }

    async fn disconnect(&self, pair: AddressPair) {
        let mut peers = self.peers.lock().unwrap();
        peers.known.remove(&pair.remote);
        peers.inboxes.remove(&pair.remote);
    }

    async fn close(&self) {
        info!("closing datagram hub on {:?}", self.local_addr);
        self.socket.lock().unwrap().take();
        *self.peers.lock().unwrap() = Default::default();
    }
}
