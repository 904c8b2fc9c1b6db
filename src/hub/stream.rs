use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::task::Poll;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use crate::config::HubConfig;
use crate::error::HubError;
use crate::hub::{AddressPair, Hub, HubKind};

/// A hub over TCP connections. Outbound connections are keyed by the pair they were requested
///  for, accepted connections by their remote address only.
pub struct StreamHub {
    config: HubConfig,
    listener: Mutex<Option<TcpListener>>,
    streams: Mutex<FxHashMap<AddressPair, Arc<Connection>>>,
}

/// A stream with the buffer its reads go to. Received chunks are split off the buffer, so its
///  allocation is reused once the receiver has dropped them.
struct Connection {
    stream: TcpStream,
    read_buf: Mutex<BytesMut>,
}

impl Connection {
    fn new(stream: TcpStream) -> Arc<Connection> {
        Arc::new(Connection {
            stream,
            read_buf: Mutex::new(BytesMut::new()),
        })
    }
}

impl StreamHub {
    /// a hub that only connects to peers, without accepting connections
    pub fn new(config: HubConfig) -> anyhow::Result<StreamHub> {
        config.validate()?;
        Ok(StreamHub {
            config,
            listener: Mutex::new(None),
            streams: Default::default(),
        })
    }

    pub async fn bind(addr: SocketAddr, config: HubConfig) -> anyhow::Result<StreamHub> {
        config.validate()?;
        let listener = TcpListener::bind(addr).await?;
        info!("stream hub listening on {:?}", listener.local_addr()?);

        Ok(StreamHub {
            config,
            listener: Mutex::new(Some(listener)),
            streams: Default::default(),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().unwrap()
            .as_ref()
            .and_then(|l| l.local_addr().ok())
    }

    fn connection(&self, pair: AddressPair) -> Result<Arc<Connection>, HubError> {
        self.streams.lock().unwrap()
            .get(&pair)
            .cloned()
            .ok_or(HubError::UnknownPair(pair))
    }

    fn drop_stream(&self, pair: AddressPair) {
        if self.streams.lock().unwrap().remove(&pair).is_some() {
            debug!("dropped stream for {}", pair);
        }
    }

    async fn open(&self, pair: AddressPair) -> io::Result<TcpStream> {
        let socket = if pair.remote.is_ipv4() {
            TcpSocket::new_v4()?
        }
        else {
            TcpSocket::new_v6()?
        };
        if let Some(local) = pair.local {
            socket.set_reuseaddr(true)?;
            socket.bind(local)?;
        }

        let stream = socket.connect(pair.remote).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// returns a connection if one is ready to be accepted, without waiting for one
    async fn accept_ready(&self) -> Option<io::Result<(TcpStream, SocketAddr)>> {
        poll_fn(|cx| {
            let listener = self.listener.lock().unwrap();
            match listener.as_ref() {
                None => Poll::Ready(None),
                Some(listener) => match listener.poll_accept(cx) {
                    Poll::Ready(result) => Poll::Ready(Some(result)),
                    Poll::Pending => Poll::Ready(None),
                },
            }
        }).await
    }
}

async fn write_all(stream: &TcpStream, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        stream.writable().await?;
        match stream.try_write(data) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[async_trait]
impl Hub for StreamHub {
    fn kind(&self) -> HubKind {
        HubKind::Stream
    }

    async fn connect(&self, pair: AddressPair) -> Result<(), HubError> {
        if self.streams.lock().unwrap().contains_key(&pair) {
            return Ok(());
        }

        debug!("connecting to {}", pair);
        let stream = timeout(self.config.connect_timeout, self.open(pair)).await
            .map_err(|_| HubError::Timeout)??;
        self.streams.lock().unwrap()
            .insert(pair, Connection::new(stream));
        Ok(())
    }

    async fn incoming(&self) -> Vec<AddressPair> {
        let mut result = Vec::new();
        while let Some(accepted) = self.accept_ready().await {
            match accepted {
                Ok((stream, remote)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("could not set TCP_NODELAY for {}: {}", remote, e);
                    }
                    let pair = AddressPair::remote_only(remote);
                    debug!("accepted connection from {}", pair);
                    self.streams.lock().unwrap()
                        .insert(pair, Connection::new(stream));
                    result.push(pair);
                }
                Err(e) => {
                    warn!("error accepting connection: {}", e);
                    break;
                }
            }
        }
        result
    }

    async fn receive(&self, pair: AddressPair) -> Result<Option<Bytes>, HubError> {
        let connection = self.connection(pair)?;

        let result = {
            let mut buf = connection.read_buf.lock().unwrap();
            buf.reserve(self.config.read_chunk_size);
            connection.stream.try_read_buf(&mut *buf)
                .map(|n| buf.split_to(n).freeze())
        };
        match result {
            Ok(data) if data.is_empty() => {
                self.drop_stream(pair);
                Err(HubError::Closed)
            }
            Ok(data) => {
                trace!("received {} bytes from {}", data.len(), pair);
                Ok(Some(data))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => {
                let e = HubError::from(e);
                if e.is_fatal() {
                    self.drop_stream(pair);
                }
                Err(e)
            }
        }
    }

    async fn send(&self, pair: AddressPair, data: &[u8]) -> Result<(), HubError> {
        let connection = self.connection(pair)?;

        let result = match timeout(self.config.write_timeout, write_all(&connection.stream, data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(HubError::from(e)),
            Err(_) => Err(HubError::Timeout),
        };
        if let Err(e) = &result {
            if e.is_fatal() {
                self.drop_stream(pair);
            }
        }
        result
    }

    async fn disconnect(&self, pair: AddressPair) {
        self.drop_stream(pair);
    }

    async fn close(&self) {
        info!("closing stream hub");
        self.listener.lock().unwrap().take();
        self.streams.lock().unwrap().clear();
    }
}
