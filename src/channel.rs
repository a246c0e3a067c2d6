use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info, trace};

/// Non-blocking byte/datagram I/O primitive the transport core is driven by.
///
/// All calls fail fast: `receive` returns None instead of blocking when no data is
///  pending, and `send` reports how much was actually written. This keeps the dispatch
///  loop fully cooperative - no call into a channel ever parks the loop thread.
#[cfg_attr(test, automock)]
pub trait Channel: Send + Sync + 'static {
    /// Read one unit into `buf`. None means "no data right now" (would block).
    fn receive(&self, buf: &mut [u8]) -> anyhow::Result<Option<(usize, SocketAddr)>>;

    /// Write `data` towards `to`. Returns the number of bytes accepted by the OS,
    ///  which may be 0 if the socket is not currently writable.
    fn send(&self, data: &[u8], to: SocketAddr) -> anyhow::Result<usize>;

    fn is_open(&self) -> bool;

    fn close(&self);

    fn local_addr(&self) -> SocketAddr;
}

/// A bound UDP socket shared by all connections using the same local endpoint.
pub struct UdpChannel {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    open: AtomicBool,
}

impl UdpChannel {
    pub async fn bind(local: SocketAddr) -> anyhow::Result<UdpChannel> {
        let socket = UdpSocket::bind(local).await?;
        let local = socket.local_addr()?;
        info!("bound UDP channel to {:?}", local);
        Ok(UdpChannel {
            socket: Arc::new(socket),
            local,
            open: AtomicBool::new(true),
        })
    }
}

impl Channel for UdpChannel {
    fn receive(&self, buf: &mut [u8]) -> anyhow::Result<Option<(usize, SocketAddr)>> {
        if !self.is_open() {
            bail!("channel {:?} is closed", self.local);
        }
        match self.socket.try_recv_from(buf) {
            Ok((len, from)) => {
                trace!("received {} bytes from {:?} on {:?}", len, from, self.local);
                Ok(Some((len, from)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn send(&self, data: &[u8], to: SocketAddr) -> anyhow::Result<usize> {
        if !self.is_open() {
            bail!("channel {:?} is closed", self.local);
        }
        match self.socket.try_send_to(data, to) {
            Ok(sent) => {
                trace!("sent {} bytes to {:?} from {:?}", sent, to, self.local);
                Ok(sent)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        debug!("closing UDP channel {:?}", self.local);
        self.open.store(false, Ordering::Release);
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

/// A connected TCP stream serving exactly one peer; the sender address reported by
///  `receive` is always that peer.
pub struct TcpChannel {
    stream: TcpStream,
    local: SocketAddr,
    peer: SocketAddr,
    open: AtomicBool,
}

impl TcpChannel {
    pub async fn connect(remote: SocketAddr) -> anyhow::Result<TcpChannel> {
        let stream = TcpStream::connect(remote).await?;
        stream.set_nodelay(true)?;
        let local = stream.local_addr()?;
        info!("connected TCP channel {:?} -> {:?}", local, remote);
        Ok(TcpChannel {
            stream,
            local,
            peer: remote,
            open: AtomicBool::new(true),
        })
    }
}

impl Channel for TcpChannel {
    fn receive(&self, buf: &mut [u8]) -> anyhow::Result<Option<(usize, SocketAddr)>> {
        if !self.is_open() {
            bail!("channel {:?} is closed", self.local);
        }
        match self.stream.try_read(buf) {
            Ok(0) => {
                self.close();
                bail!("connection {:?} closed by peer", self.peer);
            }
            Ok(len) => Ok(Some((len, self.peer))),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn send(&self, data: &[u8], to: SocketAddr) -> anyhow::Result<usize> {
        if !self.is_open() {
            bail!("channel {:?} is closed", self.local);
        }
        if to != self.peer {
            bail!("stream channel is connected to {:?}, cannot send to {:?}", self.peer, to);
        }
        match self.stream.try_write(data) {
            Ok(sent) => Ok(sent),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        debug!("closing TCP channel {:?} -> {:?}", self.local, self.peer);
        self.open.store(false, Ordering::Release);
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

/// Opens a fresh channel towards a remote endpoint on demand. This is the seam that
///  makes a [crate::connection::Connection] "active": when its channel is gone, the
///  connector is asked for a new one.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, remote: SocketAddr, local: SocketAddr) -> anyhow::Result<Arc<dyn Channel>>;
}

/// Out-dialing TCP connector.
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, remote: SocketAddr, _local: SocketAddr) -> anyhow::Result<Arc<dyn Channel>> {
        Ok(Arc::new(TcpChannel::connect(remote).await?))
    }
}
