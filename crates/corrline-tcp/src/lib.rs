//! TCP transport adapter: wraps `tokio::net::TcpStream` with
//! `corrline_wire::framed_from_io` to produce `corrline::Peer`s.

use std::io;
use std::net::SocketAddr;

use corrline::Peer;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::info;

/// Dials `addr` and returns a connected [`Peer`] identified by the remote
/// socket address.
pub async fn dial(addr: impl ToSocketAddrs) -> io::Result<Peer> {
    let stream = TcpStream::connect(addr).await?;
    let peer_addr = stream.peer_addr()?;
    stream.set_nodelay(true).ok();
    Ok(Peer::new(peer_addr.to_string(), stream))
}

/// Accepts inbound TCP connections, handing back one [`Peer`] per
/// connection along with its remote address.
pub struct TcpPeerListener {
    inner: TcpListener,
}

impl TcpPeerListener {
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accepts the next connection and wraps it as a [`Peer`].
    pub async fn accept(&self) -> io::Result<(Peer, SocketAddr)> {
        let (stream, remote_addr) = self.inner.accept().await?;
        stream.set_nodelay(true).ok();
        info!(remote = %remote_addr, "accepted tcp peer");
        let peer = Peer::new(remote_addr.to_string(), stream);
        Ok((peer, remote_addr))
    }
}
