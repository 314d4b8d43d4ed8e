//! The abstract bidirectional byte channel of spec.md §3, realized over
//! `tokio::net`. TCP backs client and control connections; UDP backs the
//! per-slot data/control relay sockets (§4.4).
//!
//! Grounded on `examples/GrandMax-telemt-pannel/src/transport/middle_proxy.rs`'s
//! async-I/O idiom (`tokio::io::{AsyncReadExt, AsyncWriteExt}`,
//! `timeout()`-wrapped connect) and `socket2` for binding outbound sockets
//! to a specific external source address (spec.md §4.4's `source_addr`).

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::error::{ProxyError, Result};

/// A TCP-backed connection. Owns its socket; `close` is idempotent.
///
/// Used for the listening socket's accepted client connections (§4.3) and
/// could equally back an outbound TCP control connection to a remote
/// EchoLink station, per §3's "TCP for clients and control".
pub struct TcpConnection {
    stream: Option<TcpStream>,
    remote: SocketAddr,
}

impl TcpConnection {
    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        let remote = stream.peer_addr()?;
        Ok(Self {
            stream: Some(stream),
            remote,
        })
    }

    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ProxyError::ConnectTimeout { addr })??;
        Ok(Self::from_stream(stream)?)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream> {
        self.stream.as_mut().ok_or(ProxyError::ConnLost(io::Error::new(
            io::ErrorKind::NotConnected,
            "connection already closed",
        )))
    }

    pub async fn send(&mut self, buf: &[u8]) -> Result<()> {
        self.stream_mut()?
            .write_all(buf)
            .await
            .map_err(classify_io)
    }

    /// Receive exactly `n` bytes, or fail with a connection-lost class of
    /// error if the peer closes early (an `UnexpectedEof` from
    /// `read_exact`).
    pub async fn recv_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.stream_mut()?
            .read_exact(&mut buf)
            .await
            .map_err(classify_io)?;
        Ok(buf)
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(s) = self.stream.as_mut() {
            s.shutdown().await.map_err(classify_io)?;
        }
        Ok(())
    }

    /// Idempotent: drops the underlying socket, if any.
    pub fn close(&mut self) {
        self.stream = None;
    }
}

fn classify_io(e: io::Error) -> ProxyError {
    match e.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => ProxyError::ConnLost(e),
        _ => ProxyError::Io(e),
    }
}

/// Bind a TCP listener to `bind_addr:port`; `bind_addr = None` binds all
/// interfaces (spec.md §6).
pub async fn listen(bind_addr: Option<IpAddr>, port: u16) -> Result<TcpListener> {
    let ip = bind_addr.unwrap_or_else(|| IpAddr::from([0, 0, 0, 0]));
    let addr = SocketAddr::new(ip, port);
    TcpListener::bind(addr).await.map_err(ProxyError::Io)
}

/// Bind a UDP socket to a specific external source address with an
/// ephemeral port, as each [`crate::slot::ProxySlot`] needs for its
/// outbound data/control sockets (spec.md §4.4).
///
/// Uses `socket2` (rather than `tokio::net::UdpSocket::bind` directly) so
/// `SO_REUSEADDR` can be set before binding, matching a multi-slot proxy
/// that may re-bind the same external IP across short-lived sessions.
pub fn bind_udp_external(source_addr: IpAddr) -> Result<UdpSocket> {
    let domain = match source_addr {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::new(source_addr, 0).into())?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(ProxyError::Io)
}
