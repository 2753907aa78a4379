//! Non-blocking UDP and TCP sockets behind [`NetAddress`] endpoints.
//!
//! Sockets are created through `socket2` so buffer sizes and address reuse
//! can be applied before binding, then handed to the standard library types.
//! Every socket is non-blocking: an operation that would block reports "no
//! data" instead of stalling the frame loop.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

use crate::address::NetAddress;

/// Socket options applied to every socket this module creates.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Kernel receive buffer size in bytes. Default: 256 KiB.
    pub recv_buffer_size: usize,
    /// Kernel send buffer size in bytes. Default: 256 KiB.
    pub send_buffer_size: usize,
    /// Enable `SO_REUSEADDR`. Default: false, so that probing a port range
    /// finds ports already owned by another session.
    pub reuse_addr: bool,
    /// Disable Nagle's algorithm on TCP streams. Default: true.
    pub tcp_nodelay: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: 256 * 1024,
            send_buffer_size: 256 * 1024,
            reuse_addr: false,
            tcp_nodelay: true,
        }
    }
}

fn new_socket(kind: Type, protocol: Protocol, config: &SocketConfig) -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, kind, Some(protocol))?;
    if config.reuse_addr {
        socket.set_reuse_address(true)?;
    }
    // Buffer sizes are advisory; some platforms clamp or refuse them.
    let _ = socket.set_recv_buffer_size(config.recv_buffer_size);
    let _ = socket.set_send_buffer_size(config.send_buffer_size);
    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn local_net_address(addr: io::Result<SocketAddr>) -> io::Result<NetAddress> {
    NetAddress::try_from(addr?).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))
}

// ---------------------------------------------------------------------------
// UDP
// ---------------------------------------------------------------------------

/// A bound, non-blocking UDP socket.
#[derive(Debug)]
pub struct UdpSocketHandle {
    inner: UdpSocket,
    local: NetAddress,
}

impl UdpSocketHandle {
    /// Bind to exactly `addr`.
    pub fn bind(addr: NetAddress, config: &SocketConfig) -> io::Result<Self> {
        let socket = new_socket(Type::DGRAM, Protocol::UDP, config)?;
        socket.bind(&SocketAddr::from(addr).into())?;
        let inner: UdpSocket = socket.into();
        let local = local_net_address(inner.local_addr())?;
        Ok(Self { inner, local })
    }

    /// Bind to the first free port in `addr.port() .. addr.port() + range`.
    ///
    /// A `range` of zero tries only `addr` itself. Returns the error from the
    /// last attempt when every port is taken.
    pub fn bind_in_range(addr: NetAddress, range: u16, config: &SocketConfig) -> io::Result<Self> {
        let mut last_err = None;
        for offset in 0..range.max(1) {
            let Some(port) = addr.port().checked_add(offset) else {
                break;
            };
            match Self::bind(addr.with_port(port), config) {
                Ok(socket) => return Ok(socket),
                Err(e) => {
                    tracing::debug!("UDP bind to {} failed: {}", addr.with_port(port), e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| io::Error::new(ErrorKind::AddrInUse, "no port available")))
    }

    /// The address this socket is bound to.
    pub fn local_address(&self) -> NetAddress {
        self.local
    }

    /// Send one datagram. Returns `Ok(false)` if the OS would have blocked.
    pub fn send_to(&self, bytes: &[u8], to: NetAddress) -> io::Result<bool> {
        match self.inner.send_to(bytes, SocketAddr::from(to)) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Receive one datagram if one is pending.
    ///
    /// Returns `Ok(None)` when nothing is queued. Datagrams from IPv6 peers
    /// are discarded.
    pub fn receive(&self, buf: &mut [u8]) -> io::Result<Option<(usize, NetAddress)>> {
        loop {
            match self.inner.recv_from(buf) {
                Ok((len, SocketAddr::V4(from))) => return Ok(Some((len, from.into()))),
                Ok((_, SocketAddr::V6(_))) => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                // Windows reports ICMP port-unreachable on the next recv.
                Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

/// A non-blocking TCP listener.
#[derive(Debug)]
pub struct TcpListenerHandle {
    inner: TcpListener,
    local: NetAddress,
}

impl TcpListenerHandle {
    /// Bind and listen on `addr`.
    pub fn listen(addr: NetAddress, config: &SocketConfig) -> io::Result<Self> {
        let socket = new_socket(Type::STREAM, Protocol::TCP, config)?;
        socket.bind(&SocketAddr::from(addr).into())?;
        socket.listen(16)?;
        let inner: TcpListener = socket.into();
        let local = local_net_address(inner.local_addr())?;
        Ok(Self { inner, local })
    }

    /// The address this listener is bound to.
    pub fn local_address(&self) -> NetAddress {
        self.local
    }

    /// Accept one pending connection, if any.
    pub fn accept(&self, config: &SocketConfig) -> io::Result<Option<TcpStreamHandle>> {
        match self.inner.accept() {
            Ok((stream, SocketAddr::V4(peer))) => {
                TcpStreamHandle::from_std(stream, peer.into(), config).map(Some)
            }
            Ok((_, SocketAddr::V6(_))) => Ok(None),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// A connected, non-blocking TCP stream.
#[derive(Debug)]
pub struct TcpStreamHandle {
    inner: TcpStream,
    peer: NetAddress,
}

impl TcpStreamHandle {
    /// Connect to `addr`.
    ///
    /// The connect itself blocks for at most `timeout`; the returned stream
    /// is non-blocking.
    pub fn connect(
        addr: NetAddress,
        timeout: std::time::Duration,
        config: &SocketConfig,
    ) -> io::Result<Self> {
        let stream = TcpStream::connect_timeout(&SocketAddr::from(addr), timeout)?;
        Self::from_std(stream, addr, config)
    }

    fn from_std(stream: TcpStream, peer: NetAddress, config: &SocketConfig) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(config.tcp_nodelay)?;
        Ok(Self {
            inner: stream,
            peer,
        })
    }

    /// The remote endpoint.
    pub fn peer_address(&self) -> NetAddress {
        self.peer
    }

    /// Read whatever is available into `buf`.
    ///
    /// `Ok(Some(0))` means the peer closed the stream; `Ok(None)` means no
    /// data is pending.
    pub fn receive(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.inner.read(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write as much of `bytes` as the OS accepts, returning the count.
    pub fn send(&mut self, bytes: &[u8]) -> io::Result<usize> {
        match self.inner.write(bytes) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }
}
