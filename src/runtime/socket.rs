//! Socket construction primitives.
//!
//! Sockets are built through socket2 so address reuse and the non-blocking
//! flag are set before the descriptor is handed to mio. Every descriptor is
//! owned by its mio wrapper type and closed exactly once, when the wrapper
//! drops.

use mio::net::{TcpListener, TcpStream, UdpSocket};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;

/// Create a bound, listening, non-blocking TCP socket.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(domain_of(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(TcpListener::from_std(socket.into()))
}

/// Create a bound, non-blocking UDP socket.
pub fn bind_datagram(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(domain_of(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into()))
}

fn domain_of(addr: SocketAddr) -> Domain {
    match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    }
}

/// Accept one pending connection, if any.
///
/// An empty backlog is not an error: `WouldBlock` maps to `Ok(None)`.
/// Interrupted accepts are retried.
pub fn accept_one(listener: &TcpListener) -> io::Result<Option<(TcpStream, SocketAddr)>> {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => return Ok(Some((stream, peer))),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
