//! The echo event loop.
//!
//! One thread multiplexes the TCP listener, every accepted connection, and
//! the UDP endpoint over a single poll. Handlers drain their source until
//! `WouldBlock` (mio arms descriptors edge-triggered), so no ready data is
//! ever stranded waiting for a notification that will not recur.
//!
//! Error policy, applied uniformly:
//! - `WouldBlock` ends a drain, never surfaces as an error
//! - `Interrupted` retries the call
//! - EOF or any other error on a connection tears down that connection only
//! - bind/registration failure at startup propagates out of `bind` and
//!   aborts the process

use crate::config::Config;
use crate::runtime::connection::{ConnState, Connection, ConnectionTable};
use crate::runtime::poller::{Poller, ShutdownHandle, SHUTDOWN_TOKEN};
use crate::runtime::socket;
use mio::net::{TcpListener, UdpSocket};
use mio::{Events, Interest, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const DATAGRAM_TOKEN: Token = Token(usize::MAX - 1);

/// Single-threaded TCP/UDP echo server.
///
/// All state lives in this one context object; nothing is shared and no
/// synchronization is needed. The only suspension point is the poller's
/// wait call.
pub struct EchoServer {
    poller: Poller,
    listener: Option<TcpListener>,
    datagram: Option<UdpSocket>,
    table: ConnectionTable,
    /// Bounded scratch buffer for reads; echo data either goes straight
    /// back out or moves into the connection's pending queue.
    buf: Vec<u8>,
    batch_size: usize,
}

impl EchoServer {
    /// Bind the configured endpoints and register them with the poller.
    ///
    /// Any failure here is fatal: the caller propagates it and the process
    /// exits before the loop starts.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let mut poller = Poller::new()?;

        let listener = if config.transport.serves_tcp() {
            let mut listener = socket::bind_listener(addr, config.backlog)?;
            poller.register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
            info!(addr = %listener.local_addr()?, "TCP listener bound");
            Some(listener)
        } else {
            None
        };

        let datagram = if config.transport.serves_udp() {
            let mut socket = socket::bind_datagram(addr)?;
            poller.register(&mut socket, DATAGRAM_TOKEN, Interest::READABLE)?;
            info!(addr = %socket.local_addr()?, "UDP endpoint bound");
            Some(socket)
        } else {
            None
        };

        Ok(Self {
            poller,
            listener,
            datagram,
            table: ConnectionTable::new(config.max_connections),
            buf: vec![0u8; config.buffer_size],
            batch_size: config.batch_size,
        })
    }

    /// Address the TCP listener actually bound to, if serving TCP.
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Address the UDP endpoint actually bound to, if serving UDP.
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.datagram.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.poller.shutdown_handle()
    }

    /// Run the loop until shutdown is requested.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.batch_size);

        loop {
            self.poller.wait(&mut events)?;
            if self.poller.shutting_down() {
                break;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_ready(),
                    DATAGRAM_TOKEN => self.datagram_ready(),
                    SHUTDOWN_TOKEN => {}
                    token => self.connection_ready(token, event),
                }
            }
        }

        info!(connections = self.table.len(), "Echo loop stopped");
        Ok(())
    }

    /// Drain the accept backlog.
    ///
    /// One readiness event may cover many pending connections; accepting a
    /// single one per wakeup would starve the backlog under bursts.
    fn accept_ready(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };

        loop {
            match socket::accept_one(listener) {
                Ok(Some((stream, peer))) => {
                    let Some(token) = self.table.insert(Connection::new(stream, peer)) else {
                        // Dropping the stream closes the socket.
                        warn!(%peer, "Connection limit reached, rejecting");
                        continue;
                    };

                    if let Some(conn) = self.table.lookup_mut(token) {
                        if let Err(e) =
                            self.poller.register(&mut conn.stream, token, Interest::READABLE)
                        {
                            error!(%peer, error = %e, "Failed to register connection");
                            self.table.remove(token);
                            continue;
                        }
                        debug!(?token, %peer, "Accepted connection");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    break;
                }
            }
        }
    }

    fn connection_ready(&mut self, token: Token, event: &mio::event::Event) {
        if !self.table.contains(token) {
            // Stale event for a connection torn down earlier in this batch.
            trace!(?token, "Event for unknown connection");
            return;
        }

        if event.is_readable() {
            if let Err(e) = self.drain_readable(token) {
                debug!(?token, error = %e, "Connection error");
                self.close_connection(token);
                return;
            }
        }

        if !self.table.contains(token) {
            return;
        }

        if event.is_writable() {
            if let Err(e) = self.flush_pending(token) {
                debug!(?token, error = %e, "Connection error");
                self.close_connection(token);
            }
        }
    }

    /// Read and echo until the socket has nothing more to give.
    ///
    /// Each bounded read is written straight back; bytes the socket refuses
    /// move into the pending queue, write interest is armed, and reading
    /// pauses until the queue drains (backpressure).
    fn drain_readable(&mut self, token: Token) -> io::Result<()> {
        loop {
            let conn = self
                .table
                .lookup_mut(token)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

            if conn.state != ConnState::Reading {
                return Ok(());
            }

            let n = match conn.stream.read(&mut self.buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "peer closed connection",
                    ))
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            let mut offset = 0;
            while offset < n {
                match conn.stream.write(&self.buf[offset..n]) {
                    Ok(0) => {
                        return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"))
                    }
                    Ok(written) => offset += written,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        conn.queue_unsent(&self.buf[offset..n]);
                        let interests = conn.interests();
                        self.poller.register(&mut conn.stream, token, interests)?;
                        trace!(?token, queued = n - offset, "Echo write would block");
                        return Ok(());
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
        }
    }

    /// Flush the pending queue; once empty, re-arm read interest.
    ///
    /// Reregistering re-polls readiness, so data that arrived while the
    /// connection was flushing is reported on the next wait.
    fn flush_pending(&mut self, token: Token) -> io::Result<()> {
        loop {
            let conn = self
                .table
                .lookup_mut(token)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

            if conn.pending.is_empty() {
                conn.start_reading();
                let interests = conn.interests();
                self.poller.register(&mut conn.stream, token, interests)?;
                return Ok(());
            }

            match conn.stream.write(&conn.pending[..]) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"))
                }
                Ok(written) => conn.advance_pending(written),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Tear down a connection: deregister, remove from the table, close.
    ///
    /// All three happen together; the stream's descriptor closes exactly
    /// once when the connection drops. Idempotent: a second call for the
    /// same token is a no-op.
    fn close_connection(&mut self, token: Token) {
        let Some(mut conn) = self.table.remove(token) else {
            return;
        };
        conn.close();
        if let Err(e) = self.poller.deregister(&mut conn.stream, token) {
            warn!(?token, error = %e, "Failed to deregister connection");
        }
        debug!(?token, peer = %conn.peer, "Connection closed");
    }

    /// Drain the datagram socket, echoing each datagram to its sender.
    ///
    /// No per-peer state exists; the sender address recovered with each
    /// receive is the reply address. A reply that would block or fails is
    /// logged and dropped; the process never terminates for a peer-level
    /// failure.
    fn datagram_ready(&mut self) {
        let Some(socket) = self.datagram.as_ref() else {
            return;
        };

        loop {
            match socket.recv_from(&mut self.buf) {
                Ok((n, peer)) => match socket.send_to(&self.buf[..n], peer) {
                    Ok(sent) if sent == n => trace!(%peer, len = n, "Datagram echoed"),
                    Ok(sent) => warn!(%peer, sent, len = n, "Short datagram send"),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        debug!(%peer, "Datagram send would block, dropping reply")
                    }
                    Err(e) => warn!(%peer, error = %e, "Datagram send failed"),
                },
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Datagram receive failed");
                    break;
                }
            }
        }
    }
}
