//! Connection state machine and table for accepted TCP clients.
//!
//! Each connection owns its stream, its peer address, and a queue of echo
//! bytes the socket has not accepted yet. The table maps poll tokens to
//! connections; its membership mirrors the multiplexer's interest set,
//! minus the listener, datagram, and waker tokens.

use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Token};
use slab::Slab;
use std::net::SocketAddr;

/// Lifecycle state of an established connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Read interest armed, no queued output.
    Reading,
    /// Echo bytes queued; write interest armed and reads paused until the
    /// queue drains.
    Flushing,
    /// Teardown in progress.
    Closing,
}

/// A single accepted client connection.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub state: ConnState,
    /// Echo bytes read from the peer but not yet written back.
    pub pending: BytesMut,
}

impl Connection {
    /// Create a new connection in initial reading state.
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Reading,
            pending: BytesMut::new(),
        }
    }

    /// Queue echo bytes the socket refused and switch to flushing.
    pub fn queue_unsent(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        self.state = ConnState::Flushing;
    }

    /// Drop `n` flushed bytes from the front of the queue.
    pub fn advance_pending(&mut self, n: usize) {
        self.pending.advance(n);
    }

    /// Transition back to reading state.
    pub fn start_reading(&mut self) {
        self.state = ConnState::Reading;
    }

    /// Mark connection for closing.
    pub fn close(&mut self) {
        self.state = ConnState::Closing;
    }

    /// Poll interest matching the current state.
    pub fn interests(&self) -> Interest {
        match self.state {
            ConnState::Flushing => Interest::WRITABLE,
            _ => Interest::READABLE,
        }
    }
}

/// Table of live connections keyed by poll token.
///
/// Slab-backed for O(1) insert, lookup, and remove.
pub struct ConnectionTable {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionTable {
    /// Create a new table with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Insert a new connection, returning its token.
    ///
    /// Returns `None` if the table is at capacity; the connection is
    /// dropped and its socket closed.
    pub fn insert(&mut self, conn: Connection) -> Option<Token> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        Some(Token(self.connections.insert(conn)))
    }

    pub fn lookup(&self, token: Token) -> Option<&Connection> {
        self.connections.get(token.0)
    }

    pub fn lookup_mut(&mut self, token: Token) -> Option<&mut Connection> {
        self.connections.get_mut(token.0)
    }

    /// Remove a connection. Idempotent: removing an absent token is a
    /// no-op returning `None`.
    pub fn remove(&mut self, token: Token) -> Option<Connection> {
        if self.connections.contains(token.0) {
            Some(self.connections.remove(token.0))
        } else {
            None
        }
    }

    pub fn contains(&self, token: Token) -> bool {
        self.connections.contains(token.0)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_connections
    }
}
