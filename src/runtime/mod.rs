//! Single-threaded readiness runtime.
//!
//! One thread, one poll (epoll on Linux, kqueue on macOS via mio): the TCP
//! listener, every accepted connection, and the UDP endpoint share the same
//! interest set, so the loop needs no synchronization anywhere.
//!
//! Components:
//! - `socket`: descriptor construction primitives (socket2)
//! - `poller`: readiness multiplexer owning the interest set
//! - `connection`: per-client state machine and the connection table
//! - `event_loop`: the driving loop and echo handlers

mod connection;
mod event_loop;
mod poller;
mod socket;

pub use event_loop::EchoServer;
pub use poller::ShutdownHandle;
