//! Readiness multiplexer wrapping mio's `Poll`.
//!
//! The poller owns the interest set: every registered token is tracked so
//! that re-registering is idempotent and deregistering an entry the kernel
//! already dropped is harmless. `wait` blocks with no timeout and retries
//! transparently when a signal interrupts it.
//!
//! Shutdown uses a self-pipe: the read end is registered with the poll
//! under a reserved token, and `ShutdownHandle` writes one byte to the
//! write end. Both halves of that are async-signal-safe, and the pending
//! byte guarantees the next wait returns even when the request lands while
//! the loop is busy between waits.
//!
//! mio arms descriptors edge-triggered, so callers must drain a ready
//! source until `WouldBlock` before the next wait.

use mio::event::Source;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashSet;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Token reserved for the self-pipe read end.
pub const SHUTDOWN_TOKEN: Token = Token(usize::MAX - 2);

pub struct Poller {
    poll: Poll,
    /// Tokens currently registered with the kernel.
    registered: HashSet<Token>,
    stop: Arc<AtomicBool>,
    /// Self-pipe read end, registered under `SHUTDOWN_TOKEN`.
    signal_read: OwnedFd,
    signal_write: Arc<OwnedFd>,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let (signal_read, signal_write) = self_pipe()?;

        let raw = signal_read.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&raw), SHUTDOWN_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            registered: HashSet::new(),
            stop: Arc::new(AtomicBool::new(false)),
            signal_read,
            signal_write: Arc::new(signal_write),
        })
    }

    /// Register a source for the given interest.
    ///
    /// Registering a token that is already present becomes a reregister;
    /// the interest set never holds duplicate entries.
    pub fn register<S>(&mut self, source: &mut S, token: Token, interests: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        if self.registered.contains(&token) {
            self.poll.registry().reregister(source, token, interests)
        } else {
            self.poll.registry().register(source, token, interests)?;
            self.registered.insert(token);
            Ok(())
        }
    }

    /// Remove a source from the interest set.
    ///
    /// Tolerates entries the kernel already removed (e.g. on close).
    pub fn deregister<S>(&mut self, source: &mut S, token: Token) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.registered.remove(&token);
        match self.poll.registry().deregister(source) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Block until at least one registered source is ready.
    ///
    /// The shutdown flag is checked before blocking and after every signal
    /// interruption; once set, the call returns with no events. Sources
    /// ready beyond the event capacity are reported on the next call;
    /// nothing is dropped.
    pub fn wait(&mut self, events: &mut Events) -> io::Result<()> {
        loop {
            if self.stop.load(Ordering::Acquire) {
                self.drain_signal_pipe();
                events.clear();
                return Ok(());
            }
            match self.poll.poll(events, None) {
                Ok(()) => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Discard queued wake bytes so the pipe is empty again.
    fn drain_signal_pipe(&self) {
        let mut buf = [0u8; 16];
        loop {
            let n = unsafe {
                libc::read(
                    self.signal_read.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    pub fn shutting_down(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn is_registered(&self, token: Token) -> bool {
        self.registered.contains(&token)
    }

    pub fn registered_count(&self) -> usize {
        self.registered.len()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: Arc::clone(&self.stop),
            signal_write: Arc::clone(&self.signal_write),
        }
    }
}

/// Handle for stopping a blocked event loop from outside it.
#[derive(Clone)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    signal_write: Arc<OwnedFd>,
}

impl ShutdownHandle {
    /// Stop the event loop.
    ///
    /// One atomic store plus one `write(2)` to the self-pipe, both
    /// async-signal-safe, so this may be called from a signal handler. A
    /// full pipe means a wake is already pending, so the write result is
    /// ignored.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        let byte = 1u8;
        let _ = unsafe {
            libc::write(
                self.signal_write.as_raw_fd(),
                &byte as *const u8 as *const libc::c_void,
                1,
            )
        };
    }
}

/// Create a non-blocking, close-on-exec pipe.
fn self_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    for fd in [&read, &write] {
        set_nonblocking_cloexec(fd.as_raw_fd())?;
    }
    Ok((read, write))
}

fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd_flags = libc::fcntl(fd, libc::F_GETFD);
        if fd_flags < 0 || libc::fcntl(fd, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::socket;
    use std::thread;
    use std::time::Duration;

    fn loopback_listener() -> mio::net::TcpListener {
        socket::bind_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap()
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut poller = Poller::new().unwrap();
        let mut listener = loopback_listener();
        let token = Token(0);

        poller.register(&mut listener, token, Interest::READABLE).unwrap();
        poller.register(&mut listener, token, Interest::READABLE).unwrap();

        assert_eq!(poller.registered_count(), 1);
        assert!(poller.is_registered(token));
    }

    #[test]
    fn test_deregister_absent_entry_is_ok() {
        let mut poller = Poller::new().unwrap();
        let mut listener = loopback_listener();

        poller.deregister(&mut listener, Token(7)).unwrap();
        assert_eq!(poller.registered_count(), 0);
    }

    #[test]
    fn test_register_deregister_tracks_interest_set() {
        let mut poller = Poller::new().unwrap();
        let mut listener = loopback_listener();
        let token = Token(3);

        poller.register(&mut listener, token, Interest::READABLE).unwrap();
        assert!(poller.is_registered(token));

        poller.deregister(&mut listener, token).unwrap();
        assert!(!poller.is_registered(token));
        assert_eq!(poller.registered_count(), 0);
    }

    #[test]
    fn test_wait_reports_listener_readable() {
        let mut poller = Poller::new().unwrap();
        let mut listener = loopback_listener();
        let addr = listener.local_addr().unwrap();
        let token = Token(0);

        poller.register(&mut listener, token, Interest::READABLE).unwrap();
        let _client = std::net::TcpStream::connect(addr).unwrap();

        let mut events = Events::with_capacity(8);
        poller.wait(&mut events).unwrap();

        let event = events.iter().next().unwrap();
        assert_eq!(event.token(), token);
        assert!(event.is_readable());
    }

    #[test]
    fn test_shutdown_wakes_blocked_wait() {
        let mut poller = Poller::new().unwrap();
        let handle = poller.shutdown_handle();

        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            handle.shutdown();
        });

        // Nothing registered besides the self-pipe: only the shutdown can
        // unblock this.
        let mut events = Events::with_capacity(8);
        poller.wait(&mut events).unwrap();

        assert!(poller.shutting_down());
        stopper.join().unwrap();
    }

    #[test]
    fn test_shutdown_before_wait_returns_immediately() {
        // A shutdown that lands while the loop is busy between waits must
        // not be lost: the flag is checked before blocking and the pipe
        // byte keeps the poll from sleeping.
        let mut poller = Poller::new().unwrap();
        poller.shutdown_handle().shutdown();

        let mut events = Events::with_capacity(8);
        poller.wait(&mut events).unwrap();

        assert!(poller.shutting_down());
        assert!(events.is_empty());
    }
}
