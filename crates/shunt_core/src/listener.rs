//! Shared accept path.
//!
//! All listening sockets live in one readiness set whose descriptor
//! every worker watches from its own poll. Whichever worker wakes first
//! drains the pending accepts and hands each connection to the worker
//! picked by the assignment policy, so accept bursts spread across the
//! pool instead of piling onto one thread.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;
use tracing::{debug, warn};

struct Inner {
    poll: Poll,
    events: Events,
    listeners: Vec<TcpListener>,
}

/// The worker-shared set of listening sockets.
pub struct ListenerSet {
    inner: Mutex<Inner>,
    fd: RawFd,
    addrs: Mutex<Vec<SocketAddr>>,
}

impl ListenerSet {
    pub fn new() -> std::io::Result<Self> {
        let poll = Poll::new()?;
        let fd = poll.as_raw_fd();
        Ok(Self {
            inner: Mutex::new(Inner {
                poll,
                events: Events::with_capacity(16),
                listeners: Vec::new(),
            }),
            fd,
            addrs: Mutex::new(Vec::new()),
        })
    }

    /// The raw descriptor each worker registers in its own poll.
    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Bind and register one listening socket.
    pub fn add(&self, addr: SocketAddr) -> std::io::Result<SocketAddr> {
        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let local = std_listener.local_addr()?;
        let mut listener = TcpListener::from_std(std_listener);
        let mut inner = self.inner.lock();
        let token = Token(inner.listeners.len());
        inner
            .poll
            .registry()
            .register(&mut listener, token, Interest::READABLE)?;
        inner.listeners.push(listener);
        self.addrs.lock().push(local);
        debug!(addr = %local, "listener registered");
        Ok(local)
    }

    /// Addresses actually bound (useful when binding port 0).
    pub fn bound_addrs(&self) -> Vec<SocketAddr> {
        self.addrs.lock().clone()
    }

    /// Drain every pending accept. Contention is resolved by the lock:
    /// one worker drains, the rest see nothing and go back to their
    /// loops. Returns the accepted connections with peer addresses.
    pub fn accept_pending(&self) -> Vec<(TcpStream, SocketAddr)> {
        let Some(mut inner) = self.inner.try_lock() else {
            return Vec::new();
        };
        let inner = &mut *inner;
        let mut accepted = Vec::new();
        loop {
            if inner
                .poll
                .poll(&mut inner.events, Some(Duration::ZERO))
                .is_err()
            {
                break;
            }
            if inner.events.is_empty() {
                break;
            }
            for event in inner.events.iter() {
                let Some(listener) = inner.listeners.get(event.token().0) else {
                    continue;
                };
                loop {
                    match listener.accept() {
                        Ok((stream, peer)) => accepted.push((stream, peer)),
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            break;
                        }
                    }
                }
            }
        }
        accepted
    }
}
